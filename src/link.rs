use anyhow::bail;
use async_trait::async_trait;
use bytes::Buf;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

/// Abstraction over the peripheral connection, introduced to keep the transport
///  stack (scanning, connecting, GATT plumbing) out of the session core and to
///  facilitate mocking it away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeripheralLink: Send + Sync + 'static {
    /// Subscribe to the data notifications. Frames arrive on the returned channel
    ///  at-least-once per sender transmission, in no particular order and possibly
    ///  duplicated. The sender half is dropped when the peripheral disconnects.
    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<Vec<u8>>>;

    /// Release the notification subscription.
    async fn unsubscribe(&self);

    /// Single-byte credit grant on the control channel, fire-and-forget - no
    ///  acknowledgement is read back.
    async fn write_credits(&self, credits: u8) -> anyhow::Result<()>;

    /// One-time metadata read: `[u32 LE size][UTF-8 name, NUL-terminated or
    ///  NUL-padded]`.
    async fn read_file_info(&self) -> anyhow::Result<Vec<u8>>;
}

/// Parsed result of the metadata read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u32,
    pub name: String,
}

impl FileInfo {
    pub fn try_parse(raw: &[u8]) -> anyhow::Result<FileInfo> {
        if raw.len() < 4 {
            bail!("file info truncated: {} bytes", raw.len());
        }

        let mut buf = raw;
        let size = buf.get_u32_le();

        let name_end = buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(buf.len());
        let name = std::str::from_utf8(&buf[..name_end])?.to_string();

        Ok(FileInfo { size, name })
    }
}
