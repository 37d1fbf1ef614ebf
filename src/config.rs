use anyhow::bail;
use std::time::Duration;

/// Tuning knobs for a transfer session.
///
/// The defaults are not arbitrary: the credit cadence and the gap thresholds encode
///  the implicit protocol contract with the sender's firmware, so they should only
///  be changed in lockstep with the peripheral.
pub struct TransferConfig {
    /// Credits granted right after subscribing, before any packet arrives. A large
    ///  burst lets the sender transmit at full speed from the start.
    pub initial_credits: u8,

    /// Grant [`credits_per_grant`](Self::credits_per_grant) after every this many
    ///  consumed packets.
    pub grant_interval_packets: u64,

    /// Credits per regular cadence grant.
    pub credits_per_grant: u8,

    /// Extra credits granted when the transfer stalls, independent of the cadence.
    pub stall_credits: u8,

    /// Maximum number of out-of-order packets held in the reorder buffer. On
    ///  overflow the lowest sequence numbers are evicted until at most half this
    ///  many remain.
    pub max_buffered_packets: usize,

    /// An incoming packet whose sequence number exceeds the next expected one by
    ///  more than this is taken as evidence of unrecoverable loss, and the expected
    ///  sequence is skipped forward immediately.
    pub large_gap_threshold: u32,

    /// While stalled, a gap of at most this many sequence numbers between the next
    ///  expected packet and the lowest buffered one is skipped.
    pub stall_skip_threshold: u32,

    /// Quantum at which the driving loop samples the received byte count.
    pub sample_interval: Duration,

    /// Number of consecutive unchanged samples before the transfer counts as
    ///  stalled. With the default 0.5s quantum, 20 samples is roughly 10 seconds.
    pub stall_sample_count: u32,

    /// Fraction of the declared size at which a stalled transfer is accepted as
    ///  done. A deliberate tolerance for senders that stop just shy of the declared
    ///  size.
    pub accept_threshold: f64,

    /// Hard deadline: if not a single byte arrives within this much time of
    ///  subscribing, the session gives up.
    pub zero_byte_timeout: Duration,

    /// Minimum interval between published progress snapshots.
    pub progress_throttle: Duration,
}

impl Default for TransferConfig {
    fn default() -> TransferConfig {
        TransferConfig {
            initial_credits: 64,
            grant_interval_packets: 2,
            credits_per_grant: 2,
            stall_credits: 32,
            max_buffered_packets: 100,
            large_gap_threshold: 50,
            stall_skip_threshold: 10,
            sample_interval: Duration::from_millis(500),
            stall_sample_count: 20,
            accept_threshold: 0.99,
            zero_byte_timeout: Duration::from_secs(60),
            progress_throttle: Duration::from_millis(100),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_credits == 0 {
            bail!("initial credit burst must be positive - the sender never transmits without credit");
        }
        if self.grant_interval_packets == 0 || self.credits_per_grant == 0 {
            bail!("credit cadence must grant a positive number of credits at a positive interval");
        }
        if self.max_buffered_packets < 2 {
            bail!("reorder buffer must hold at least 2 packets");
        }
        if !(self.accept_threshold > 0.0 && self.accept_threshold <= 1.0) {
            bail!("accept threshold must be in (0, 1]");
        }
        if self.sample_interval.is_zero() {
            bail!("sample interval must be positive");
        }
        if self.stall_sample_count == 0 {
            bail!("stall sample count must be positive");
        }
        if self.zero_byte_timeout < self.sample_interval {
            bail!("zero-byte timeout must be at least one sample interval");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TransferConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate_values() {
        let mut config = TransferConfig::default();
        config.initial_credits = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.grant_interval_packets = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.credits_per_grant = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.max_buffered_packets = 1;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.accept_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.accept_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.sample_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.stall_sample_count = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.zero_byte_timeout = Duration::from_millis(100);
        assert!(config.validate().is_err());
    }
}
