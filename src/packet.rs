use anyhow::bail;
use bytes::Buf;
use crc::Crc;

/// Fixed frame header: `u32 seq | u16 len | u16 checksum`, little-endian.
pub const HEADER_LEN: usize = 8;

/// The peripheral notifies at most 244 bytes at a time, leaving this much payload
///  after the header.
pub const MAX_PAYLOAD_LEN: usize = 236;

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, MSB first) - the variant the
///  device firmware computes.
const CRC16: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_3740);

/// The payload checksum as the sender is expected to have stamped it.
pub fn payload_checksum(payload: &[u8]) -> u16 {
    CRC16.checksum(payload)
}

/// A validated notification frame.
///
/// NB: checksum *verification* is not part of parsing. The protocol has no
///  retransmission, so a corrupted payload is still worth keeping - the session
///  compares [`payload_checksum`] against the stamped value and surfaces a
///  mismatch as an integrity event instead of rejecting the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data {
        seq: u32,
        checksum: u16,
        payload: Vec<u8>,
    },
    /// Distinguished end-of-transfer marker (`len == 0 && checksum == 0`).
    ///  `final_seq` is the last sequence number the sender observed.
    End { final_seq: u32 },
}

impl Packet {
    /// Parse a raw frame, or reject it without mutating any other state.
    ///
    /// Parsing is deterministic: the same bytes always yield the same result.
    pub fn try_parse(frame: &[u8]) -> anyhow::Result<Packet> {
        if frame.len() < HEADER_LEN {
            bail!("header truncated: frame has only {} bytes", frame.len());
        }

        let mut buf = frame;
        let seq = buf.get_u32_le();
        let len = buf.get_u16_le();
        let checksum = buf.get_u16_le();

        if len == 0 && checksum == 0 {
            return Ok(Packet::End { final_seq: seq });
        }

        if len as usize > MAX_PAYLOAD_LEN {
            bail!(
                "oversized payload: header declares {} bytes, maximum is {}",
                len,
                MAX_PAYLOAD_LEN
            );
        }
        if buf.remaining() != len as usize {
            bail!(
                "length mismatch: header declares {} payload bytes, frame carries {}",
                len,
                buf.remaining()
            );
        }

        Ok(Packet::Data {
            seq,
            checksum,
            payload: buf.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn frame(seq: u32, len: u16, checksum: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&seq.to_le_bytes());
        f.extend_from_slice(&len.to_le_bytes());
        f.extend_from_slice(&checksum.to_le_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[rstest]
    #[case::regular(frame(7, 3, 0x1234, b"abc"), Some(Packet::Data { seq: 7, checksum: 0x1234, payload: b"abc".to_vec() }))]
    #[case::empty_frame(vec![], None)]
    #[case::truncated_header(frame(7, 3, 0x1234, b"abc")[..7].to_vec(), None)]
    #[case::header_only_nonzero_len(frame(7, 3, 0x1234, b""), None)]
    #[case::payload_shorter_than_declared(frame(7, 5, 0x1234, b"abc"), None)]
    #[case::payload_longer_than_declared(frame(7, 2, 0x1234, b"abc"), None)]
    #[case::oversized_declared_len(frame(7, 237, 0x1234, &[0u8; 237]), None)]
    #[case::end_marker(frame(41, 0, 0, b""), Some(Packet::End { final_seq: 41 }))]
    #[case::end_marker_with_trailing_bytes(frame(41, 0, 0, b"xy"), Some(Packet::End { final_seq: 41 }))]
    #[case::zero_len_nonzero_checksum_is_not_end(frame(41, 0, 9, b""), Some(Packet::Data { seq: 41, checksum: 9, payload: vec![] }))]
    fn test_try_parse(#[case] raw: Vec<u8>, #[case] expected: Option<Packet>) {
        match Packet::try_parse(&raw) {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(e) => {
                println!("{}", e);
                assert!(expected.is_none());
            }
        }
    }

    #[test]
    fn test_parse_is_deterministic() {
        let raw = frame(3, 4, payload_checksum(b"wxyz"), b"wxyz");
        let first = Packet::try_parse(&raw).unwrap();
        let second = Packet::try_parse(&raw).unwrap();
        assert_eq!(first, second);
    }

    #[rstest]
    #[case::check_vector(b"123456789".as_slice(), 0x29b1)]
    #[case::empty(b"".as_slice(), 0xffff)]
    fn test_payload_checksum(#[case] payload: &[u8], #[case] expected: u16) {
        assert_eq!(payload_checksum(payload), expected);
        // idempotence of validation
        assert_eq!(payload_checksum(payload), expected);
    }
}
