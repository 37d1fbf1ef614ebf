use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Outcome of [`ReorderBuffer::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// The packet was the next expected one; it and any now-contiguous buffered
    ///  run were flushed to the output.
    Flushed { packets: u32, bytes: usize },
    /// Out-of-order - stored until the gap before it closes (or is skipped).
    Buffered,
    /// Below the expected sequence number, i.e. already flushed - dropped.
    Stale,
    /// Already buffered out-of-order - dropped.
    Duplicate,
}

/// Holds out-of-order payloads keyed by sequence number and flushes contiguous
///  runs into the output stream.
///
/// Invariants:
/// * no entry for `seq < expected_seq` ever persists - stale packets are
///   discarded, never buffered
/// * the buffer never holds more than the configured cap after an admit; on
///   overflow the lowest sequence numbers are evicted first, and every eviction
///   is reported
/// * `expected_seq` only ever moves forward, either by flushing or by an explicit
///   [`skip_to`](Self::skip_to)
///
/// Gap handling is deliberately *not* automatic here: whether to force-advance
///  past a gap is the session's decision, based on the minimum buffered sequence
///  number and the buffer size this type exposes.
pub struct ReorderBuffer {
    expected_seq: u32,
    buffered: BTreeMap<u32, Vec<u8>>,
    max_buffered: usize,
    evicted_packets: u64,
}

impl ReorderBuffer {
    pub fn new(max_buffered: usize) -> ReorderBuffer {
        ReorderBuffer {
            expected_seq: 0,
            buffered: BTreeMap::default(),
            max_buffered,
            evicted_packets: 0,
        }
    }

    /// The next sequence number that would flush directly to the output.
    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn min_buffered_seq(&self) -> Option<u32> {
        self.buffered.keys().next().copied()
    }

    /// Number of buffered payloads lost to overflow eviction so far.
    pub fn evicted_packets(&self) -> u64 {
        self.evicted_packets
    }

    /// Admit one validated payload, appending whatever becomes contiguous to `out`.
    pub fn admit(&mut self, seq: u32, payload: Vec<u8>, out: &mut Vec<u8>) -> Admit {
        if seq < self.expected_seq {
            debug!(
                "packet #{} is below the expected sequence #{} - dropping stale duplicate",
                seq, self.expected_seq
            );
            return Admit::Stale;
        }

        if seq == self.expected_seq {
            let mut bytes = payload.len();
            out.extend_from_slice(&payload);
            self.expected_seq += 1;

            let (run_packets, run_bytes) = self.drain_contiguous(out);
            bytes += run_bytes;

            trace!(
                "packet #{} flushed {} packets / {} bytes, expected sequence now #{}",
                seq,
                run_packets + 1,
                bytes,
                self.expected_seq
            );
            return Admit::Flushed {
                packets: run_packets + 1,
                bytes,
            };
        }

        if self.buffered.contains_key(&seq) {
            debug!("packet #{} is already buffered - dropping duplicate", seq);
            return Admit::Duplicate;
        }

        trace!(
            "packet #{} is ahead of expected #{} - buffering",
            seq,
            self.expected_seq
        );
        self.buffered.insert(seq, payload);
        self.evict_overflow();
        Admit::Buffered
    }

    /// Force the expected sequence forward to `seq` (forward only; a backward or
    ///  no-op target is ignored) and flush the now-contiguous run. Returns the
    ///  flushed packet and byte counts.
    ///
    /// Buffered entries below the new position can never become contiguous any
    ///  more and are discarded with a report.
    pub fn skip_to(&mut self, seq: u32, out: &mut Vec<u8>) -> (u32, usize) {
        if seq <= self.expected_seq {
            return (0, 0);
        }

        while let Some((&buffered_seq, _)) = self.buffered.first_key_value() {
            if buffered_seq >= seq {
                break;
            }
            self.buffered.remove(&buffered_seq);
            self.evicted_packets += 1;
            warn!(
                "buffered packet #{} is below the skip target #{} - discarding",
                buffered_seq, seq
            );
        }

        self.expected_seq = seq;
        self.drain_contiguous(out)
    }

    /// Flush buffered payloads while the expected sequence is present.
    fn drain_contiguous(&mut self, out: &mut Vec<u8>) -> (u32, usize) {
        let mut packets = 0u32;
        let mut bytes = 0usize;
        while let Some(payload) = self.buffered.remove(&self.expected_seq) {
            bytes += payload.len();
            out.extend_from_slice(&payload);
            self.expected_seq += 1;
            packets += 1;
        }
        (packets, bytes)
    }

    fn evict_overflow(&mut self) {
        if self.buffered.len() <= self.max_buffered {
            return;
        }

        while self.buffered.len() > self.max_buffered / 2 {
            match self.buffered.pop_first() {
                Some((seq, payload)) => {
                    self.evicted_packets += 1;
                    warn!(
                        "reorder buffer overflow - evicting buffered packet #{} ({} bytes)",
                        seq,
                        payload.len()
                    );
                }
                None => break,
            }
        }
    }
}
