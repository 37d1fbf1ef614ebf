//! Receiver side of a credit-paced file transfer over an unreliable notification
//!  channel, as exposed by a constrained BLE peripheral (a voice logger in the
//!  original deployment).
//!
//! The transport delivers small raw frames with no ordering, no retransmission and
//!  no built-in flow control - frames may arrive out of order, duplicated, or not
//!  at all. This crate rebuilds a single ordered byte stream out of that, and paces
//!  the sender through single-byte credit grants written back on a control channel.
//!
//! ## Design goals
//!
//! * Favor completing the transfer over byte-perfect integrity: there is no
//!   retransmission mechanism in the protocol, so data that arrived corrupted is
//!   kept and the corruption is surfaced to the caller, and gaps that will
//!   never close are skipped rather than waited for indefinitely
//! * Bound receiver memory: the reorder buffer has a configured cap, evicting the
//!   lowest sequence numbers first when it overflows - every such loss is reported,
//!   never silent
//! * All protocol constants (credit cadence, gap thresholds, timeouts) are
//!   configuration with documented defaults - they encode the implicit contract
//!   with the sender's firmware
//! * The notification subscription is released on every exit path, including
//!   external cancellation mid-transfer
//!
//! ## Frame format
//!
//! Each notification frame is at most 8 + 236 bytes, all numbers little-endian:
//!
//! ```ascii
//! 0: sequence number (u32) - assigned monotonically by the sender starting at 0
//! 4: payload length (u16) - at most 236
//! 6: checksum (u16) - CRC-16/CCITT-FALSE over the payload only
//! 8: payload
//! ```
//!
//! A frame with `length == 0 && checksum == 0` is the end marker; its sequence
//!  field carries the final sequence number the sender observed.
//!
//! ## Flow control
//!
//! The sender transmits one packet per outstanding credit unit. The receiver
//!  grants an initial burst of 64 credits on subscription, 2 further credits for
//!  every 2 consumed packets, and a boost of 32 when the transfer stalls. Grants
//!  are fire-and-forget writes: a lost grant only delays the transfer, so write
//!  failures are logged and counted but never abort the session.

pub mod config;
pub mod flow_control;
pub mod link;
pub mod packet;
pub mod persist;
pub mod reorder_buffer;
pub mod session;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
