use crate::config::TransferConfig;
use crate::link::PeripheralLink;
use std::sync::Arc;
use tracing::{trace, warn};

/// Credit issuance policy: an initial burst at session start, a fixed cadence per
///  consumed packet, and a boost when the transfer stalls.
///
/// All grants are fire-and-forget writes on the control channel. The loss of a
///  grant only delays the transfer, it never corrupts it, so write failures are
///  counted and logged but never propagated.
pub struct FlowController {
    link: Arc<dyn PeripheralLink>,

    initial_credits: u8,
    grant_interval_packets: u64,
    credits_per_grant: u8,
    stall_credits: u8,

    packets_consumed: u64,
    credits_granted: u64,
    failed_writes: u64,
}

impl FlowController {
    pub fn new(link: Arc<dyn PeripheralLink>, config: &TransferConfig) -> FlowController {
        FlowController {
            link,
            initial_credits: config.initial_credits,
            grant_interval_packets: config.grant_interval_packets,
            credits_per_grant: config.credits_per_grant,
            stall_credits: config.stall_credits,
            packets_consumed: 0,
            credits_granted: 0,
            failed_writes: 0,
        }
    }

    /// The burst that lets the sender start transmitting at full speed.
    pub async fn grant_initial_burst(&mut self) {
        self.grant(self.initial_credits).await;
    }

    /// Called for every consumed packet; grants at the configured cadence.
    pub async fn on_packet_consumed(&mut self) {
        self.packets_consumed += 1;
        if self.packets_consumed % self.grant_interval_packets == 0 {
            self.grant(self.credits_per_grant).await;
        }
    }

    /// Extra credits on stall, independent of the cadence - the stall may simply
    ///  mean the sender ran out of credit.
    pub async fn on_stall(&mut self) {
        self.grant(self.stall_credits).await;
    }

    /// Total credits successfully granted; never decreases.
    pub fn credits_granted(&self) -> u64 {
        self.credits_granted
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes
    }

    async fn grant(&mut self, credits: u8) {
        trace!("granting {} credits", credits);
        match self.link.write_credits(credits).await {
            Ok(()) => self.credits_granted += credits as u64,
            Err(e) => {
                self.failed_writes += 1;
                warn!("credit grant of {} dropped: {}", credits, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockPeripheralLink;
    use anyhow::anyhow;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_cadence_grants_every_second_packet() {
        let mut link = MockPeripheralLink::new();
        link.expect_write_credits()
            .with(eq(2))
            .times(2)
            .returning(|_| Ok(()));

        let mut flow = FlowController::new(Arc::new(link), &TransferConfig::default());
        for _ in 0..5 {
            flow.on_packet_consumed().await;
        }

        // grants at packets 2 and 4, none yet for packet 5
        assert_eq!(flow.credits_granted(), 4);
        assert_eq!(flow.failed_writes(), 0);
    }

    #[tokio::test]
    async fn test_initial_burst_and_stall_boost() {
        let mut link = MockPeripheralLink::new();
        link.expect_write_credits()
            .with(eq(64))
            .times(1)
            .returning(|_| Ok(()));
        link.expect_write_credits()
            .with(eq(32))
            .times(1)
            .returning(|_| Ok(()));

        let mut flow = FlowController::new(Arc::new(link), &TransferConfig::default());
        flow.grant_initial_burst().await;
        flow.on_stall().await;

        assert_eq!(flow.credits_granted(), 96);
    }

    #[tokio::test]
    async fn test_write_failures_are_counted_not_propagated() {
        let mut link = MockPeripheralLink::new();
        link.expect_write_credits()
            .times(3)
            .returning(|_| Err(anyhow!("peripheral busy")));

        let mut flow = FlowController::new(Arc::new(link), &TransferConfig::default());
        flow.grant_initial_burst().await;
        for _ in 0..4 {
            flow.on_packet_consumed().await;
        }

        assert_eq!(flow.credits_granted(), 0);
        assert_eq!(flow.failed_writes(), 3);
    }
}
