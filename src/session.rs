use crate::config::TransferConfig;
use crate::flow_control::FlowController;
use crate::link::{FileInfo, PeripheralLink};
use crate::packet::{payload_checksum, Packet};
use crate::reorder_buffer::{Admit, ReorderBuffer};
use anyhow::bail;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};

/// Progress snapshot, published through the watch channel at most once per
///  configured throttle interval while the transfer is running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    pub expected_seq: u32,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub packets_seen: u64,
    pub buffered_count: usize,
    pub throughput_bps: f64,
    /// true once the end marker has been seen
    pub complete: bool,
}

/// Counters for conditions that degraded the transfer without aborting it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// malformed frames (truncated header, length mismatch) - discarded
    pub rejected_frames: u64,
    /// packets whose stamped checksum did not match the payload - kept anyway
    pub checksum_mismatches: u64,
    /// buffered payloads lost to overflow eviction or gap skips
    pub evicted_packets: u64,
    /// forced forward advances of the expected sequence number
    pub gap_skips: u64,
    /// sequence numbers jumped over by gap skips - data presumed lost
    pub skipped_sequences: u64,
    /// credit grants dropped because the control channel write failed
    pub failed_credit_writes: u64,
}

/// Final report of a transfer that produced data.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    /// file name as declared by the peripheral; collision-safe naming is the
    ///  persistence collaborator's business
    pub file_name: String,
    /// the assembled byte stream
    pub data: Vec<u8>,
    pub bytes_received: u64,
    /// size the peripheral declared in its metadata
    pub declared_size: u64,
    pub packet_count: u64,
    pub elapsed: Duration,
    pub throughput_bps: f64,
    /// out-of-order packets still buffered and unflushed at termination
    pub buffered_remaining: usize,
    pub integrity: IntegrityReport,
}

#[derive(Debug)]
pub enum TransferOutcome {
    /// End marker seen, or all declared bytes received.
    Complete(TransferSummary),
    /// Prolonged stall at or beyond the accept threshold - treated as done.
    AcceptedIncomplete(TransferSummary),
    /// Not a single byte within the hard deadline.
    TimedOut { bytes_received: u64 },
    /// External stop request or peripheral disconnect mid-transfer.
    Aborted { reason: String },
}

/// State machine driving one transfer: subscribes, routes every inbound frame
///  through codec, reorder buffer and flow controller, samples progress on a fixed
///  quantum to detect stalls, and applies the gap-skip recovery heuristics.
///
/// The receive loop is a single `select!` loop multiplexing inbound frames, the
///  sampling interval and the stop signal, so all mutable transfer state has
///  exactly one writer and no lock.
pub struct TransferSession {
    link: Arc<dyn PeripheralLink>,
    config: TransferConfig,
    progress_tx: watch::Sender<TransferProgress>,
    progress_rx: watch::Receiver<TransferProgress>,
}

impl TransferSession {
    pub fn new(
        link: Arc<dyn PeripheralLink>,
        config: TransferConfig,
    ) -> anyhow::Result<TransferSession> {
        config.validate()?;
        let (progress_tx, progress_rx) = watch::channel(TransferProgress::default());
        Ok(TransferSession {
            link,
            config,
            progress_tx,
            progress_rx,
        })
    }

    /// Throttled progress snapshots for logging / UI consumption.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress_rx.clone()
    }

    /// Drive one complete transfer. Writing `true` into `stop` aborts it
    ///  mid-transfer; the notification subscription is released on every exit
    ///  path once it has been established.
    ///
    /// Fatal errors (metadata unreadable, subscription failure) are returned as
    ///  `Err`; everything the session can degrade through gracefully ends up in
    ///  the [`TransferOutcome`].
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> anyhow::Result<TransferOutcome> {
        let raw_info = self.link.read_file_info().await?;
        let file_info = FileInfo::try_parse(&raw_info)?;
        if file_info.size == 0 {
            bail!("peripheral reports an empty file - nothing to transfer");
        }
        info!(
            "starting transfer of '{}' ({} bytes)",
            file_info.name, file_info.size
        );

        let mut frames = self.link.subscribe().await?;
        debug!("subscribed to data notifications");

        let outcome = self.download(&mut frames, &file_info, &mut stop).await;

        // terminal states release the subscription exactly once, whichever way
        // the loop ended
        self.link.unsubscribe().await;

        Ok(outcome)
    }

    async fn download(
        &self,
        frames: &mut mpsc::Receiver<Vec<u8>>,
        file_info: &FileInfo,
        stop: &mut watch::Receiver<bool>,
    ) -> TransferOutcome {
        let mut state = DownloadState::new(&self.config, &self.progress_tx, file_info, self.link.clone());
        state.flow.grant_initial_burst().await;

        let mut sample_ticks = interval_at(
            Instant::now() + self.config.sample_interval,
            self.config.sample_interval,
        );

        loop {
            if state.is_finished() {
                return TransferOutcome::Complete(state.summary());
            }

            select! {
                maybe_frame = frames.recv() => {
                    match maybe_frame {
                        Some(frame) => state.on_frame(&frame).await,
                        None => {
                            warn!("peripheral disconnected mid-transfer after {} bytes", state.data.len());
                            return TransferOutcome::Aborted { reason: "peripheral disconnected".to_string() };
                        }
                    }
                }
                _ = sample_ticks.tick() => {
                    if let Some(outcome) = state.on_sample_tick().await {
                        return outcome;
                    }
                }
                _ = wait_for_stop(stop) => {
                    info!("stop requested - aborting transfer after {} bytes", state.data.len());
                    return TransferOutcome::Aborted { reason: "stop requested".to_string() };
                }
            }
        }
    }
}

/// Resolves when a stop is actually requested. A dropped stop handle means the
///  transfer can never be cancelled externally, so that case pends forever
///  instead of resolving.
async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let wait_result = stop.wait_for(|stop_requested| *stop_requested).await.map(drop);
    match wait_result {
        Ok(()) => (),
        Err(_) => std::future::pending::<()>().await,
    }
}

/// All mutable state of one running transfer. Exclusively owned by the receive
///  loop; discarded when the session ends.
struct DownloadState<'a> {
    config: &'a TransferConfig,
    progress: &'a watch::Sender<TransferProgress>,

    buffer: ReorderBuffer,
    flow: FlowController,
    data: Vec<u8>,
    file_name: String,
    total_bytes: u64,

    packets_seen: u64,
    rejected_frames: u64,
    checksum_mismatches: u64,
    gap_skips: u64,
    skipped_sequences: u64,
    end_marker_seen: bool,

    started: Instant,
    last_progress_push: Option<Instant>,
    last_sampled_bytes: u64,
    stall_samples: u32,
}

impl<'a> DownloadState<'a> {
    fn new(
        config: &'a TransferConfig,
        progress: &'a watch::Sender<TransferProgress>,
        file_info: &FileInfo,
        link: Arc<dyn PeripheralLink>,
    ) -> DownloadState<'a> {
        DownloadState {
            config,
            progress,
            buffer: ReorderBuffer::new(config.max_buffered_packets),
            flow: FlowController::new(link, config),
            data: Vec::with_capacity(file_info.size as usize),
            file_name: file_info.name.clone(),
            total_bytes: file_info.size as u64,
            packets_seen: 0,
            rejected_frames: 0,
            checksum_mismatches: 0,
            gap_skips: 0,
            skipped_sequences: 0,
            end_marker_seen: false,
            started: Instant::now(),
            last_progress_push: None,
            last_sampled_bytes: 0,
            stall_samples: 0,
        }
    }

    fn is_finished(&self) -> bool {
        self.end_marker_seen || self.data.len() as u64 >= self.total_bytes
    }

    async fn on_frame(&mut self, frame: &[u8]) {
        let packet = match Packet::try_parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                self.rejected_frames += 1;
                debug!("rejecting frame: {}", e);
                return;
            }
        };

        match packet {
            Packet::End { final_seq } => {
                info!("end marker received (final seq #{}) - transfer complete", final_seq);
                self.end_marker_seen = true;
            }
            Packet::Data { seq, checksum, payload } => {
                let actual = payload_checksum(&payload);
                if checksum != actual {
                    self.checksum_mismatches += 1;
                    warn!(
                        "checksum mismatch on packet #{}: stamped {:04x}, computed {:04x} - keeping payload anyway",
                        seq, checksum, actual
                    );
                }

                self.packets_seen += 1;

                match self.buffer.admit(seq, payload, &mut self.data) {
                    Admit::Stale => {
                        // no credit for a packet the sender should not have re-sent
                        return;
                    }
                    Admit::Flushed { packets, bytes } => {
                        trace!("packet #{}: flushed {} packets / {} bytes", seq, packets, bytes);
                    }
                    Admit::Buffered => {
                        // a gap this large is evidence of unrecoverable loss -
                        // skip instead of waiting for packets that will never arrive
                        if seq - self.buffer.expected_seq() > self.config.large_gap_threshold {
                            warn!(
                                "large gap detected: expected #{}, received #{}",
                                self.buffer.expected_seq(),
                                seq
                            );
                            self.skip_gap();
                        }
                    }
                    Admit::Duplicate => {}
                }

                self.flow.on_packet_consumed().await;
                self.publish_progress(false);
            }
        }
    }

    /// Driving-loop quantum: stall detection and the zero-byte hard deadline.
    async fn on_sample_tick(&mut self) -> Option<TransferOutcome> {
        let bytes = self.data.len() as u64;

        if bytes == self.last_sampled_bytes {
            self.stall_samples += 1;
            if self.stall_samples >= self.config.stall_sample_count {
                if let Some(outcome) = self.on_stall().await {
                    return Some(outcome);
                }
            }
        } else {
            self.stall_samples = 0;
            self.last_sampled_bytes = bytes;
        }

        if bytes == 0 && self.started.elapsed() >= self.config.zero_byte_timeout {
            warn!(
                "not a single byte within {:?} of subscribing - giving up",
                self.config.zero_byte_timeout
            );
            return Some(TransferOutcome::TimedOut { bytes_received: 0 });
        }

        None
    }

    async fn on_stall(&mut self) -> Option<TransferOutcome> {
        self.stall_samples = 0;

        let bytes = self.data.len() as u64;
        let ratio = bytes as f64 / self.total_bytes as f64;
        if ratio >= self.config.accept_threshold {
            info!(
                "transfer stalled at {:.1}% of the declared size - accepting as done",
                ratio * 100.0
            );
            return Some(TransferOutcome::AcceptedIncomplete(self.summary()));
        }

        warn!(
            "transfer stalled at {} bytes ({:.1}%), {} packets buffered out of order",
            bytes,
            ratio * 100.0,
            self.buffer.buffered_count()
        );

        // the stall may simply mean the sender ran out of credit
        self.flow.on_stall().await;

        // a small gap in front of the buffered packets will never close on its own
        if let Some(min_seq) = self.buffer.min_buffered_seq() {
            if min_seq - self.buffer.expected_seq() <= self.config.stall_skip_threshold {
                self.skip_gap();
            }
        }

        None
    }

    /// Force the expected sequence forward to the lowest buffered packet and
    ///  flush from there. Data in the gap is presumed permanently lost.
    fn skip_gap(&mut self) {
        let min_seq = match self.buffer.min_buffered_seq() {
            Some(seq) => seq,
            None => return,
        };

        let gap = min_seq - self.buffer.expected_seq();
        let (packets, bytes) = self.buffer.skip_to(min_seq, &mut self.data);

        self.gap_skips += 1;
        self.skipped_sequences += gap as u64;
        warn!(
            "skipped gap of {} sequence numbers up to #{}, flushed {} packets / {} bytes",
            gap, min_seq, packets, bytes
        );
    }

    fn publish_progress(&mut self, force: bool) {
        let now = Instant::now();
        if !force {
            if let Some(last) = self.last_progress_push {
                if now - last < self.config.progress_throttle {
                    return;
                }
            }
        }
        self.last_progress_push = Some(now);

        self.progress.send_replace(TransferProgress {
            expected_seq: self.buffer.expected_seq(),
            bytes_received: self.data.len() as u64,
            total_bytes: self.total_bytes,
            packets_seen: self.packets_seen,
            buffered_count: self.buffer.buffered_count(),
            throughput_bps: self.throughput(),
            complete: self.end_marker_seen,
        });
    }

    fn throughput(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.data.len() as f64 / elapsed
        } else {
            0.0
        }
    }

    fn summary(&mut self) -> TransferSummary {
        self.publish_progress(true);

        let elapsed = self.started.elapsed();
        let throughput_bps = self.throughput();
        let buffered_remaining = self.buffer.buffered_count();
        let data = std::mem::take(&mut self.data);

        info!(
            "transfer of '{}' finished: {} bytes in {} packets, {:.1}s, {:.1} KB/s",
            self.file_name,
            data.len(),
            self.packets_seen,
            elapsed.as_secs_f64(),
            throughput_bps / 1024.0
        );
        if buffered_remaining > 0 {
            warn!(
                "{} packets still in the reorder buffer - their bytes are not part of the output",
                buffered_remaining
            );
        }

        TransferSummary {
            file_name: self.file_name.clone(),
            bytes_received: data.len() as u64,
            data,
            declared_size: self.total_bytes,
            packet_count: self.packets_seen,
            elapsed,
            throughput_bps,
            buffered_remaining,
            integrity: IntegrityReport {
                rejected_frames: self.rejected_frames,
                checksum_mismatches: self.checksum_mismatches,
                evicted_packets: self.buffer.evicted_packets(),
                gap_skips: self.gap_skips,
                skipped_sequences: self.skipped_sequences,
                failed_credit_writes: self.flow.failed_writes(),
            },
        }
    }
}
