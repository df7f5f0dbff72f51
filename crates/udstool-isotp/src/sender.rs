//! Outbound segmentation
//!
//! [`Segmenter`] plans the frames for one payload without any I/O.
//! [`SegmentationSender`] drives them onto a [`FrameTransport`], pausing for
//! Flow-Control frames and honouring the granted block size and STmin.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::codec::{self, FlowControl, FlowStatus, FrameKind, MAX_PAYLOAD_LEN};
use crate::config::SegmentConfig;
use crate::error::IsoTpError;
use crate::transport::{FrameTransport, TransportFrame};

/// Consecutive Wait flow-control frames accepted before giving up (N_WFTmax)
pub const MAX_WAIT_FRAMES: usize = 10;

/// Frame plan for one outbound payload
///
/// Yields either one Single Frame, or a First Frame followed by Consecutive
/// Frames numbered 1, 2, ... 15, 0, 1, ...
#[derive(Debug)]
pub struct Segmenter<'a> {
    payload: &'a [u8],
    config: &'a SegmentConfig,
    offset: usize,
    next_seq: u8,
    started: bool,
}

impl<'a> Segmenter<'a> {
    pub fn new(payload: &'a [u8], config: &'a SegmentConfig) -> Result<Self, IsoTpError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(IsoTpError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            payload,
            config,
            offset: 0,
            next_seq: 1,
            started: false,
        })
    }

    pub fn is_single(&self) -> bool {
        self.payload.len() <= self.config.single_frame_capacity()
    }

    /// Consecutive Frames not yet produced
    pub fn remaining_consecutive(&self) -> usize {
        if !self.started {
            return self.config.consecutive_frames_for(self.payload.len());
        }
        if self.is_single() {
            return 0;
        }
        (self.payload.len() - self.offset).div_ceil(self.config.consecutive_frame_data_size)
    }

    /// Sequence number the next Consecutive Frame will carry
    pub fn next_sequence(&self) -> u8 {
        self.next_seq
    }
}

impl Iterator for Segmenter<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if self.is_single() {
                self.offset = self.payload.len();
                return Some(codec::build_single(self.payload, self.config));
            }
            self.offset = self.payload.len().min(self.config.first_frame_data_size);
            return Some(codec::build_first(self.payload, self.config));
        }

        if self.offset >= self.payload.len() {
            return None;
        }

        let end = (self.offset + self.config.consecutive_frame_data_size).min(self.payload.len());
        let frame = codec::build_consecutive(
            self.next_seq,
            &self.payload[self.offset..end],
            self.config,
        );
        self.offset = end;
        self.next_seq = (self.next_seq + 1) % 16;
        Some(frame)
    }
}

/// Split a payload into the complete frame sequence
pub fn segment(payload: &[u8], config: &SegmentConfig) -> Result<Vec<Vec<u8>>, IsoTpError> {
    Ok(Segmenter::new(payload, config)?.collect())
}

/// True once the cancel signal fired or its sender went away
pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Resolves when the cancel signal fires or its sender is dropped
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Drives one payload onto the bus
pub struct SegmentationSender {
    config: SegmentConfig,
}

impl SegmentationSender {
    /// `config` is captured; later changes to the caller's copy are not seen
    pub fn new(config: SegmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Transmit `payload`, returning the number of frames put on the bus
    ///
    /// Flow-Control frames addressed to us must be forwarded into
    /// `flow_control` in arrival order; anything already queued when the
    /// transfer starts is discarded. The send stops with [`IsoTpError::Cancelled`] when
    /// `cancel` fires, its sender is dropped, or the flow-control channel
    /// closes. Completion means the last frame left; the response is not
    /// awaited here.
    pub async fn transmit(
        &self,
        payload: &[u8],
        transport: &dyn FrameTransport,
        flow_control: &mut mpsc::UnboundedReceiver<FlowControl>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<usize, IsoTpError> {
        let mut segments = Segmenter::new(payload, &self.config)?;
        let single = segments.is_single();
        let mut sent = 0;

        // Grants queued before our First Frame belong to an earlier transfer
        while let Ok(stale) = flow_control.try_recv() {
            debug!(status = ?stale.status, "Discarding stale flow control");
        }

        // Always Some: the first item is the SF or FF
        if let Some(frame) = segments.next() {
            self.send_frame(transport, frame, cancel).await?;
            sent += 1;
        }
        if single {
            debug!(len = payload.len(), "Single frame sent");
            return Ok(sent);
        }

        while segments.remaining_consecutive() > 0 {
            let fc = self.await_flow_control(flow_control, cancel).await?;
            let mut budget = match fc.block_size {
                0 => usize::MAX,
                bs => bs as usize,
            };
            let separation = fc.st_min.duration();
            debug!(
                block_size = fc.block_size,
                st_min = %fc.st_min,
                remaining = segments.remaining_consecutive(),
                "Flow control granted"
            );

            let mut first_in_block = true;
            while budget > 0 {
                let Some(frame) = segments.next() else {
                    break;
                };
                if !first_in_block {
                    self.pause(separation, cancel).await?;
                }
                self.send_frame(transport, frame, cancel).await?;
                first_in_block = false;
                sent += 1;
                budget -= 1;
            }
        }

        debug!(len = payload.len(), frames = sent, "Segmented transfer sent");
        Ok(sent)
    }

    async fn send_frame(
        &self,
        transport: &dyn FrameTransport,
        data: Vec<u8>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), IsoTpError> {
        if is_cancelled(cancel) {
            return Err(IsoTpError::Cancelled("transmission stopped".to_string()));
        }
        let kind = FrameKind::from_pci(data[0])?;
        debug!(
            id = format!("0x{:03X}", self.config.request_id),
            kind = kind.abbreviation(),
            "Sending frame"
        );
        transport
            .send(&TransportFrame::tx(self.config.request_id, data))
            .await?;
        Ok(())
    }

    async fn pause(
        &self,
        separation: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), IsoTpError> {
        if separation.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancelled(cancel) => {
                Err(IsoTpError::Cancelled("transmission stopped".to_string()))
            }
            _ = tokio::time::sleep(separation) => Ok(()),
        }
    }

    /// Wait for a ContinueToSend, re-arming the N_Bs timer on every Wait
    async fn await_flow_control(
        &self,
        flow_control: &mut mpsc::UnboundedReceiver<FlowControl>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<FlowControl, IsoTpError> {
        let timeout = self.config.flow_control_timeout();
        let mut waits = 0;

        loop {
            let fc = tokio::select! {
                _ = cancelled(cancel) => {
                    return Err(IsoTpError::Cancelled("transmission stopped".to_string()));
                }
                received = tokio::time::timeout(timeout, flow_control.recv()) => match received {
                    Ok(Some(fc)) => fc,
                    Ok(None) => {
                        return Err(IsoTpError::Cancelled(
                            "flow control channel closed".to_string(),
                        ));
                    }
                    Err(_) => {
                        return Err(IsoTpError::FlowControlAbort(format!(
                            "no flow control within {} ms",
                            self.config.flow_control_timeout_ms
                        )));
                    }
                },
            };

            match fc.status {
                FlowStatus::ContinueToSend => return Ok(fc),
                FlowStatus::Wait => {
                    waits += 1;
                    if waits > MAX_WAIT_FRAMES {
                        return Err(IsoTpError::FlowControlAbort(format!(
                            "receiver sent more than {} wait frames",
                            MAX_WAIT_FRAMES
                        )));
                    }
                    debug!(waits, "Receiver asked to wait");
                }
                FlowStatus::Overflow => {
                    return Err(IsoTpError::FlowControlAbort(
                        "receiver reported overflow".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::codec::{decode, IsoTpFrame};
    use crate::reassembly::{ReassemblyEvent, ReassemblySession};
    use crate::transport::{MockCanBus, TransportError};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn sequence_numbers(frames: &[Vec<u8>]) -> Vec<u8> {
        frames[1..].iter().map(|f| f[0] & 0x0F).collect()
    }

    #[test]
    fn test_segment_single_frame() {
        let frames = segment(&[0x22, 0xF1, 0x90], &SegmentConfig::default()).unwrap();
        assert_eq!(
            frames,
            vec![vec![0x03, 0x22, 0xF1, 0x90, 0xCC, 0xCC, 0xCC, 0xCC]]
        );
    }

    #[test]
    fn test_segment_twelve_bytes() {
        let payload: Vec<u8> = (1..=12).collect();
        let frames = segment(&payload, &SegmentConfig::default()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![0x10, 0x0C, 1, 2, 3, 4, 5, 6]);
        assert_eq!(frames[1], vec![0x21, 7, 8, 9, 10, 11, 12, 0xCC]);
    }

    #[test]
    fn test_sequence_numbers_wrap_at_sixteen() {
        // 6 + 20 * 7 bytes
        let frames = segment(&pattern(146), &SegmentConfig::default()).unwrap();
        let seqs = sequence_numbers(&frames);
        assert_eq!(seqs.len(), 20);
        assert_eq!(seqs[0], 1);
        assert_eq!(seqs[14], 15);
        assert_eq!(seqs[15], 0);
        assert_eq!(seqs[16], 1);
        assert_eq!(
            seqs,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 0, 1, 2, 3, 4]
        );
    }

    #[rstest]
    #[case(8)]
    #[case(13)]
    #[case(14)]
    #[case(111)]
    #[case(112)]
    #[case(1000)]
    #[case(4095)]
    fn test_segment_then_reassemble(#[case] len: usize) {
        let payload = pattern(len);
        for config in [SegmentConfig::default(), SegmentConfig::can_fd()] {
            let mut session = ReassemblySession::new(config.clone());
            let mut result = None;
            for frame in segment(&payload, &config).unwrap() {
                if let ReassemblyEvent::Complete(data) = session.on_raw(&frame).unwrap() {
                    result = Some(data);
                }
            }
            assert_eq!(result, Some(payload.clone()), "len {}", len);
        }
    }

    #[test]
    fn test_segment_rejects_oversized_payload() {
        assert_eq!(
            segment(&vec![0u8; 4096], &SegmentConfig::default()),
            Err(IsoTpError::PayloadTooLarge(4096))
        );
    }

    #[test]
    fn test_remaining_consecutive_counts_down() {
        let config = SegmentConfig::default();
        let payload = pattern(41);
        let mut segments = Segmenter::new(&payload, &config).unwrap();
        assert_eq!(segments.remaining_consecutive(), 5);
        segments.next();
        assert_eq!(segments.remaining_consecutive(), 5);
        segments.next();
        assert_eq!(segments.remaining_consecutive(), 4);
        assert_eq!(segments.next_sequence(), 2);
    }

    async fn wait_for_frames(bus: &MockCanBus, count: usize) {
        for _ in 0..200 {
            if bus.sent_frames().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} frames, bus carried {}",
            count,
            bus.sent_frames().len()
        );
    }

    struct Harness {
        bus: Arc<MockCanBus>,
        fc_tx: mpsc::UnboundedSender<FlowControl>,
        cancel_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<usize, IsoTpError>>,
    }

    fn start(config: SegmentConfig, payload: Vec<u8>) -> Harness {
        let bus = Arc::new(MockCanBus::new());
        let (fc_tx, mut fc_rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let transport = bus.clone();
        let task = tokio::spawn(async move {
            SegmentationSender::new(config)
                .transmit(&payload, transport.as_ref(), &mut fc_rx, &mut cancel_rx)
                .await
        });
        Harness {
            bus,
            fc_tx,
            cancel_tx,
            task,
        }
    }

    #[tokio::test]
    async fn test_single_frame_needs_no_flow_control() {
        let h = start(SegmentConfig::default(), vec![0x3E, 0x00]);
        assert_eq!(h.task.await.unwrap(), Ok(1));
        let sent = h.bus.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x7E0);
        assert_eq!(decode(&sent[0].data).unwrap(), IsoTpFrame::Single {
            data: vec![0x3E, 0x00]
        });
    }

    #[tokio::test]
    async fn test_transmit_pending_until_flow_control() {
        let bus = MockCanBus::new();
        let (fc_tx, mut fc_rx) = mpsc::unbounded_channel();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let sender = SegmentationSender::new(SegmentConfig::default());
        let payload = pattern(20);

        let mut task = tokio_test::task::spawn(sender.transmit(
            &payload,
            &bus,
            &mut fc_rx,
            &mut cancel_rx,
        ));
        tokio_test::assert_pending!(task.poll());
        assert_eq!(bus.sent_frames().len(), 1);

        fc_tx.send(FlowControl::continue_to_send(0, 0)).unwrap();
        assert!(task.is_woken());
        assert_eq!(tokio_test::assert_ready!(task.poll()), Ok(3));
        drop(task);
        assert_eq!(bus.sent_frames().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_grant_is_not_used() {
        let bus = MockCanBus::new();
        let (fc_tx, mut fc_rx) = mpsc::unbounded_channel();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let sender = SegmentationSender::new(SegmentConfig::default());
        let payload = pattern(20);

        // Left over from a transfer that was superseded
        fc_tx.send(FlowControl::continue_to_send(0, 0)).unwrap();

        let mut task = tokio_test::task::spawn(sender.transmit(
            &payload,
            &bus,
            &mut fc_rx,
            &mut cancel_rx,
        ));
        tokio_test::assert_pending!(task.poll());
        assert_eq!(bus.sent_frames().len(), 1);

        fc_tx.send(FlowControl::continue_to_send(0, 0)).unwrap();
        assert_eq!(tokio_test::assert_ready!(task.poll()), Ok(3));
    }

    #[tokio::test]
    async fn test_burst_of_waits_then_grant() {
        let h = start(SegmentConfig::default(), pattern(20));
        wait_for_frames(&h.bus, 1).await;
        let wait = FlowControl {
            status: FlowStatus::Wait,
            block_size: 0,
            st_min: codec::SeparationTime::ZERO,
        };
        for _ in 0..MAX_WAIT_FRAMES {
            h.fc_tx.send(wait).unwrap();
        }
        h.fc_tx.send(FlowControl::continue_to_send(0, 0)).unwrap();
        assert_eq!(h.task.await.unwrap(), Ok(3));
    }

    #[tokio::test]
    async fn test_block_size_two_pauses_after_two_frames() {
        // 6 + 5 * 7 bytes = five consecutive frames
        let h = start(SegmentConfig::default(), pattern(41));

        wait_for_frames(&h.bus, 1).await;
        h.fc_tx.send(FlowControl::continue_to_send(2, 0)).unwrap();
        wait_for_frames(&h.bus, 3).await;

        // Suspended until the next flow control
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.bus.sent_frames().len(), 3);
        assert!(!h.task.is_finished());

        h.fc_tx.send(FlowControl::continue_to_send(2, 0)).unwrap();
        wait_for_frames(&h.bus, 5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.bus.sent_frames().len(), 5);

        h.fc_tx.send(FlowControl::continue_to_send(2, 0)).unwrap();
        assert_eq!(h.task.await.unwrap(), Ok(6));

        let seqs: Vec<u8> = h.bus.sent_frames()[1..]
            .iter()
            .map(|f| f.data[0])
            .collect();
        assert_eq!(seqs, vec![0x21, 0x22, 0x23, 0x24, 0x25]);
    }

    #[tokio::test]
    async fn test_block_size_zero_sends_everything() {
        let h = start(SegmentConfig::default(), pattern(41));
        wait_for_frames(&h.bus, 1).await;
        h.fc_tx.send(FlowControl::continue_to_send(0, 0)).unwrap();
        assert_eq!(h.task.await.unwrap(), Ok(6));
    }

    #[tokio::test]
    async fn test_separation_time_spaces_frames() {
        let h = start(SegmentConfig::default(), pattern(27));
        wait_for_frames(&h.bus, 1).await;
        let granted = Instant::now();
        h.fc_tx.send(FlowControl::continue_to_send(0, 20)).unwrap();
        assert_eq!(h.task.await.unwrap(), Ok(4));
        // Three CFs, two gaps of at least 20 ms
        assert!(granted.elapsed() >= Duration::from_millis(40));

        let sent = h.bus.sent_frames();
        let gap = sent[3].timestamp.duration_since(sent[2].timestamp);
        assert!(gap >= Duration::from_millis(20), "gap {:?}", gap);
    }

    #[tokio::test]
    async fn test_overflow_aborts() {
        let h = start(SegmentConfig::default(), pattern(20));
        wait_for_frames(&h.bus, 1).await;
        h.fc_tx
            .send(FlowControl {
                status: FlowStatus::Overflow,
                block_size: 0,
                st_min: codec::SeparationTime::ZERO,
            })
            .unwrap();
        assert!(matches!(
            h.task.await.unwrap(),
            Err(IsoTpError::FlowControlAbort(_))
        ));
        assert_eq!(h.bus.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_flow_control_times_out() {
        let config = SegmentConfig {
            flow_control_timeout_ms: 50,
            ..SegmentConfig::default()
        };
        let started = Instant::now();
        let h = start(config, pattern(20));
        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(IsoTpError::FlowControlAbort(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));
        drop(h.fc_tx);
    }

    #[tokio::test]
    async fn test_wait_rearms_timer() {
        let config = SegmentConfig {
            flow_control_timeout_ms: 80,
            ..SegmentConfig::default()
        };
        let h = start(config, pattern(20));
        wait_for_frames(&h.bus, 1).await;

        let wait = FlowControl {
            status: FlowStatus::Wait,
            block_size: 0,
            st_min: codec::SeparationTime::ZERO,
        };
        // Two waits spaced so the total exceeds a single N_Bs period
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.fc_tx.send(wait).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.fc_tx.send(wait).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.fc_tx.send(FlowControl::continue_to_send(0, 0)).unwrap();

        assert_eq!(h.task.await.unwrap(), Ok(3));
    }

    #[tokio::test]
    async fn test_too_many_waits_abort() {
        let h = start(SegmentConfig::default(), pattern(20));
        wait_for_frames(&h.bus, 1).await;
        let wait = FlowControl {
            status: FlowStatus::Wait,
            block_size: 0,
            st_min: codec::SeparationTime::ZERO,
        };
        for _ in 0..=MAX_WAIT_FRAMES {
            h.fc_tx.send(wait).unwrap();
        }
        assert!(matches!(
            h.task.await.unwrap(),
            Err(IsoTpError::FlowControlAbort(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_flow_control_wait() {
        let h = start(SegmentConfig::default(), pattern(20));
        wait_for_frames(&h.bus, 1).await;
        h.cancel_tx.send(true).unwrap();
        assert!(matches!(
            h.task.await.unwrap(),
            Err(IsoTpError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_cancel_sender_unblocks() {
        let h = start(SegmentConfig::default(), pattern(20));
        wait_for_frames(&h.bus, 1).await;
        drop(h.cancel_tx);
        assert!(matches!(
            h.task.await.unwrap(),
            Err(IsoTpError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnected_bus_fails_send() {
        let bus = MockCanBus::new();
        bus.set_connected(false);
        let (_fc_tx, mut fc_rx) = mpsc::unbounded_channel();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let result = SegmentationSender::new(SegmentConfig::default())
            .transmit(&[0x10, 0x01], &bus, &mut fc_rx, &mut cancel_rx)
            .await;
        assert_eq!(
            result,
            Err(IsoTpError::Transport(TransportError::ConnectionClosed))
        );
        assert!(bus.sent_frames().is_empty());
    }
}
