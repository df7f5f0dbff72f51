//! Reassembly of inbound ISO-TP transfers
//!
//! A `ReassemblySession` accumulates the frames of one multi-frame transfer.
//! It never sends anything itself: when a First Frame opens a transfer, or a
//! granted block is used up, it returns
//! [`ReassemblyEvent::FlowControlRequired`] and the caller puts the
//! Flow-Control frame on the bus. There is no internal timer either; the
//! owner aborts a stalled transfer with [`ReassemblySession::abort`].

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec::{self, FlowControl, IsoTpFrame};
use crate::config::SegmentConfig;
use crate::error::IsoTpError;

/// Outcome of feeding one frame into the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// Transfer continues, nothing to do
    InProgress,
    /// Answer with this Flow-Control frame (transfer opened or block done)
    FlowControlRequired(FlowControl),
    /// A complete payload
    Complete(Vec<u8>),
    /// Frame does not fit the current state (e.g. a Consecutive Frame with
    /// no transfer open). Session state is unchanged.
    Unexpected(String),
    /// Flow-Control frames belong to the sender and are ignored here
    Ignored,
}

/// Observable phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyPhase {
    Idle,
    AwaitingConsecutive,
}

/// In-progress multi-frame transfer
#[derive(Debug)]
struct Transfer {
    total_len: usize,
    buffer: Vec<u8>,
    next_seq: u8,
    /// Consecutive Frames left in the current block (0 = unlimited)
    block_remaining: u8,
    started: Instant,
}

impl Transfer {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Reassembly state machine for one address pairing
#[derive(Debug)]
pub struct ReassemblySession {
    config: SegmentConfig,
    transfer: Option<Transfer>,
}

impl ReassemblySession {
    /// Create an idle session; `config` is captured for the lifetime of the
    /// session
    pub fn new(config: SegmentConfig) -> Self {
        Self {
            config,
            transfer: None,
        }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn phase(&self) -> ReassemblyPhase {
        if self.transfer.is_some() {
            ReassemblyPhase::AwaitingConsecutive
        } else {
            ReassemblyPhase::Idle
        }
    }

    /// Sequence number the next Consecutive Frame must carry
    pub fn expected_sequence(&self) -> Option<u8> {
        self.transfer.as_ref().map(|t| t.next_seq)
    }

    /// Bytes received so far and announced total, if a transfer is open
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.transfer
            .as_ref()
            .map(|t| (t.buffer.len(), t.total_len))
    }

    /// Discard any open transfer. Returns true if one was open.
    pub fn abort(&mut self) -> bool {
        match self.transfer.take() {
            Some(transfer) => {
                debug!(
                    received = transfer.buffer.len(),
                    total = transfer.total_len,
                    "Reassembly aborted"
                );
                true
            }
            None => false,
        }
    }

    /// Decode raw frame bytes and feed them into the session
    ///
    /// A frame that fails to decode aborts any open transfer.
    pub fn on_raw(&mut self, data: &[u8]) -> Result<ReassemblyEvent, IsoTpError> {
        match codec::decode(data) {
            Ok(frame) => self.on_frame(frame),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    pub fn on_frame(&mut self, frame: IsoTpFrame) -> Result<ReassemblyEvent, IsoTpError> {
        match frame {
            IsoTpFrame::Single { data } => {
                if self.abort() {
                    warn!("Single frame interrupted a multi-frame transfer");
                }
                Ok(ReassemblyEvent::Complete(data))
            }
            IsoTpFrame::First { total_len, data } => Ok(self.start(total_len, data)),
            IsoTpFrame::Consecutive { seq, data } => self.append(seq, data),
            IsoTpFrame::FlowControl(_) => Ok(ReassemblyEvent::Ignored),
        }
    }

    fn start(&mut self, total_len: usize, mut data: Vec<u8>) -> ReassemblyEvent {
        if self.abort() {
            warn!(total_len, "First frame restarted an unfinished transfer");
        }

        // A CAN-FD First Frame may already hold the whole payload
        if data.len() >= total_len {
            data.truncate(total_len);
            return ReassemblyEvent::Complete(data);
        }

        let mut buffer = Vec::with_capacity(total_len);
        buffer.extend_from_slice(&data);
        self.transfer = Some(Transfer {
            total_len,
            buffer,
            next_seq: 1,
            block_remaining: self.config.block_size,
            started: Instant::now(),
        });

        debug!(total_len, received = data.len(), "Reassembly started");
        ReassemblyEvent::FlowControlRequired(self.flow_control())
    }

    fn flow_control(&self) -> FlowControl {
        FlowControl::continue_to_send(self.config.block_size, self.config.st_min)
    }

    fn append(&mut self, seq: u8, data: Vec<u8>) -> Result<ReassemblyEvent, IsoTpError> {
        let Some(transfer) = self.transfer.as_mut() else {
            return Ok(ReassemblyEvent::Unexpected(format!(
                "consecutive frame SN={} with no transfer in progress",
                seq
            )));
        };

        if seq != transfer.next_seq {
            let expected = transfer.next_seq;
            self.transfer = None;
            warn!(expected, actual = seq, "Sequence error, transfer discarded");
            return Err(IsoTpError::Sequence {
                expected,
                actual: seq,
            });
        }

        transfer.buffer.extend_from_slice(&data);
        transfer.next_seq = (transfer.next_seq + 1) % 16;

        if transfer.buffer.len() < transfer.total_len {
            if transfer.block_remaining == 0 {
                return Ok(ReassemblyEvent::InProgress);
            }
            transfer.block_remaining -= 1;
            if transfer.block_remaining > 0 {
                return Ok(ReassemblyEvent::InProgress);
            }
            // Block exhausted: grant the next one
            transfer.block_remaining = self.config.block_size;
            return Ok(ReassemblyEvent::FlowControlRequired(self.flow_control()));
        }

        let Some(mut transfer) = self.transfer.take() else {
            return Ok(ReassemblyEvent::InProgress);
        };
        transfer.buffer.truncate(transfer.total_len);
        debug!(
            len = transfer.total_len,
            elapsed_ms = transfer.elapsed().as_millis() as u64,
            "Reassembly complete"
        );
        Ok(ReassemblyEvent::Complete(transfer.buffer))
    }
}
