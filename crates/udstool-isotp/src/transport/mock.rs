//! In-memory CAN bus for testing and offline use

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{FrameTransport, TransportError, TransportFrame, CAN_EFF_MASK};

/// Largest frame a CAN-FD bus carries
const MAX_FRAME_LEN: usize = 64;

const CHANNEL_CAPACITY: usize = 256;

/// In-memory bus standing in for a real CAN interface
///
/// Frames sent through [`FrameTransport::send`] are logged and published on
/// [`MockCanBus::monitor`]; they are not looped back to subscribers. Frames
/// injected with [`MockCanBus::inject_incoming`] are delivered to every
/// subscriber as received traffic.
pub struct MockCanBus {
    connected: AtomicBool,
    latency: Option<Duration>,
    incoming_tx: broadcast::Sender<TransportFrame>,
    monitor_tx: broadcast::Sender<TransportFrame>,
    sent: RwLock<Vec<TransportFrame>>,
}

impl MockCanBus {
    pub fn new() -> Self {
        let (incoming_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (monitor_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            connected: AtomicBool::new(true),
            latency: None,
            incoming_tx,
            monitor_tx,
            sent: RwLock::new(Vec::new()),
        }
    }

    /// Delay every transmission by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency).filter(|l| !l.is_zero());
        self
    }

    /// Deliver a frame to subscribers as if it came from the bus
    ///
    /// Returns the number of subscribers that saw it.
    pub fn inject_incoming(&self, id: u32, data: Vec<u8>) -> usize {
        self.incoming_tx
            .send(TransportFrame::rx(id, data))
            .unwrap_or(0)
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every frame transmitted so far, oldest first
    pub fn sent_frames(&self) -> Vec<TransportFrame> {
        self.sent.read().clone()
    }

    /// Frames transmitted with the given identifier
    pub fn sent_to(&self, id: u32) -> Vec<TransportFrame> {
        self.sent
            .read()
            .iter()
            .filter(|f| f.id == id)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.write().clear();
    }

    /// Subscribe to frames transmitted on the bus
    pub fn monitor(&self) -> broadcast::Receiver<TransportFrame> {
        self.monitor_tx.subscribe()
    }
}

impl Default for MockCanBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameTransport for MockCanBus {
    async fn send(&self, frame: &TransportFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if frame.id > CAN_EFF_MASK {
            return Err(TransportError::InvalidId(frame.id));
        }
        if frame.data.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLong {
                len: frame.data.len(),
                max: MAX_FRAME_LEN,
            });
        }

        // Simulate latency
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        tracing::trace!(%frame, "Mock bus: sent frame");
        self.sent.write().push(frame.clone());
        let _ = self.monitor_tx.send(frame.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportFrame> {
        self.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
