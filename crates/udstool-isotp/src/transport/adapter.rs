//! Frame transport trait and types

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::TransportError;

/// Largest 29-bit CAN identifier
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Whether a frame was transmitted by us or captured from the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Tx => f.write_str("TX"),
            Direction::Rx => f.write_str("RX"),
        }
    }
}

/// A single bus frame as exchanged with the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFrame {
    /// CAN identifier (11 or 29 bit)
    pub id: u32,
    /// Raw frame bytes (up to 8 classic, up to 64 CAN-FD)
    pub data: Vec<u8>,
    /// Capture timestamp
    pub timestamp: Instant,
    pub direction: Direction,
}

impl TransportFrame {
    /// A frame about to be transmitted
    pub fn tx(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            timestamp: Instant::now(),
            direction: Direction::Tx,
        }
    }

    /// A frame received from the bus
    pub fn rx(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            timestamp: Instant::now(),
            direction: Direction::Rx,
        }
    }

    /// True if the identifier needs a 29-bit frame
    pub fn is_extended(&self) -> bool {
        self.id > 0x7FF
    }
}

impl std::fmt::Display for TransportFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_extended() {
            write!(f, "{} {:08X} ", self.direction, self.id)?;
        } else {
            write!(f, "{} {:03X} ", self.direction, self.id)?;
        }
        f.write_str(&hex::encode_upper(&self.data))
    }
}

/// Frame-level bus interface consumed by the ISO-TP layer
///
/// This trait abstracts the bus driver (SocketCAN, vendor adapters, the
/// in-memory mock bus). It carries raw frames only; segmentation and
/// reassembly live above it.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Transmit one frame
    async fn send(&self, frame: &TransportFrame) -> Result<(), TransportError>;

    /// Subscribe to frames received from the bus
    ///
    /// Every subscriber sees every frame, in bus order.
    fn subscribe(&self) -> broadcast::Receiver<TransportFrame>;

    /// Check if the transport is connected
    async fn is_connected(&self) -> bool;
}
