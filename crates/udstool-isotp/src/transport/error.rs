//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Frame too long: {len} bytes (bus limit {max})")]
    FrameTooLong { len: usize, max: usize },

    #[error("Invalid CAN ID: 0x{0:X}")]
    InvalidId(u32),
}
