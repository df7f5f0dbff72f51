//! ISO-TP exchange errors

use thiserror::Error;

use crate::transport::TransportError;

/// Errors produced by the codec, the reassembly session, the sender and the
/// exchange orchestrator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    /// Transport is not connected or the channel has been shut down
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unrecognised frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Consecutive frame arrived with the wrong sequence number
    #[error("Sequence error: expected SN {expected}, got {actual}")]
    Sequence { expected: u8, actual: u8 },

    /// Peer signalled overflow, or no usable flow control arrived in time
    #[error("Flow control abort: {0}")]
    FlowControlAbort(String),

    /// No complete response within the exchange timeout
    #[error("No response within {0} ms")]
    Timeout(u64),

    /// Superseded by a newer request or by shutdown
    #[error("Exchange cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response payload is not a well-formed UDS message
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Payload length not representable in a 12-bit First Frame length
    #[error("Payload too large: {0} bytes (max 4095)")]
    PayloadTooLarge(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl IsoTpError {
    /// True for failures detected by the protocol layer itself (as opposed
    /// to transport, configuration or caller errors)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            IsoTpError::InvalidFrame(_)
                | IsoTpError::Sequence { .. }
                | IsoTpError::FlowControlAbort(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IsoTpError>;
