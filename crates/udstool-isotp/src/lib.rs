//! udstool-isotp - ISO-TP (ISO 15765-2) transport for UDS diagnostics
//!
//! This crate segments diagnostic payloads into CAN frames, reassembles
//! multi-frame responses and runs request/response exchanges over any
//! frame-level bus implementing [`FrameTransport`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      IsoTpChannel                           │
//! │  send_request / configure / shutdown / subscribe            │
//! │                                                             │
//! │  ┌──────────────────┐        ┌──────────────────────────┐   │
//! │  │SegmentationSender│        │ listener task            │   │
//! │  │ (FF/CF + FC wait)│◄─ FC ──│  ReassemblySession       │   │
//! │  └────────┬─────────┘        └────────────▲─────────────┘   │
//! │           │                               │                 │
//! │           │          ┌─────────┐          │                 │
//! │           └─────────►│  codec  │──────────┘                 │
//! │                      └─────────┘                            │
//! │                 ┌────────┴────────┐                         │
//! │                 │ FrameTransport  │                         │
//! │                 │ (mock bus/etc)  │                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod exchange;
pub mod reassembly;
pub mod sender;
pub mod transport;
pub mod uds;

pub use codec::{FlowControl, FlowStatus, FrameKind, IsoTpFrame, SeparationTime, MAX_PAYLOAD_LEN};
pub use config::SegmentConfig;
pub use error::{IsoTpError, Result};
pub use exchange::{ChannelEvent, IsoTpChannel, ProtocolEvent};
pub use reassembly::{ReassemblyEvent, ReassemblyPhase, ReassemblySession};
pub use sender::{segment, SegmentationSender, Segmenter};
pub use transport::{
    Direction, EcuConfig, FrameTransport, MockCanBus, SimulatedEcu, TransportError,
    TransportFrame,
};
pub use uds::{NegativeResponseCode, UdsResponse};
