//! Transport layer for ISO-TP communication
//!
//! This module provides the frame-level bus abstraction:
//! - `FrameTransport` trait implemented by bus drivers
//! - Mock bus for testing and offline use
//! - Simulated ECU peer speaking ISO-TP on the mock bus
//!
//! # Example
//!
//! ```ignore
//! use udstool_isotp::transport::{MockCanBus, SimulatedEcu};
//! use udstool_isotp::{IsoTpChannel, SegmentConfig};
//!
//! let bus = Arc::new(MockCanBus::new());
//! SimulatedEcu::new(SegmentConfig::default()).attach(&bus);
//! let channel = IsoTpChannel::new(bus, SegmentConfig::default())?;
//! let response = channel.send_request(&[0x22, 0xF1, 0x90]).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;
pub mod sim;

pub use adapter::{Direction, FrameTransport, TransportFrame, CAN_EFF_MASK};
pub use error::TransportError;
pub use mock::MockCanBus;
pub use sim::{EcuConfig, SimulatedEcu};
