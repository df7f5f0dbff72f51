//! ISO-TP segmentation configuration
//!
//! A `SegmentConfig` is an immutable snapshot: the channel hands a copy to
//! every sender and reassembly session it starts, so replacing the channel
//! configuration never affects an exchange already in flight.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CAN_FD_FRAME_SIZES;
use crate::error::IsoTpError;
use crate::transport::CAN_EFF_MASK;

/// Segmentation, pacing and addressing parameters for one exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Request CAN ID (tester -> ECU)
    #[serde(default = "default_request_id")]
    pub request_id: u32,
    /// Response CAN ID (ECU -> tester)
    #[serde(default = "default_response_id")]
    pub response_id: u32,
    /// Block size advertised in our flow control (0 = unlimited)
    #[serde(default)]
    pub block_size: u8,
    /// Raw STmin byte advertised in our flow control
    #[serde(default)]
    pub st_min: u8,
    /// Exchange timeout in milliseconds, measured from request issue
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// How long the sender waits for each flow control frame (N_Bs)
    #[serde(default = "default_flow_control_timeout_ms")]
    pub flow_control_timeout_ms: u64,
    /// Pad transmitted frames to `max_frame_size`
    #[serde(default = "default_true")]
    pub padding: bool,
    #[serde(default = "default_padding_byte")]
    pub padding_byte: u8,
    /// Bus frame size (8 classic CAN, up to 64 CAN-FD)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Payload bytes carried by a First Frame
    #[serde(default = "default_first_frame_data_size")]
    pub first_frame_data_size: usize,
    /// Payload bytes carried by a Consecutive Frame
    #[serde(default = "default_consecutive_frame_data_size")]
    pub consecutive_frame_data_size: usize,
}

fn default_request_id() -> u32 {
    0x7E0
}

fn default_response_id() -> u32 {
    0x7E8
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_flow_control_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_padding_byte() -> u8 {
    0xCC
}

fn default_max_frame_size() -> usize {
    8
}

fn default_first_frame_data_size() -> usize {
    6
}

fn default_consecutive_frame_data_size() -> usize {
    7
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            request_id: default_request_id(),
            response_id: default_response_id(),
            block_size: 0,
            st_min: 0,
            timeout_ms: default_timeout_ms(),
            flow_control_timeout_ms: default_flow_control_timeout_ms(),
            padding: default_true(),
            padding_byte: default_padding_byte(),
            max_frame_size: default_max_frame_size(),
            first_frame_data_size: default_first_frame_data_size(),
            consecutive_frame_data_size: default_consecutive_frame_data_size(),
        }
    }
}

impl SegmentConfig {
    /// CAN-FD profile with 64-byte frames
    pub fn can_fd() -> Self {
        Self {
            max_frame_size: 64,
            first_frame_data_size: 62,
            consecutive_frame_data_size: 63,
            ..Self::default()
        }
    }

    /// Same parameters with request and response addresses swapped
    ///
    /// This is the configuration the ECU side of a link uses.
    pub fn reversed(&self) -> Self {
        Self {
            request_id: self.response_id,
            response_id: self.request_id,
            ..self.clone()
        }
    }

    /// Largest payload that still fits a Single Frame
    ///
    /// Only the classic 4-bit SF_DL is used, so this never exceeds 7 even on
    /// CAN-FD frames.
    pub fn single_frame_capacity(&self) -> usize {
        self.max_frame_size.saturating_sub(1).min(7)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn flow_control_timeout(&self) -> Duration {
        Duration::from_millis(self.flow_control_timeout_ms)
    }

    /// Number of Consecutive Frames needed after the First Frame
    pub fn consecutive_frames_for(&self, payload_len: usize) -> usize {
        if payload_len <= self.single_frame_capacity() {
            return 0;
        }
        let rest = payload_len.saturating_sub(self.first_frame_data_size);
        rest.div_ceil(self.consecutive_frame_data_size)
    }

    pub fn validate(&self) -> Result<(), IsoTpError> {
        for (name, id) in [
            ("request_id", self.request_id),
            ("response_id", self.response_id),
        ] {
            if id > CAN_EFF_MASK {
                return Err(IsoTpError::InvalidConfig(format!(
                    "{} 0x{:X} exceeds 29 bits",
                    name, id
                )));
            }
        }
        if self.request_id == self.response_id {
            return Err(IsoTpError::InvalidConfig(format!(
                "request_id and response_id are both 0x{:X}",
                self.request_id
            )));
        }
        if !CAN_FD_FRAME_SIZES.contains(&self.max_frame_size) {
            return Err(IsoTpError::InvalidConfig(format!(
                "max_frame_size {} is not a valid CAN/CAN-FD frame size",
                self.max_frame_size
            )));
        }
        if self.first_frame_data_size == 0 || self.first_frame_data_size + 2 > self.max_frame_size
        {
            return Err(IsoTpError::InvalidConfig(format!(
                "first_frame_data_size {} does not fit a {}-byte frame",
                self.first_frame_data_size, self.max_frame_size
            )));
        }
        if self.consecutive_frame_data_size == 0
            || self.consecutive_frame_data_size + 1 > self.max_frame_size
        {
            return Err(IsoTpError::InvalidConfig(format!(
                "consecutive_frame_data_size {} does not fit a {}-byte frame",
                self.consecutive_frame_data_size, self.max_frame_size
            )));
        }
        if self.timeout_ms == 0 || self.flow_control_timeout_ms == 0 {
            return Err(IsoTpError::InvalidConfig(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_classic_can() {
        let cfg = SegmentConfig::default();
        assert_eq!(cfg.request_id, 0x7E0);
        assert_eq!(cfg.response_id, 0x7E8);
        assert_eq!(cfg.single_frame_capacity(), 7);
        assert_eq!(cfg.first_frame_data_size, 6);
        assert_eq!(cfg.consecutive_frame_data_size, 7);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_can_fd_profile_validates() {
        let cfg = SegmentConfig::can_fd();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.single_frame_capacity(), 7);
        assert_eq!(cfg.consecutive_frames_for(62), 0);
        assert_eq!(cfg.consecutive_frames_for(63), 1);
    }

    #[test]
    fn test_consecutive_frame_count() {
        let cfg = SegmentConfig::default();
        assert_eq!(cfg.consecutive_frames_for(3), 0);
        assert_eq!(cfg.consecutive_frames_for(12), 1);
        assert_eq!(cfg.consecutive_frames_for(13), 1);
        assert_eq!(cfg.consecutive_frames_for(14), 2);
        assert_eq!(cfg.consecutive_frames_for(41), 5);
    }

    #[test]
    fn test_validate_rejects_bad_frame_size() {
        let cfg = SegmentConfig {
            max_frame_size: 10,
            ..SegmentConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(IsoTpError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_capacity() {
        let cfg = SegmentConfig {
            consecutive_frame_data_size: 8,
            ..SegmentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_same_ids() {
        let cfg = SegmentConfig {
            response_id: 0x7E0,
            ..SegmentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_reversed_swaps_ids() {
        let cfg = SegmentConfig::default().reversed();
        assert_eq!(cfg.request_id, 0x7E8);
        assert_eq!(cfg.response_id, 0x7E0);
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let cfg: SegmentConfig = toml::from_str(
            r#"
            request_id = 0x18DA00F1
            response_id = 0x18DAF100
            block_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.request_id, 0x18DA00F1);
        assert_eq!(cfg.block_size, 4);
        assert_eq!(cfg.timeout_ms, 1000);
        assert!(cfg.padding);
    }
}
