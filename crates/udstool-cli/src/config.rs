//! Configuration file handling for udstool

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use udstool_isotp::{EcuConfig, SegmentConfig};

/// Config file picked up from the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "udstool.toml";

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// ISO-TP link parameters
    #[serde(default)]
    pub isotp: SegmentConfig,
    /// Simulated ECU behaviour
    #[serde(default)]
    pub ecu: EcuConfig,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub request_id: Option<u32>,
    pub response_id: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub fd: bool,
}

impl Config {
    /// Load `path`, or `udstool.toml` in the working directory if present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::load_from(&fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply CLI overrides and validate the result
    pub fn merge_with_args(mut self, overrides: &Overrides) -> Result<Self> {
        if overrides.fd {
            let fd = SegmentConfig::can_fd();
            self.isotp.max_frame_size = fd.max_frame_size;
            self.isotp.first_frame_data_size = fd.first_frame_data_size;
            self.isotp.consecutive_frame_data_size = fd.consecutive_frame_data_size;
        }
        if let Some(id) = overrides.request_id {
            self.isotp.request_id = id;
        }
        if let Some(id) = overrides.response_id {
            self.isotp.response_id = id;
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            self.isotp.timeout_ms = timeout_ms;
        }

        self.isotp
            .validate()
            .context("Invalid [isotp] configuration")?;
        Ok(self)
    }
}

/// Parse a CAN identifier given as `0x7E0`, `7E0h` or plain hex
pub fn parse_can_id(text: &str) -> Result<u32, String> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .trim_end_matches(['h', 'H']);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid CAN ID '{}': {}", text, e))
}
