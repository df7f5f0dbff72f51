//! ISO-TP frame codec
//!
//! Pure encode/decode of the four ISO 15765-2 frame kinds. Normal addressing
//! only: the protocol control information (PCI) always starts at byte 0.
//!
//! ```text
//!  Single       | 0x0 | SF_DL |  data (0..7)          |
//!  First        | 0x1 | FF_DL (12 bit) | data (6)     |
//!  Consecutive  | 0x2 |  SN   |  data (7)             |
//!  FlowControl  | 0x3 |  FS   |  BS  | STmin |        |
//! ```

use std::fmt;
use std::time::Duration;

use crate::config::SegmentConfig;
use crate::error::IsoTpError;

/// Largest payload expressible in a 12-bit First Frame length
pub const MAX_PAYLOAD_LEN: usize = 0xFFF;

/// Frame sizes a CAN-FD controller can put on the bus
pub(crate) const CAN_FD_FRAME_SIZES: [usize; 8] = [8, 12, 16, 20, 24, 32, 48, 64];

const SF_PCI: u8 = 0x00;
const FF_PCI: u8 = 0x10;
const CF_PCI: u8 = 0x20;
const FC_PCI: u8 = 0x30;

/// Frame kind, taken from the high nibble of byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Single,
    First,
    Consecutive,
    FlowControl,
}

impl FrameKind {
    pub fn from_pci(byte0: u8) -> Result<Self, IsoTpError> {
        match byte0 >> 4 {
            0x0 => Ok(Self::Single),
            0x1 => Ok(Self::First),
            0x2 => Ok(Self::Consecutive),
            0x3 => Ok(Self::FlowControl),
            other => Err(IsoTpError::InvalidFrame(format!(
                "unknown PCI type 0x{:X}",
                other
            ))),
        }
    }

    /// Two-letter abbreviation used in trace lines
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Self::Single => "SF",
            Self::First => "FF",
            Self::Consecutive => "CF",
            Self::FlowControl => "FC",
        }
    }
}

/// Flow status carried in the low nibble of a Flow-Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowStatus {
    ContinueToSend = 0x0,
    Wait = 0x1,
    Overflow = 0x2,
}

impl TryFrom<u8> for FlowStatus {
    type Error = IsoTpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::ContinueToSend),
            0x1 => Ok(Self::Wait),
            0x2 => Ok(Self::Overflow),
            other => Err(IsoTpError::InvalidFrame(format!(
                "unknown flow status 0x{:X}",
                other
            ))),
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ContinueToSend => "CTS",
            Self::Wait => "WAIT",
            Self::Overflow => "OVFLW",
        };
        f.write_str(s)
    }
}

/// Minimum separation time between Consecutive Frames (STmin byte)
///
/// - `0x00..=0x7F`: milliseconds
/// - `0xF1..=0xF9`: 100 to 900 microseconds
/// - anything else is reserved and read as the 127 ms maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeparationTime(u8);

impl SeparationTime {
    pub const ZERO: Self = Self(0);

    pub fn from_byte(raw: u8) -> Self {
        Self(raw)
    }

    pub fn as_byte(&self) -> u8 {
        self.0
    }

    pub fn duration(&self) -> Duration {
        match self.0 {
            ms @ 0x00..=0x7F => Duration::from_millis(ms as u64),
            us @ 0xF1..=0xF9 => Duration::from_micros((us - 0xF0) as u64 * 100),
            _ => Duration::from_millis(0x7F),
        }
    }
}

impl fmt::Display for SeparationTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0xF1..=0xF9 => write!(f, "{}us", self.duration().as_micros()),
            _ => write!(f, "{}ms", self.duration().as_millis()),
        }
    }
}

/// Contents of a Flow-Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub status: FlowStatus,
    /// Consecutive Frames allowed before the next FC (0 = unlimited)
    pub block_size: u8,
    pub st_min: SeparationTime,
}

impl FlowControl {
    pub fn continue_to_send(block_size: u8, st_min: u8) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            st_min: SeparationTime::from_byte(st_min),
        }
    }
}

/// A decoded ISO-TP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    Single { data: Vec<u8> },
    First { total_len: usize, data: Vec<u8> },
    Consecutive { seq: u8, data: Vec<u8> },
    FlowControl(FlowControl),
}

impl IsoTpFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Single { .. } => FrameKind::Single,
            Self::First { .. } => FrameKind::First,
            Self::Consecutive { .. } => FrameKind::Consecutive,
            Self::FlowControl(_) => FrameKind::FlowControl,
        }
    }
}

impl fmt::Display for IsoTpFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single { data } => write!(f, "SF: {}", hex::encode_upper(data)),
            Self::First { total_len, data } => write!(
                f,
                "FF: Length={}, Data={}",
                total_len,
                hex::encode_upper(data)
            ),
            Self::Consecutive { seq, data } => {
                write!(f, "CF: SN={}, Data={}", seq, hex::encode_upper(data))
            }
            Self::FlowControl(fc) => write!(
                f,
                "FC: Status={}, BS={}, ST={}",
                fc.status, fc.block_size, fc.st_min
            ),
        }
    }
}

/// Pad a frame for transmission
///
/// With padding enabled the frame is filled up to `max_frame_size`. Without
/// padding a CAN-FD frame longer than 8 bytes is still rounded up to the next
/// length the bus can carry.
fn pad(frame: &mut Vec<u8>, config: &SegmentConfig) {
    let target = if config.padding {
        config.max_frame_size
    } else if frame.len() > 8 {
        CAN_FD_FRAME_SIZES
            .iter()
            .copied()
            .find(|&size| size >= frame.len())
            .unwrap_or(config.max_frame_size)
    } else {
        frame.len()
    };
    if frame.len() < target {
        frame.resize(target, config.padding_byte);
    }
}

// Builders below assume the caller already checked lengths against `config`.

pub(crate) fn build_single(payload: &[u8], config: &SegmentConfig) -> Vec<u8> {
    let mut frame = Vec::with_capacity(config.max_frame_size);
    frame.push(SF_PCI | payload.len() as u8);
    frame.extend_from_slice(payload);
    pad(&mut frame, config);
    frame
}

pub(crate) fn build_first(payload: &[u8], config: &SegmentConfig) -> Vec<u8> {
    let len = payload.len() as u16;
    let chunk = payload.len().min(config.first_frame_data_size);

    let mut frame = Vec::with_capacity(config.max_frame_size);
    frame.push(FF_PCI | ((len >> 8) as u8 & 0x0F));
    frame.push((len & 0xFF) as u8);
    frame.extend_from_slice(&payload[..chunk]);
    pad(&mut frame, config);
    frame
}

pub(crate) fn build_consecutive(seq: u8, chunk: &[u8], config: &SegmentConfig) -> Vec<u8> {
    let mut frame = Vec::with_capacity(config.max_frame_size);
    frame.push(CF_PCI | (seq & 0x0F));
    frame.extend_from_slice(chunk);
    pad(&mut frame, config);
    frame
}

/// Encode a Single Frame
pub fn encode_single(payload: &[u8], config: &SegmentConfig) -> Result<Vec<u8>, IsoTpError> {
    if payload.len() > config.single_frame_capacity() {
        return Err(IsoTpError::InvalidRequest(format!(
            "{} bytes do not fit a single frame (max {})",
            payload.len(),
            config.single_frame_capacity()
        )));
    }

    Ok(build_single(payload, config))
}

/// Encode a First Frame carrying the start of `payload`
pub fn encode_first(payload: &[u8], config: &SegmentConfig) -> Result<Vec<u8>, IsoTpError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(IsoTpError::PayloadTooLarge(payload.len()));
    }
    if payload.len() <= config.single_frame_capacity() {
        return Err(IsoTpError::InvalidRequest(format!(
            "{} bytes fit a single frame, refusing to segment",
            payload.len()
        )));
    }

    Ok(build_first(payload, config))
}

/// Encode a Consecutive Frame
pub fn encode_consecutive(
    seq: u8,
    chunk: &[u8],
    config: &SegmentConfig,
) -> Result<Vec<u8>, IsoTpError> {
    if chunk.len() > config.consecutive_frame_data_size {
        return Err(IsoTpError::InvalidRequest(format!(
            "{} bytes do not fit a consecutive frame (max {})",
            chunk.len(),
            config.consecutive_frame_data_size
        )));
    }

    Ok(build_consecutive(seq, chunk, config))
}

/// Encode a Flow-Control frame
pub fn encode_flow_control(fc: &FlowControl, config: &SegmentConfig) -> Vec<u8> {
    let mut frame = Vec::with_capacity(config.max_frame_size);
    frame.push(FC_PCI | fc.status as u8);
    frame.push(fc.block_size);
    frame.push(fc.st_min.as_byte());
    pad(&mut frame, config);
    frame
}

/// Decode a raw frame
///
/// Padding after the meaningful bytes is ignored for Single and
/// Flow-Control frames. First and Consecutive frames return every byte after
/// the PCI; the reassembler trims the tail to the announced length.
pub fn decode(frame: &[u8]) -> Result<IsoTpFrame, IsoTpError> {
    let pci = *frame
        .first()
        .ok_or_else(|| IsoTpError::InvalidFrame("empty frame".to_string()))?;

    match FrameKind::from_pci(pci)? {
        FrameKind::Single => {
            let len = (pci & 0x0F) as usize;
            if len > 7 {
                return Err(IsoTpError::InvalidFrame(format!(
                    "single frame length {} exceeds 7",
                    len
                )));
            }
            if frame.len() < 1 + len {
                return Err(IsoTpError::InvalidFrame(format!(
                    "single frame announces {} bytes but carries {}",
                    len,
                    frame.len() - 1
                )));
            }
            Ok(IsoTpFrame::Single {
                data: frame[1..1 + len].to_vec(),
            })
        }
        FrameKind::First => {
            if frame.len() < 2 {
                return Err(IsoTpError::InvalidFrame(
                    "first frame shorter than 2 bytes".to_string(),
                ));
            }
            let total_len = (((pci & 0x0F) as usize) << 8) | frame[1] as usize;
            if total_len < 8 {
                return Err(IsoTpError::InvalidFrame(format!(
                    "first frame length {} is below the minimum of 8",
                    total_len
                )));
            }
            Ok(IsoTpFrame::First {
                total_len,
                data: frame[2..].to_vec(),
            })
        }
        FrameKind::Consecutive => Ok(IsoTpFrame::Consecutive {
            seq: pci & 0x0F,
            data: frame[1..].to_vec(),
        }),
        FrameKind::FlowControl => {
            if frame.len() < 3 {
                return Err(IsoTpError::InvalidFrame(
                    "flow control frame shorter than 3 bytes".to_string(),
                ));
            }
            Ok(IsoTpFrame::FlowControl(FlowControl {
                status: FlowStatus::try_from(pci & 0x0F)?,
                block_size: frame[1],
                st_min: SeparationTime::from_byte(frame[2]),
            }))
        }
    }
}
