//! UDS response classification
//!
//! ISO-TP is payload-agnostic; this module only helps callers read what came
//! back. A negative response is `0x7F <SID> <NRC>`, anything else is positive
//! with the response SID (request SID + 0x40) in byte 0.

use std::fmt;

use crate::error::IsoTpError;

/// Service identifier of a negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Offset between a request SID and its positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// UDS Negative Response Codes (NRC) a tester commonly sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    GeneralProgrammingFailure,
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    /// Reserved or manufacturer specific
    Other(u8),
}

impl NegativeResponseCode {
    const TABLE: [(u8, Self, &'static str); 17] = [
        (0x10, Self::GeneralReject, "General reject"),
        (0x11, Self::ServiceNotSupported, "Service not supported"),
        (0x12, Self::SubFunctionNotSupported, "Sub-function not supported"),
        (
            0x13,
            Self::IncorrectMessageLengthOrFormat,
            "Incorrect message length or invalid format",
        ),
        (0x14, Self::ResponseTooLong, "Response too long"),
        (0x21, Self::BusyRepeatRequest, "Busy, repeat request"),
        (0x22, Self::ConditionsNotCorrect, "Conditions not correct"),
        (0x24, Self::RequestSequenceError, "Request sequence error"),
        (0x31, Self::RequestOutOfRange, "Request out of range"),
        (0x33, Self::SecurityAccessDenied, "Security access denied"),
        (0x35, Self::InvalidKey, "Invalid key"),
        (0x36, Self::ExceededNumberOfAttempts, "Exceeded number of attempts"),
        (
            0x37,
            Self::RequiredTimeDelayNotExpired,
            "Required time delay not expired",
        ),
        (0x72, Self::GeneralProgrammingFailure, "General programming failure"),
        (
            0x78,
            Self::ResponsePending,
            "Request correctly received, response pending",
        ),
        (
            0x7E,
            Self::SubFunctionNotSupportedInActiveSession,
            "Sub-function not supported in active session",
        ),
        (
            0x7F,
            Self::ServiceNotSupportedInActiveSession,
            "Service not supported in active session",
        ),
    ];

    pub fn code(&self) -> u8 {
        match self {
            Self::Other(code) => *code,
            known => Self::TABLE
                .iter()
                .find(|(_, nrc, _)| nrc == known)
                .map(|(code, _, _)| *code)
                .unwrap_or_default(),
        }
    }

    pub fn description(&self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, nrc, _)| nrc == self)
            .map(|(_, _, text)| *text)
            .unwrap_or("Reserved or manufacturer specific")
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        Self::TABLE
            .iter()
            .find(|(code, _, _)| *code == value)
            .map(|(_, nrc, _)| *nrc)
            .unwrap_or(Self::Other(value))
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.code(), self.description())
    }
}

/// Classified UDS response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// `service_id` is the request SID the response answers
    Positive { service_id: u8, data: Vec<u8> },
    Negative {
        service_id: u8,
        nrc: NegativeResponseCode,
    },
}

impl UdsResponse {
    pub fn parse(payload: &[u8]) -> Result<Self, IsoTpError> {
        match payload {
            [] => Err(IsoTpError::InvalidResponse("empty response".to_string())),
            [NEGATIVE_RESPONSE_SID, service_id, nrc, ..] => Ok(Self::Negative {
                service_id: *service_id,
                nrc: NegativeResponseCode::from(*nrc),
            }),
            [NEGATIVE_RESPONSE_SID, ..] => Err(IsoTpError::InvalidResponse(format!(
                "truncated negative response {}",
                hex::encode_upper(payload)
            ))),
            [sid, data @ ..] if sid & POSITIVE_RESPONSE_OFFSET != 0 => Ok(Self::Positive {
                service_id: sid - POSITIVE_RESPONSE_OFFSET,
                data: data.to_vec(),
            }),
            [sid, ..] => Err(IsoTpError::InvalidResponse(format!(
                "0x{:02X} is not a response service identifier",
                sid
            ))),
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Positive { .. })
    }

    /// Request SID this response belongs to
    pub fn service_id(&self) -> u8 {
        match self {
            Self::Positive { service_id, .. } | Self::Negative { service_id, .. } => *service_id,
        }
    }
}

impl fmt::Display for UdsResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive { service_id, .. } => {
                write!(f, "Positive response to SID 0x{:02X}", service_id)
            }
            Self::Negative { service_id, nrc } => {
                write!(f, "Negative response to SID 0x{:02X}: {}", service_id, nrc)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_parse_positive() {
        let response = UdsResponse::parse(&[0x62, 0xF1, 0x90, 0x57]).unwrap();
        assert_eq!(
            response,
            UdsResponse::Positive {
                service_id: 0x22,
                data: vec![0xF1, 0x90, 0x57]
            }
        );
        assert!(response.is_positive());
        assert_eq!(response.to_string(), "Positive response to SID 0x22");
    }

    #[test]
    fn test_parse_negative() {
        let response = UdsResponse::parse(&[0x7F, 0x27, 0x33]).unwrap();
        assert_eq!(response.service_id(), 0x27);
        assert!(!response.is_positive());
        assert_eq!(
            response.to_string(),
            "Negative response to SID 0x27: 0x33 (Security access denied)"
        );
    }

    #[rstest]
    #[case(&[])]
    #[case(&[0x7F, 0x22])]
    #[case(&[0x22, 0xF1, 0x90])]
    fn test_parse_rejects_malformed(#[case] payload: &[u8]) {
        assert!(matches!(
            UdsResponse::parse(payload),
            Err(IsoTpError::InvalidResponse(_))
        ));
    }

    #[rstest]
    #[case(0x78, NegativeResponseCode::ResponsePending)]
    #[case(0x31, NegativeResponseCode::RequestOutOfRange)]
    #[case(0x93, NegativeResponseCode::Other(0x93))]
    fn test_nrc_from_byte(#[case] byte: u8, #[case] expected: NegativeResponseCode) {
        let nrc = NegativeResponseCode::from(byte);
        assert_eq!(nrc, expected);
        assert_eq!(nrc.code(), byte);
    }

    #[test]
    fn test_unknown_nrc_description() {
        assert_eq!(
            NegativeResponseCode::Other(0xF0).to_string(),
            "0xF0 (Reserved or manufacturer specific)"
        );
    }
}
