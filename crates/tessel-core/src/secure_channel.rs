//! Secure-channel protocol message types and status reports.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CodecError, SECURE_CHANNEL_PROTOCOL_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MsgCounterSyncReq = 0x00,
    MsgCounterSyncRsp = 0x01,
    StandaloneAck = 0x10,
    PbkdfParamRequest = 0x20,
    PbkdfParamResponse = 0x21,
    PasePake1 = 0x22,
    PasePake2 = 0x23,
    PasePake3 = 0x24,
    Sigma1 = 0x30,
    Sigma2 = 0x31,
    Sigma3 = 0x32,
    Sigma2Resume = 0x33,
    StatusReport = 0x40,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::MsgCounterSyncReq,
            0x01 => Self::MsgCounterSyncRsp,
            0x10 => Self::StandaloneAck,
            0x20 => Self::PbkdfParamRequest,
            0x21 => Self::PbkdfParamResponse,
            0x22 => Self::PasePake1,
            0x23 => Self::PasePake2,
            0x24 => Self::PasePake3,
            0x30 => Self::Sigma1,
            0x31 => Self::Sigma2,
            0x32 => Self::Sigma3,
            0x33 => Self::Sigma2Resume,
            0x40 => Self::StatusReport,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

/// Whether `(protocol_id, message_type)` is the secure-channel standalone ack.
pub fn is_standalone_ack(protocol_id: u16, message_type: u8) -> bool {
    protocol_id == SECURE_CHANNEL_PROTOCOL_ID && message_type == MessageType::StandaloneAck.code()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum GeneralStatusCode {
    Success = 0,
    Failure = 1,
    BadPrecondition = 2,
    OutOfRange = 3,
    BadRequest = 4,
    Unsupported = 5,
    Unexpected = 6,
    ResourceExhausted = 7,
    Busy = 8,
    Timeout = 9,
    Continue = 10,
    Aborted = 11,
    InvalidArgument = 12,
    NotFound = 13,
    AlreadyExists = 14,
    PermissionDenied = 15,
    DataLoss = 16,
}

impl TryFrom<u16> for GeneralStatusCode {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use GeneralStatusCode::*;
        const ALL: [GeneralStatusCode; 17] = [
            Success,
            Failure,
            BadPrecondition,
            OutOfRange,
            BadRequest,
            Unsupported,
            Unexpected,
            ResourceExhausted,
            Busy,
            Timeout,
            Continue,
            Aborted,
            InvalidArgument,
            NotFound,
            AlreadyExists,
            PermissionDenied,
            DataLoss,
        ];
        ALL.get(value as usize)
            .copied()
            .ok_or(CodecError::UnknownStatusCode(value))
    }
}

/// Secure-channel protocol specific status codes.
pub mod protocol_code {
    pub const SESSION_ESTABLISHMENT_SUCCESS: u16 = 0;
    pub const NO_SHARED_TRUST_ROOTS: u16 = 1;
    pub const INVALID_PARAMETER: u16 = 2;
    pub const CLOSE_SESSION: u16 = 3;
    pub const BUSY: u16 = 4;
}

pub const STATUS_REPORT_SIZE: usize = 8;

/// `[general code (2 LE)][protocol id (4 LE)][protocol code (2 LE)]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub general_code: GeneralStatusCode,
    pub protocol_id: u32,
    pub protocol_code: u16,
}

impl StatusReport {
    pub fn success() -> Self {
        Self {
            general_code: GeneralStatusCode::Success,
            protocol_id: SECURE_CHANNEL_PROTOCOL_ID.into(),
            protocol_code: protocol_code::SESSION_ESTABLISHMENT_SUCCESS,
        }
    }

    /// Generic handshake failure.
    pub fn failure() -> Self {
        Self {
            general_code: GeneralStatusCode::Failure,
            protocol_id: SECURE_CHANNEL_PROTOCOL_ID.into(),
            protocol_code: protocol_code::INVALID_PARAMETER,
        }
    }

    pub fn is_success(&self) -> bool {
        self.general_code == GeneralStatusCode::Success
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATUS_REPORT_SIZE);
        buf.put_u16_le(self.general_code as u16);
        buf.put_u32_le(self.protocol_id);
        buf.put_u16_le(self.protocol_code);
        buf.freeze()
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < STATUS_REPORT_SIZE {
            return Err(CodecError::TooShort {
                needed: STATUS_REPORT_SIZE,
                available: bytes.len(),
            });
        }
        let general_code = GeneralStatusCode::try_from(bytes.get_u16_le())?;
        let protocol_id = bytes.get_u32_le();
        let protocol_code = bytes.get_u16_le();
        Ok(Self {
            general_code,
            protocol_id,
            protocol_code,
        })
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (protocol 0x{:04x}, code {})",
            self.general_code, self.protocol_id, self.protocol_code
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        for code in [0x00, 0x01, 0x10, 0x20, 0x21, 0x22, 0x23, 0x24, 0x30, 0x31, 0x32, 0x33, 0x40] {
            assert_eq!(MessageType::try_from(code).unwrap().code(), code);
        }
        assert_eq!(
            MessageType::try_from(0x11),
            Err(CodecError::UnknownMessageType(0x11))
        );
    }

    #[test]
    fn test_standalone_ack_detection() {
        assert!(is_standalone_ack(0, 0x10));
        assert!(!is_standalone_ack(1, 0x10));
        assert!(!is_standalone_ack(0, 0x40));
    }

    #[test]
    fn test_status_report_layout() {
        let failure = StatusReport::failure().encode();
        assert_eq!(failure.as_ref(), &[1, 0, 0, 0, 0, 0, 2, 0]);

        let success = StatusReport::decode(&StatusReport::success().encode()).unwrap();
        assert!(success.is_success());
        assert_eq!(success.protocol_code, protocol_code::SESSION_ESTABLISHMENT_SUCCESS);
    }

    #[test]
    fn test_status_report_rejects_garbage() {
        assert!(matches!(
            StatusReport::decode(&[0, 0, 0]),
            Err(CodecError::TooShort { .. })
        ));
        assert_eq!(
            StatusReport::decode(&[0xff, 0, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::UnknownStatusCode(0xff))
        );
    }
}
