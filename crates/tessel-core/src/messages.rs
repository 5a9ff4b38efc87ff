//! Handshake payloads carried by the secure-channel protocol.
//!
//! Payloads are serde structs encoded with `bincode` (little-endian, varint
//! lengths, bounded by [`MAX_HANDSHAKE_PAYLOAD_BYTES`]). The exact bytes a peer
//! sent are fed into handshake transcripts, so callers keep the encoded form
//! returned by [`HandshakePayload::to_bytes`] rather than re-encoding.

use bincode::Options;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{CodecError, MAX_HANDSHAKE_PAYLOAD_BYTES};

pub const RANDOM_LENGTH: usize = 32;
pub const DESTINATION_ID_LENGTH: usize = 32;
pub const RESUMPTION_ID_LENGTH: usize = 16;

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_HANDSHAKE_PAYLOAD_BYTES as u64)
}

pub trait HandshakePayload: Serialize + DeserializeOwned {
    fn to_bytes(&self) -> Result<Bytes, CodecError> {
        codec()
            .serialize(self)
            .map(Bytes::from)
            .map_err(|e| CodecError::PayloadEncode(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        codec()
            .deserialize(bytes)
            .map_err(|e| CodecError::PayloadDecode(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbkdfParameters {
    pub iterations: u32,
    pub salt: Vec<u8>,
}

/// MRP timing a peer asks the other side to use when talking to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionParameters {
    pub idle_retransmission_timeout_ms: Option<u32>,
    pub active_retransmission_timeout_ms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbkdfParamRequest {
    pub random: [u8; RANDOM_LENGTH],
    pub session_id: u16,
    pub passcode_id: u16,
    pub has_pbkdf_parameters: bool,
    pub mrp_parameters: Option<SessionParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbkdfParamResponse {
    pub peer_random: [u8; RANDOM_LENGTH],
    pub random: [u8; RANDOM_LENGTH],
    pub session_id: u16,
    pub pbkdf_parameters: Option<PbkdfParameters>,
    pub mrp_parameters: Option<SessionParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasePake1 {
    pub x: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasePake2 {
    pub y: Vec<u8>,
    pub verifier: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasePake3 {
    pub verifier: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSigma1 {
    pub random: [u8; RANDOM_LENGTH],
    pub session_id: u16,
    pub destination_id: [u8; DESTINATION_ID_LENGTH],
    pub ephemeral_public_key: Vec<u8>,
    pub mrp_parameters: Option<SessionParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSigma2 {
    pub random: [u8; RANDOM_LENGTH],
    pub session_id: u16,
    pub ephemeral_public_key: Vec<u8>,
    pub encrypted: Vec<u8>,
    pub mrp_parameters: Option<SessionParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSigma3 {
    pub encrypted: Vec<u8>,
}

/// Plaintext of the encrypted Sigma2/Sigma3 blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseEncryptedData {
    pub operational_cert: Vec<u8>,
    pub intermediate_ca_cert: Option<Vec<u8>>,
    pub signature: Vec<u8>,
    pub resumption_id: Option<[u8; RESUMPTION_ID_LENGTH]>,
}

/// Data covered by the Sigma2/Sigma3 signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSignedData {
    pub operational_cert: Vec<u8>,
    pub intermediate_ca_cert: Option<Vec<u8>>,
    pub own_ephemeral_public_key: Vec<u8>,
    pub peer_ephemeral_public_key: Vec<u8>,
}

impl HandshakePayload for PbkdfParamRequest {}
impl HandshakePayload for PbkdfParamResponse {}
impl HandshakePayload for PasePake1 {}
impl HandshakePayload for PasePake2 {}
impl HandshakePayload for PasePake3 {}
impl HandshakePayload for CaseSigma1 {}
impl HandshakePayload for CaseSigma2 {}
impl HandshakePayload for CaseSigma3 {}
impl HandshakePayload for CaseEncryptedData {}
impl HandshakePayload for CaseSignedData {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pbkdf_response_roundtrip() {
        let response = PbkdfParamResponse {
            peer_random: [1; RANDOM_LENGTH],
            random: [2; RANDOM_LENGTH],
            session_id: 0x1234,
            pbkdf_parameters: Some(PbkdfParameters {
                iterations: 1000,
                salt: vec![9; 32],
            }),
            mrp_parameters: Some(SessionParameters {
                idle_retransmission_timeout_ms: None,
                active_retransmission_timeout_ms: Some(300),
            }),
        };
        let bytes = response.to_bytes().unwrap();
        assert_eq!(PbkdfParamResponse::from_bytes(&bytes).unwrap(), response);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let bytes = PasePake2 {
            y: vec![4; 65],
            verifier: vec![5; 32],
        }
        .to_bytes()
        .unwrap();
        let err = PasePake2::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::PayloadDecode(_)));
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        // varint marker 0xfd followed by a u32 length far beyond the limit
        let hostile = [0xfd, 0xff, 0xff, 0xff, 0x7f];
        assert!(PasePake3::from_bytes(&hostile).is_err());
    }
}
