//! Operational certificates and the certificate authority that issues them.
//!
//! A certificate is a serde struct: the to-be-signed part is bincode-encoded
//! and signed with ECDSA-P256-SHA256 by the issuer's key. Validity dates are
//! seconds since 2000-01-01T00:00:00Z.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{self, CryptoError};
use crate::keys::{self, OperationalKeyPair};
use tessel_core::NodeId;

pub const KEY_USAGE_DIGITAL_SIGNATURE: u16 = 0x0001;
pub const KEY_USAGE_KEY_CERT_SIGN: u16 = 0x0020;
pub const KEY_USAGE_CRL_SIGN: u16 = 0x0040;

pub const EXTENDED_KEY_USAGE_SERVER_AUTH: u8 = 1;
pub const EXTENDED_KEY_USAGE_CLIENT_AUTH: u8 = 2;

pub const SIGNATURE_ALGORITHM_ECDSA_SHA256: u8 = 1;
pub const PUBLIC_KEY_ALGORITHM_EC: u8 = 1;
pub const ELLIPTIC_CURVE_PRIME256V1: u8 = 1;

/// Root certificate id used by [`CertificateAuthority`].
pub const ROOT_CERT_ID: u64 = 0;

const KEY_IDENTIFIER_LENGTH: usize = 20;
const NOT_BEFORE_YEARS: i64 = 1;
const VALIDITY_YEARS: i64 = 10;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate encode error: {0}")]
    Encode(String),

    #[error("certificate decode error: {0}")]
    Decode(String),

    #[error("certificate signature rejected")]
    BadSignature(#[source] CryptoError),

    #[error("certificate is missing subject field {0}")]
    MissingSubjectField(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinguishedName {
    pub rcac_id: Option<u64>,
    pub fabric_id: Option<u64>,
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extensions {
    pub is_ca: bool,
    pub key_usage: u16,
    pub extended_key_usage: Vec<u8>,
    pub subject_key_identifier: Vec<u8>,
    pub authority_key_identifier: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedCertificate {
    pub serial_number: u64,
    pub signature_algorithm: u8,
    pub public_key_algorithm: u8,
    pub elliptic_curve_identifier: u8,
    pub issuer: DistinguishedName,
    pub not_before: u32,
    pub not_after: u32,
    pub subject: DistinguishedName,
    pub public_key: Vec<u8>,
    pub extensions: Extensions,
}

impl UnsignedCertificate {
    fn tbs_bytes(&self) -> Result<Vec<u8>, CertificateError> {
        bincode::serialize(self).map_err(|e| CertificateError::Encode(e.to_string()))
    }

    pub fn sign(self, issuer: &OperationalKeyPair) -> Result<Certificate, CertificateError> {
        let signature = issuer.sign(&self.tbs_bytes()?);
        Ok(Certificate {
            tbs: self,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub tbs: UnsignedCertificate,
    pub signature: Vec<u8>,
}

impl Certificate {
    pub fn encode(&self) -> Result<Vec<u8>, CertificateError> {
        bincode::serialize(self).map_err(|e| CertificateError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CertificateError> {
        use bincode::Options;
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(tessel_core::MAX_HANDSHAKE_PAYLOAD_BYTES as u64)
            .deserialize(bytes)
            .map_err(|e| CertificateError::Decode(e.to_string()))
    }

    pub fn public_key(&self) -> &[u8] {
        &self.tbs.public_key
    }

    pub fn subject(&self) -> &DistinguishedName {
        &self.tbs.subject
    }

    pub fn is_ca(&self) -> bool {
        self.tbs.extensions.is_ca
    }

    pub fn fabric_id(&self) -> Result<u64, CertificateError> {
        self.tbs
            .subject
            .fabric_id
            .ok_or(CertificateError::MissingSubjectField("fabric_id"))
    }

    pub fn node_id(&self) -> Result<NodeId, CertificateError> {
        self.tbs
            .subject
            .node_id
            .ok_or(CertificateError::MissingSubjectField("node_id"))
    }

    /// Check that `issuer_public_key` signed this certificate.
    pub fn verify(&self, issuer_public_key: &[u8]) -> Result<(), CertificateError> {
        keys::verify_signature(issuer_public_key, &self.tbs.tbs_bytes()?, &self.signature)
            .map_err(CertificateError::BadSignature)
    }
}

/// Issues a self-signed root and node operational certificates under it.
pub struct CertificateAuthority {
    root_key_pair: OperationalKeyPair,
    root_key_identifier: Vec<u8>,
    root_cert: Certificate,
    next_serial: u64,
}

impl CertificateAuthority {
    pub fn new() -> Result<Self, CertificateError> {
        Self::with_key_pair(OperationalKeyPair::generate())
    }

    pub fn with_key_pair(root_key_pair: OperationalKeyPair) -> Result<Self, CertificateError> {
        let root_public_key = root_key_pair.public_key();
        let root_key_identifier = key_identifier(&root_public_key);
        let now = Utc::now();
        let issuer = DistinguishedName {
            rcac_id: Some(ROOT_CERT_ID),
            ..DistinguishedName::default()
        };

        let root_cert = UnsignedCertificate {
            serial_number: ROOT_CERT_ID,
            signature_algorithm: SIGNATURE_ALGORITHM_ECDSA_SHA256,
            public_key_algorithm: PUBLIC_KEY_ALGORITHM_EC,
            elliptic_curve_identifier: ELLIPTIC_CURVE_PRIME256V1,
            issuer: issuer.clone(),
            not_before: matter_epoch_seconds(now - Duration::days(365 * NOT_BEFORE_YEARS)),
            not_after: matter_epoch_seconds(now + Duration::days(365 * VALIDITY_YEARS)),
            subject: issuer,
            public_key: root_public_key,
            extensions: Extensions {
                is_ca: true,
                key_usage: KEY_USAGE_KEY_CERT_SIGN | KEY_USAGE_CRL_SIGN,
                extended_key_usage: Vec::new(),
                subject_key_identifier: root_key_identifier.clone(),
                authority_key_identifier: root_key_identifier.clone(),
            },
        }
        .sign(&root_key_pair)?;

        Ok(Self {
            root_key_pair,
            root_key_identifier,
            root_cert,
            next_serial: ROOT_CERT_ID + 1,
        })
    }

    pub fn root_cert(&self) -> &Certificate {
        &self.root_cert
    }

    pub fn root_public_key(&self) -> &[u8] {
        self.root_cert.public_key()
    }

    /// Issue a node operational certificate for `public_key`.
    pub fn generate_noc(
        &mut self,
        public_key: &[u8],
        fabric_id: u64,
        node_id: NodeId,
    ) -> Result<Certificate, CertificateError> {
        let serial_number = self.next_serial;
        self.next_serial += 1;
        let now = Utc::now();

        let noc = UnsignedCertificate {
            serial_number,
            signature_algorithm: SIGNATURE_ALGORITHM_ECDSA_SHA256,
            public_key_algorithm: PUBLIC_KEY_ALGORITHM_EC,
            elliptic_curve_identifier: ELLIPTIC_CURVE_PRIME256V1,
            issuer: DistinguishedName {
                rcac_id: Some(ROOT_CERT_ID),
                ..DistinguishedName::default()
            },
            not_before: matter_epoch_seconds(now - Duration::days(365 * NOT_BEFORE_YEARS)),
            not_after: matter_epoch_seconds(now + Duration::days(365 * VALIDITY_YEARS)),
            subject: DistinguishedName {
                fabric_id: Some(fabric_id),
                node_id: Some(node_id),
                ..DistinguishedName::default()
            },
            public_key: public_key.to_vec(),
            extensions: Extensions {
                is_ca: false,
                key_usage: KEY_USAGE_DIGITAL_SIGNATURE,
                extended_key_usage: vec![
                    EXTENDED_KEY_USAGE_CLIENT_AUTH,
                    EXTENDED_KEY_USAGE_SERVER_AUTH,
                ],
                subject_key_identifier: key_identifier(public_key),
                authority_key_identifier: self.root_key_identifier.clone(),
            },
        }
        .sign(&self.root_key_pair)?;

        debug!(serial_number, fabric_id, node_id, "issued node operational certificate");
        Ok(noc)
    }
}

fn key_identifier(public_key: &[u8]) -> Vec<u8> {
    crypto::hash(&[public_key])[..KEY_IDENTIFIER_LENGTH].to_vec()
}

fn matter_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Seconds since 2000-01-01 UTC, clamped to the `u32` range.
pub fn matter_epoch_seconds(date: DateTime<Utc>) -> u32 {
    let seconds = (date - matter_epoch()).num_seconds();
    seconds.clamp(0, i64::from(u32::MAX)) as u32
}
