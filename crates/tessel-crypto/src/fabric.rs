//! Fabrics: the operational trust domain a node belongs to.
//!
//! # Design
//!
//! A [`Fabric`] is immutable once built. It holds the node's operational key
//! pair, its certificate chain, and the identity protection key (IPK). The
//! fabric derives two identifiers from these:
//!
//! - the compressed fabric id (operational id), an 8-byte HKDF output salted
//!   with the fabric id in **big-endian**;
//! - CASE destination ids, an HMAC over data that carries the fabric and node
//!   ids in **little-endian**.
//!
//! The mixed byte order matches what deployed peers compute; both encodings
//! are kept as-is.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::certificate::{Certificate, CertificateError};
use crate::crypto::{self, CryptoError, HASH_LENGTH, SYMMETRIC_KEY_LENGTH};
use crate::keys::{OperationalKeyPair, PUBLIC_KEY_LENGTH};
use tessel_core::NodeId;

const COMPRESSED_FABRIC_INFO: &[u8] = b"CompressedFabric";
const GROUP_KEY_INFO: &[u8] = b"GroupKey v1.0";
pub const COMPRESSED_FABRIC_ID_LENGTH: usize = 8;

/// 1-based position of a fabric on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FabricIndex(pub u8);

impl std::fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("fabric builder is missing the {0}")]
    Missing(&'static str),

    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("operational certificate does not match the fabric key pair")]
    KeyMismatch,

    #[error("certificate belongs to fabric {actual:#x}, expected {expected:#x}")]
    FabricMismatch { expected: u64, actual: u64 },

    #[error("operational certificate must not be a CA certificate")]
    NotAnEndEntity,
}

pub struct Fabric {
    fabric_index: FabricIndex,
    fabric_id: u64,
    node_id: NodeId,
    operational_id: [u8; COMPRESSED_FABRIC_ID_LENGTH],
    key_pair: OperationalKeyPair,
    vendor_id: u16,
    root_cert: Certificate,
    intermediate_ca_cert: Option<Certificate>,
    operational_cert: Certificate,
    identity_protection_key: Zeroizing<Vec<u8>>,
    operational_identity_protection_key: Zeroizing<Vec<u8>>,
    label: String,
}

impl Fabric {
    pub fn fabric_index(&self) -> FabricIndex {
        self.fabric_index
    }

    pub fn fabric_id(&self) -> u64 {
        self.fabric_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Compressed fabric id.
    pub fn operational_id(&self) -> &[u8; COMPRESSED_FABRIC_ID_LENGTH] {
        &self.operational_id
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn root_public_key(&self) -> &[u8] {
        self.root_cert.public_key()
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key_pair.public_key()
    }

    pub fn root_cert(&self) -> &Certificate {
        &self.root_cert
    }

    pub fn intermediate_ca_cert(&self) -> Option<&Certificate> {
        self.intermediate_ca_cert.as_ref()
    }

    pub fn operational_cert(&self) -> &Certificate {
        &self.operational_cert
    }

    pub fn identity_protection_key(&self) -> &[u8] {
        &self.identity_protection_key
    }

    /// Group key derived from the IPK; keys CASE destination ids and salts.
    pub fn operational_identity_protection_key(&self) -> &[u8] {
        &self.operational_identity_protection_key
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.key_pair.sign(data)
    }

    /// `HMAC(opIPK, random ‖ rootPublicKey ‖ fabricId (LE) ‖ nodeId (LE))`
    pub fn destination_id(
        &self,
        node_id: NodeId,
        random: &[u8],
    ) -> Result<[u8; HASH_LENGTH], CryptoError> {
        let root_public_key = self.root_public_key();
        let mut data = Vec::with_capacity(random.len() + root_public_key.len() + 16);
        data.extend_from_slice(random);
        data.extend_from_slice(root_public_key);
        data.extend_from_slice(&self.fabric_id.to_le_bytes());
        data.extend_from_slice(&node_id.to_le_bytes());
        crypto::hmac(&self.operational_identity_protection_key, &data)
    }

    /// Validate a peer's certificate chain against this fabric's root and
    /// return the peer's node id.
    pub fn verify_credentials(
        &self,
        operational_cert: &Certificate,
        intermediate_ca_cert: Option<&Certificate>,
    ) -> Result<NodeId, FabricError> {
        verify_chain(self.root_public_key(), operational_cert, intermediate_ca_cert)?;
        let fabric_id = operational_cert.fabric_id()?;
        if fabric_id != self.fabric_id {
            return Err(FabricError::FabricMismatch {
                expected: self.fabric_id,
                actual: fabric_id,
            });
        }
        Ok(operational_cert.node_id()?)
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("fabric_index", &self.fabric_index)
            .field("fabric_id", &self.fabric_id)
            .field("node_id", &self.node_id)
            .field("operational_id", &hex::encode(self.operational_id))
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

fn verify_chain(
    root_public_key: &[u8],
    operational_cert: &Certificate,
    intermediate_ca_cert: Option<&Certificate>,
) -> Result<(), FabricError> {
    match intermediate_ca_cert {
        Some(icac) => {
            icac.verify(root_public_key)?;
            operational_cert.verify(icac.public_key())?;
        }
        None => operational_cert.verify(root_public_key)?,
    }
    if operational_cert.is_ca() {
        return Err(FabricError::NotAnEndEntity);
    }
    Ok(())
}

/// `HKDF(rootPublicKey[1..], salt = fabricId (BE), "CompressedFabric", 8)`
pub fn compressed_fabric_id(
    root_public_key: &[u8],
    fabric_id: u64,
) -> Result<[u8; COMPRESSED_FABRIC_ID_LENGTH], CryptoError> {
    if root_public_key.len() != PUBLIC_KEY_LENGTH {
        return Err(CryptoError::InvalidPublicKey);
    }
    let okm = crypto::hkdf(
        &root_public_key[1..],
        &fabric_id.to_be_bytes(),
        COMPRESSED_FABRIC_INFO,
        COMPRESSED_FABRIC_ID_LENGTH,
    )?;
    let mut id = [0u8; COMPRESSED_FABRIC_ID_LENGTH];
    id.copy_from_slice(&okm);
    Ok(id)
}

/// Assembles a [`Fabric`] step by step while a commissioner provisions it.
pub struct FabricBuilder {
    fabric_index: FabricIndex,
    key_pair: OperationalKeyPair,
    vendor_id: u16,
    label: String,
    root_cert: Option<Certificate>,
    intermediate_ca_cert: Option<Certificate>,
    operational_cert: Option<Certificate>,
    identity_protection_key: Option<Zeroizing<Vec<u8>>>,
}

impl FabricBuilder {
    /// Builder with a freshly generated operational key pair.
    pub fn new(fabric_index: FabricIndex) -> Self {
        Self::with_key_pair(fabric_index, OperationalKeyPair::generate())
    }

    pub fn with_key_pair(fabric_index: FabricIndex, key_pair: OperationalKeyPair) -> Self {
        Self {
            fabric_index,
            key_pair,
            vendor_id: 0,
            label: String::new(),
            root_cert: None,
            intermediate_ca_cert: None,
            operational_cert: None,
            identity_protection_key: None,
        }
    }

    pub fn fabric_index(&self) -> FabricIndex {
        self.fabric_index
    }

    /// Public key the operational certificate must be issued for.
    pub fn public_key(&self) -> Vec<u8> {
        self.key_pair.public_key()
    }

    pub fn set_root_cert(&mut self, cert: Certificate) -> &mut Self {
        self.root_cert = Some(cert);
        self
    }

    pub fn set_intermediate_ca_cert(&mut self, cert: Certificate) -> &mut Self {
        self.intermediate_ca_cert = Some(cert);
        self
    }

    pub fn set_operational_cert(&mut self, cert: Certificate) -> &mut Self {
        self.operational_cert = Some(cert);
        self
    }

    pub fn set_identity_protection_key(&mut self, ipk: &[u8]) -> &mut Self {
        self.identity_protection_key = Some(Zeroizing::new(ipk.to_vec()));
        self
    }

    pub fn set_vendor_id(&mut self, vendor_id: u16) -> &mut Self {
        self.vendor_id = vendor_id;
        self
    }

    pub fn set_label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = label.into();
        self
    }

    pub fn build(&self) -> Result<Fabric, FabricError> {
        let root_cert = self
            .root_cert
            .clone()
            .ok_or(FabricError::Missing("root certificate"))?;
        let operational_cert = self
            .operational_cert
            .clone()
            .ok_or(FabricError::Missing("operational certificate"))?;
        let identity_protection_key = self
            .identity_protection_key
            .clone()
            .ok_or(FabricError::Missing("identity protection key"))?;

        root_cert.verify(root_cert.public_key())?;
        verify_chain(
            root_cert.public_key(),
            &operational_cert,
            self.intermediate_ca_cert.as_ref(),
        )?;
        if operational_cert.public_key() != self.key_pair.public_key().as_slice() {
            return Err(FabricError::KeyMismatch);
        }

        let fabric_id = operational_cert.fabric_id()?;
        let node_id = operational_cert.node_id()?;
        let operational_id = compressed_fabric_id(root_cert.public_key(), fabric_id)?;
        let operational_identity_protection_key = crypto::hkdf(
            &identity_protection_key,
            &operational_id,
            GROUP_KEY_INFO,
            SYMMETRIC_KEY_LENGTH,
        )?;

        Ok(Fabric {
            fabric_index: self.fabric_index,
            fabric_id,
            node_id,
            operational_id,
            key_pair: self.key_pair.clone(),
            vendor_id: self.vendor_id,
            root_cert,
            intermediate_ca_cert: self.intermediate_ca_cert.clone(),
            operational_cert,
            identity_protection_key,
            operational_identity_protection_key,
            label: self.label.clone(),
        })
    }
}
