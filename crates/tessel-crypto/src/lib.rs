//! Cryptography for Tessel.
//!
//! This crate provides:
//! - The crypto provider: AES-128-CCM, HKDF/PBKDF2, SHA-256, HMAC, randomness
//! - SPAKE2+ over P-256 for passcode-based session establishment (PASE)
//! - P-256 operational key pairs, ECDSA signatures and ECDH
//! - Operational certificates and a minimal certificate authority
//! - Fabrics and their derived identifiers
//! - Encrypted unicast sessions
//!
//! # Design
//!
//! Everything here is synchronous and free of I/O. Handshake state machines
//! live with the transport in `tessel-node`; this crate only supplies the
//! math and the key schedule they drive. Secret material is held in
//! [`zeroize::Zeroizing`] buffers.

#![forbid(unsafe_code)]

pub mod certificate;
pub mod crypto;
pub mod fabric;
pub mod keys;
pub mod session;
pub mod spake2p;

pub use certificate::{Certificate, CertificateAuthority, CertificateError};
pub use crypto::CryptoError;
pub use fabric::{Fabric, FabricBuilder, FabricError, FabricIndex};
pub use keys::{EphemeralKeyPair, OperationalKeyPair};
pub use session::{SecureSession, SecureSessionParams, SessionError, Subscription};
pub use spake2p::{Spake2p, Spake2pSecrets, VerificationValue};
