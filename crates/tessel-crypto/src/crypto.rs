//! Crypto provider: the primitive operations every higher layer builds on.
//!
//! - AEAD: AES-128-CCM, 16-byte tag, 13-byte nonce
//! - KDF: HKDF-SHA256, PBKDF2-HMAC-SHA256
//! - Hash / MAC: SHA-256, HMAC-SHA256
//! - Randomness: operating system RNG

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U16};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

pub const SYMMETRIC_KEY_LENGTH: usize = 16;
pub const AEAD_NONCE_LENGTH: usize = 13;
pub const AEAD_MIC_LENGTH: usize = 16;
pub const HASH_LENGTH: usize = 32;

type Aes128Ccm = ccm::Ccm<Aes128, U16, U13>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),

    #[error("invalid nonce length: {0}")]
    InvalidNonceLength(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("message authentication failed")]
    AuthenticationFailed,

    #[error("key derivation failed: requested {0} bytes")]
    KeyDerivation(usize),

    #[error("invalid curve point")]
    InvalidPoint,

    #[error("invalid scalar")]
    InvalidScalar,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid verification value: expected {expected} bytes, got {actual}")]
    InvalidVerificationValue { expected: usize, actual: usize },
}

/// AES-128-CCM encrypt. Returns ciphertext with the 16-byte tag appended.
pub fn encrypt(
    key: &[u8],
    plaintext: &[u8],
    nonce: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ccm_cipher(key, nonce)?;
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// AES-128-CCM decrypt and verify the tag.
pub fn decrypt(
    key: &[u8],
    ciphertext: &[u8],
    nonce: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ccm_cipher(key, nonce)?;
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

fn ccm_cipher(key: &[u8], nonce: &[u8]) -> Result<Aes128Ccm, CryptoError> {
    if nonce.len() != AEAD_NONCE_LENGTH {
        return Err(CryptoError::InvalidNonceLength(nonce.len()));
    }
    Aes128Ccm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}

pub fn hkdf(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation(length))?;
    Ok(okm)
}

/// SHA-256 over the concatenation of `parts`.
pub fn hash(parts: &[&[u8]]) -> [u8; HASH_LENGTH] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; HASH_LENGTH], CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

pub fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32, length: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; length]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn random_vec(length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
