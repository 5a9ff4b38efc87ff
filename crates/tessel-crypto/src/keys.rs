//! P-256 key material: long-lived operational key pairs (ECDSA) and
//! per-handshake ephemeral key pairs (ECDH).

use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::crypto::CryptoError;

/// Uncompressed SEC1 public key length.
pub const PUBLIC_KEY_LENGTH: usize = 65;
pub const PRIVATE_KEY_LENGTH: usize = 32;
/// Raw `r || s` signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// ECDSA-P256 key pair used for certificates and CASE signatures.
#[derive(Clone)]
pub struct OperationalKeyPair {
    signing_key: SigningKey,
}

impl OperationalKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_private_key(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    pub fn private_key(&self) -> Zeroizing<[u8; PRIVATE_KEY_LENGTH]> {
        Zeroizing::new(self.signing_key.to_bytes().into())
    }

    /// Uncompressed SEC1 encoding (65 bytes).
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// ECDSA-SHA256 signature as raw `r || s`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for OperationalKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationalKeyPair")
            .field("public_key", &hex::encode(&self.public_key()[..8]))
            .finish_non_exhaustive()
    }
}

/// Verify a raw `r || s` ECDSA-SHA256 signature against a SEC1 public key.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_sec1_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Single-use ECDH key pair for one CASE handshake.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public_key: Vec<u8>,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_key = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        Self { secret, public_key }
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// ECDH with the peer's SEC1 public key; returns the x-coordinate.
    pub fn shared_secret(&self, peer_public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let peer =
            PublicKey::from_sec1_bytes(peer_public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = self.secret.diffie_hellman(&peer);
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = OperationalKeyPair::generate();
        let signature = keypair.sign(b"noc tbs");
        assert_eq!(signature.len(), SIGNATURE_LENGTH);
        assert_eq!(keypair.public_key().len(), PUBLIC_KEY_LENGTH);

        verify_signature(&keypair.public_key(), b"noc tbs", &signature).unwrap();
        assert_eq!(
            verify_signature(&keypair.public_key(), b"other", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = OperationalKeyPair::generate();
        let b = OperationalKeyPair::generate();
        let signature = a.sign(b"payload");
        assert!(verify_signature(&b.public_key(), b"payload", &signature).is_err());
        assert_eq!(
            verify_signature(&[4u8; 10], b"payload", &signature),
            Err(CryptoError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_private_key_roundtrip() {
        let keypair = OperationalKeyPair::generate();
        let restored = OperationalKeyPair::from_private_key(&keypair.private_key()[..]).unwrap();
        assert_eq!(restored.public_key(), keypair.public_key());
        assert!(OperationalKeyPair::from_private_key(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_ecdh_agreement() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let ab = alice.shared_secret(bob.public_key()).unwrap();
        let ba = bob.shared_secret(alice.public_key()).unwrap();
        assert_eq!(ab.as_slice(), ba.as_slice());
        assert_eq!(ab.len(), 32);
        assert!(alice.shared_secret(&[0u8; 65]).is_err());
    }
}
