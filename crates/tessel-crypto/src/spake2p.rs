//! SPAKE2+ over P-256 for passcode-authenticated session establishment (PASE).
//!
//! # Design
//!
//! The passcode is stretched with PBKDF2 into two 40-byte strings, each reduced
//! modulo the group order into `w0` and `w1`. The commissioner (prover) keeps
//! `w0, w1`; the device (verifier) only needs `w0` and `L = w1·G`, which is
//! what a stored verification value contains.
//!
//! ```text
//! prover:   X = x·G + w0·M         Z = x·(Y − w0·N)   V = w1·(Y − w0·N)
//! verifier: Y = y·G + w0·N         Z = y·(X − w0·M)   V = y·L
//! TT = len‖context ‖ len‖"" ‖ len‖"" ‖ len‖M ‖ len‖N ‖ len‖X ‖ len‖Y ‖ len‖Z ‖ len‖V ‖ len‖w0
//! Ka‖Ke = SHA256(TT)    KcA‖KcB = HKDF(Ka, [], "ConfirmationKeys")
//! cA = HMAC(KcA, Y)     cB = HMAC(KcB, X)
//! ```

use p256::elliptic_curve::ff::PrimeField;
use p256::elliptic_curve::group::Group;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::Field;
use p256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use tessel_core::messages::PbkdfParameters;
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError, HASH_LENGTH, SYMMETRIC_KEY_LENGTH};
use crate::keys::PUBLIC_KEY_LENGTH;

/// Prefix hashed in front of the PBKDF exchange to form the SPAKE2+ context.
pub const SPAKE_CONTEXT_PREFIX: &[u8] = b"CHIP PAKE V1 Commissioning";

const CONFIRMATION_KEYS_INFO: &[u8] = b"ConfirmationKeys";
const W_SEED_LENGTH: usize = 40;
const SCALAR_LENGTH: usize = 32;

/// `w0 (32) ‖ L (65)`
pub const VERIFICATION_VALUE_LENGTH: usize = SCALAR_LENGTH + PUBLIC_KEY_LENGTH;

const M_POINT: [u8; 33] = [
    0x02, 0x88, 0x6e, 0x2f, 0x97, 0xac, 0xe4, 0x6e, 0x55, 0xba, 0x9d, 0xd7, 0x24, 0x25, 0x79,
    0xf2, 0x99, 0x3b, 0x64, 0xe1, 0x6e, 0xf3, 0xdc, 0xab, 0x95, 0xaf, 0xd4, 0x97, 0x33, 0x3d,
    0x8f, 0xa1, 0x2f,
];
const N_POINT: [u8; 33] = [
    0x03, 0xd8, 0xbb, 0xd6, 0xc6, 0x39, 0xc6, 0x29, 0x37, 0xb0, 0x4d, 0x99, 0x7f, 0x38, 0xc3,
    0x77, 0x07, 0x19, 0xc6, 0x29, 0xd7, 0x01, 0x4d, 0x49, 0xa2, 0x4b, 0x4f, 0x98, 0xba, 0xa1,
    0x29, 0x2b, 0x49,
];

/// Keys produced by one SPAKE2+ run.
pub struct Spake2pSecrets {
    /// Shared session secret.
    pub ke: Zeroizing<[u8; SYMMETRIC_KEY_LENGTH]>,
    /// Prover confirmation `cA`.
    pub h_ay: [u8; HASH_LENGTH],
    /// Verifier confirmation `cB`.
    pub h_bx: [u8; HASH_LENGTH],
}

/// What a device stores instead of the passcode.
#[derive(Clone)]
pub struct VerificationValue {
    pub w0: Scalar,
    pub l: Vec<u8>,
}

impl VerificationValue {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(VERIFICATION_VALUE_LENGTH);
        bytes.extend_from_slice(&self.w0.to_repr());
        bytes.extend_from_slice(&self.l);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != VERIFICATION_VALUE_LENGTH {
            return Err(CryptoError::InvalidVerificationValue {
                expected: VERIFICATION_VALUE_LENGTH,
                actual: bytes.len(),
            });
        }
        let (w0, l) = bytes.split_at(SCALAR_LENGTH);
        let w0: Option<Scalar> = Scalar::from_repr(FieldBytes::clone_from_slice(w0)).into();
        let w0 = w0.ok_or(CryptoError::InvalidScalar)?;
        decode_point(l)?;
        Ok(Self { w0, l: l.to_vec() })
    }
}

pub struct Spake2p {
    context: [u8; HASH_LENGTH],
    random: Scalar,
    w0: Scalar,
}

impl Spake2p {
    /// Prover secrets `(w0, w1)` from a passcode.
    pub fn compute_w0_w1(pbkdf: &PbkdfParameters, pin: u32) -> (Scalar, Scalar) {
        let ws = crypto::pbkdf2(
            &pin.to_le_bytes(),
            &pbkdf.salt,
            pbkdf.iterations,
            W_SEED_LENGTH * 2,
        );
        let w0 = reduce_be_bytes(&ws[..W_SEED_LENGTH]);
        let w1 = reduce_be_bytes(&ws[W_SEED_LENGTH..]);
        (w0, w1)
    }

    /// Verifier secrets `(w0, L)` from a passcode.
    pub fn compute_w0_l(pbkdf: &PbkdfParameters, pin: u32) -> VerificationValue {
        let (w0, w1) = Self::compute_w0_w1(pbkdf, pin);
        let l = encode_point(&(ProjectivePoint::GENERATOR * w1));
        VerificationValue { w0, l }
    }

    pub fn create(context: [u8; HASH_LENGTH], w0: Scalar) -> Self {
        Self {
            context,
            random: Scalar::random(&mut OsRng),
            w0,
        }
    }

    /// Prover share `X = x·G + w0·M`.
    pub fn compute_x(&self) -> Result<Vec<u8>, CryptoError> {
        let m = decode_point(&M_POINT)?;
        Ok(encode_point(
            &(ProjectivePoint::GENERATOR * self.random + m * self.w0),
        ))
    }

    /// Verifier share `Y = y·G + w0·N`.
    pub fn compute_y(&self) -> Result<Vec<u8>, CryptoError> {
        let n = decode_point(&N_POINT)?;
        Ok(encode_point(
            &(ProjectivePoint::GENERATOR * self.random + n * self.w0),
        ))
    }

    /// Prover side: derive the secrets once the verifier's `Y` is known.
    pub fn compute_secret_and_verifiers_from_y(
        &self,
        w1: &Scalar,
        x: &[u8],
        y: &[u8],
    ) -> Result<Spake2pSecrets, CryptoError> {
        let y_point = decode_share(y)?;
        let n = decode_point(&N_POINT)?;
        let base = y_point - n * self.w0;
        let z = base * self.random;
        let v = base * *w1;
        self.compute_secrets(x, y, &z, &v)
    }

    /// Verifier side: derive the secrets once the prover's `X` is known.
    pub fn compute_secret_and_verifiers_from_x(
        &self,
        l: &[u8],
        x: &[u8],
        y: &[u8],
    ) -> Result<Spake2pSecrets, CryptoError> {
        let x_point = decode_share(x)?;
        let l_point = decode_point(l)?;
        let m = decode_point(&M_POINT)?;
        let z = (x_point - m * self.w0) * self.random;
        let v = l_point * self.random;
        self.compute_secrets(x, y, &z, &v)
    }

    fn compute_secrets(
        &self,
        x: &[u8],
        y: &[u8],
        z: &ProjectivePoint,
        v: &ProjectivePoint,
    ) -> Result<Spake2pSecrets, CryptoError> {
        let m = encode_point(&decode_point(&M_POINT)?);
        let n = encode_point(&decode_point(&N_POINT)?);
        let z = encode_point(z);
        let v = encode_point(v);
        let w0 = self.w0.to_repr();

        let parts: [&[u8]; 10] = [&self.context, &[], &[], &m, &n, x, y, &z, &v, &w0];
        let mut tt = Zeroizing::new(Vec::with_capacity(512));
        for part in parts {
            tt.extend_from_slice(&(part.len() as u64).to_le_bytes());
            tt.extend_from_slice(part);
        }

        let digest = Zeroizing::new(crypto::hash(&[tt.as_slice()]));
        let (ka, ke) = digest.split_at(HASH_LENGTH / 2);
        let kc = crypto::hkdf(ka, &[], CONFIRMATION_KEYS_INFO, HASH_LENGTH)?;
        let (kca, kcb) = kc.split_at(HASH_LENGTH / 2);

        let mut ke_bytes = Zeroizing::new([0u8; SYMMETRIC_KEY_LENGTH]);
        ke_bytes.copy_from_slice(ke);

        Ok(Spake2pSecrets {
            ke: ke_bytes,
            h_ay: crypto::hmac(kca, y)?,
            h_bx: crypto::hmac(kcb, x)?,
        })
    }
}

/// Interpret big-endian bytes as an integer and reduce it modulo the group order.
fn reduce_be_bytes(bytes: &[u8]) -> Scalar {
    let radix = Scalar::from(256u64);
    bytes
        .iter()
        .fold(Scalar::ZERO, |acc, byte| acc * radix + Scalar::from(u64::from(*byte)))
}

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(false).as_bytes().to_vec()
}

fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| CryptoError::InvalidPoint)?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    affine.map(ProjectivePoint::from).ok_or(CryptoError::InvalidPoint)
}

/// A peer share must be a valid point other than the identity.
fn decode_share(bytes: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    let point = decode_point(bytes)?;
    if bool::from(point.is_identity()) {
        return Err(CryptoError::InvalidPoint);
    }
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PbkdfParameters {
        PbkdfParameters {
            iterations: 1000,
            salt: b"SPAKE2P Key Salt SPAKE2P Key Salt".to_vec(),
        }
    }

    fn run(prover_pin: u32, verifier_pin: u32) -> (Spake2pSecrets, Spake2pSecrets) {
        let context = crypto::hash(&[SPAKE_CONTEXT_PREFIX, &b"request"[..], &b"response"[..]]);
        let (w0, w1) = Spake2p::compute_w0_w1(&params(), prover_pin);
        let verification = Spake2p::compute_w0_l(&params(), verifier_pin);

        let prover = Spake2p::create(context, w0);
        let verifier = Spake2p::create(context, verification.w0);
        let x = prover.compute_x().unwrap();
        let y = verifier.compute_y().unwrap();

        let prover_secrets = prover.compute_secret_and_verifiers_from_y(&w1, &x, &y).unwrap();
        let verifier_secrets = verifier
            .compute_secret_and_verifiers_from_x(&verification.l, &x, &y)
            .unwrap();
        (prover_secrets, verifier_secrets)
    }

    #[test]
    fn test_matching_passcodes_agree() {
        let (prover, verifier) = run(20202021, 20202021);
        assert_eq!(*prover.ke, *verifier.ke);
        assert_eq!(prover.h_ay, verifier.h_ay);
        assert_eq!(prover.h_bx, verifier.h_bx);
    }

    #[test]
    fn test_wrong_passcode_disagrees() {
        let (prover, verifier) = run(20202021, 20202022);
        assert_ne!(*prover.ke, *verifier.ke);
        assert_ne!(prover.h_ay, verifier.h_ay);
        assert_ne!(prover.h_bx, verifier.h_bx);
    }

    #[test]
    fn test_w0_w1_deterministic() {
        let (a0, a1) = Spake2p::compute_w0_w1(&params(), 1234);
        let (b0, b1) = Spake2p::compute_w0_w1(&params(), 1234);
        assert_eq!(a0, b0);
        assert_eq!(a1, b1);
        assert_ne!(a0, a1);
    }

    #[test]
    fn test_reduce_wraps_group_order() {
        // n + 5, left-padded to 40 bytes
        let mut bytes = [0u8; W_SEED_LENGTH];
        let n_plus_5 =
            hex::decode("ffffffff00000000ffffffffffffffffbce6faada7179e84f3b9cac2fc632556")
                .unwrap();
        bytes[8..].copy_from_slice(&n_plus_5);
        assert_eq!(reduce_be_bytes(&bytes), Scalar::from(5u64));
        assert_eq!(reduce_be_bytes(&[0x01, 0x00]), Scalar::from(256u64));
    }

    #[test]
    fn test_verification_value_roundtrip() {
        let value = Spake2p::compute_w0_l(&params(), 20202021);
        let bytes = value.to_bytes();
        assert_eq!(bytes.len(), VERIFICATION_VALUE_LENGTH);
        let restored = VerificationValue::from_bytes(&bytes).unwrap();
        assert_eq!(restored.w0, value.w0);
        assert_eq!(restored.l, value.l);

        assert!(VerificationValue::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn test_rejects_identity_and_garbage_shares() {
        let (w0, w1) = Spake2p::compute_w0_w1(&params(), 1);
        let prover = Spake2p::create([0; HASH_LENGTH], w0);
        let x = prover.compute_x().unwrap();
        assert_eq!(
            prover
                .compute_secret_and_verifiers_from_y(&w1, &x, &[0u8; 65])
                .err(),
            Some(CryptoError::InvalidPoint)
        );
        assert_eq!(
            prover.compute_secret_and_verifiers_from_y(&w1, &x, &[0x00]).err(),
            Some(CryptoError::InvalidPoint)
        );
    }

    #[test]
    fn test_fixed_points_decode() {
        assert!(decode_point(&M_POINT).is_ok());
        assert!(decode_point(&N_POINT).is_ok());
    }
}
