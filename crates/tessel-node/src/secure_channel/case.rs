//! CASE: certificate-authenticated session establishment within a fabric.
//!
//! ```text
//! initiator                               responder
//!   Sigma1 (random, destination id, eph) ─▶  find fabric, ECDH
//!                      ◀─────────────────  Sigma2 (random, eph, {NOC, sig}S2K)
//!   Sigma3 ({NOC, sig}S3K) ──────────────▶  verify NOC + signature
//!                      ◀─────────────────  StatusReport(success)
//! ```
//!
//! Key schedule, with `IPK` the fabric's operational identity protection key:
//!
//! ```text
//! S2K  = HKDF(shared, IPK ‖ responderRandom ‖ responderEph ‖ H(sigma1), "Sigma2")
//! S3K  = HKDF(shared, IPK ‖ H(sigma1 ‖ sigma2), "Sigma3")
//! salt = IPK ‖ H(sigma1 ‖ sigma2 ‖ sigma3)
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use super::{local_session_parameters, report_failure, HandshakeError, SecureChannelMessenger};
use crate::exchange::MessageExchange;
use crate::fabric_manager::FabricManager;
use crate::session::{Session, SessionManager};
use tessel_core::messages::{
    CaseEncryptedData, CaseSigma1, CaseSigma2, CaseSigma3, CaseSignedData, HandshakePayload,
};
use tessel_core::secure_channel::MessageType;
use tessel_core::NodeId;
use tessel_crypto::crypto::{self, random_bytes, SYMMETRIC_KEY_LENGTH};
use tessel_crypto::keys::verify_signature;
use tessel_crypto::{Certificate, EphemeralKeyPair, Fabric, SecureSessionParams};
use zeroize::Zeroizing;

const SIGMA2_INFO: &[u8] = b"Sigma2";
const SIGMA3_INFO: &[u8] = b"Sigma3";
const SIGMA2_NONCE: &[u8] = b"NCASE_Sigma2N";
const SIGMA3_NONCE: &[u8] = b"NCASE_Sigma3N";

fn sigma2_key(
    fabric: &Fabric,
    shared_secret: &[u8],
    responder_random: &[u8],
    responder_ephemeral_key: &[u8],
    sigma1: &[u8],
) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
    let mut salt = fabric.operational_identity_protection_key().to_vec();
    salt.extend_from_slice(responder_random);
    salt.extend_from_slice(responder_ephemeral_key);
    salt.extend_from_slice(&crypto::hash(&[sigma1]));
    Ok(crypto::hkdf(shared_secret, &salt, SIGMA2_INFO, SYMMETRIC_KEY_LENGTH)?)
}

fn sigma3_key(
    fabric: &Fabric,
    shared_secret: &[u8],
    sigma1: &[u8],
    sigma2: &[u8],
) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
    let mut salt = fabric.operational_identity_protection_key().to_vec();
    salt.extend_from_slice(&crypto::hash(&[sigma1, sigma2]));
    Ok(crypto::hkdf(shared_secret, &salt, SIGMA3_INFO, SYMMETRIC_KEY_LENGTH)?)
}

fn session_salt(fabric: &Fabric, sigma1: &[u8], sigma2: &[u8], sigma3: &[u8]) -> Vec<u8> {
    let mut salt = fabric.operational_identity_protection_key().to_vec();
    salt.extend_from_slice(&crypto::hash(&[sigma1, sigma2, sigma3]));
    salt
}

/// Sign our credentials over both ephemeral keys and encrypt them under `key`.
fn seal_credentials(
    fabric: &Fabric,
    own_ephemeral_key: &[u8],
    peer_ephemeral_key: &[u8],
    key: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, HandshakeError> {
    let operational_cert = fabric.operational_cert().encode()?;
    let intermediate_ca_cert = fabric
        .intermediate_ca_cert()
        .map(Certificate::encode)
        .transpose()?;
    let signed = CaseSignedData {
        operational_cert: operational_cert.clone(),
        intermediate_ca_cert: intermediate_ca_cert.clone(),
        own_ephemeral_public_key: own_ephemeral_key.to_vec(),
        peer_ephemeral_public_key: peer_ephemeral_key.to_vec(),
    }
    .to_bytes()?;
    let plaintext = CaseEncryptedData {
        operational_cert,
        intermediate_ca_cert,
        signature: fabric.sign(&signed),
        resumption_id: None,
    }
    .to_bytes()?;
    Ok(crypto::encrypt(key, &plaintext, nonce, &[])?)
}

/// Decrypt the peer's credentials, check them against `fabric` and the
/// signature over both ephemeral keys. Returns the peer's node id.
fn open_credentials(
    fabric: &Fabric,
    encrypted: &[u8],
    own_ephemeral_key: &[u8],
    peer_ephemeral_key: &[u8],
    key: &[u8],
    nonce: &[u8],
) -> Result<NodeId, HandshakeError> {
    let plaintext = crypto::decrypt(key, encrypted, nonce, &[])?;
    let data = CaseEncryptedData::from_bytes(&plaintext)?;
    let operational_cert = Certificate::decode(&data.operational_cert)?;
    let intermediate_ca_cert = data
        .intermediate_ca_cert
        .as_deref()
        .map(Certificate::decode)
        .transpose()?;
    let node_id = fabric.verify_credentials(&operational_cert, intermediate_ca_cert.as_ref())?;

    let signed = CaseSignedData {
        operational_cert: data.operational_cert,
        intermediate_ca_cert: data.intermediate_ca_cert,
        own_ephemeral_public_key: peer_ephemeral_key.to_vec(),
        peer_ephemeral_public_key: own_ephemeral_key.to_vec(),
    }
    .to_bytes()?;
    verify_signature(operational_cert.public_key(), &signed, &data.signature)?;
    Ok(node_id)
}

/// Responder side of CASE.
pub struct CaseServer {
    sessions: Arc<SessionManager>,
    fabrics: Arc<Mutex<FabricManager>>,
}

impl CaseServer {
    pub fn new(sessions: Arc<SessionManager>, fabrics: Arc<Mutex<FabricManager>>) -> Self {
        Self { sessions, fabrics }
    }

    pub(super) async fn handle(
        &self,
        messenger: &SecureChannelMessenger,
    ) -> Result<(), HandshakeError> {
        let (sigma1, sigma1_bytes) = messenger.read::<CaseSigma1>(MessageType::Sigma1).await?;
        let fabric = self
            .fabrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .find_fabric_from_destination_id(&sigma1.destination_id, &sigma1.random)?;
        debug!(fabric_index = %fabric.fabric_index(), "CASE destination matched");

        let ephemeral = EphemeralKeyPair::generate();
        let shared_secret = ephemeral.shared_secret(&sigma1.ephemeral_public_key)?;
        let random: [u8; 32] = random_bytes();
        let session_id = self.sessions.next_available_session_id()?;

        let s2k = sigma2_key(
            &fabric,
            &shared_secret,
            &random,
            ephemeral.public_key(),
            &sigma1_bytes,
        )?;
        let sigma2 = CaseSigma2 {
            random,
            session_id,
            ephemeral_public_key: ephemeral.public_key().to_vec(),
            encrypted: seal_credentials(
                &fabric,
                ephemeral.public_key(),
                &sigma1.ephemeral_public_key,
                &s2k,
                SIGMA2_NONCE,
            )?,
            mrp_parameters: Some(local_session_parameters(&self.sessions)),
        };
        let sigma2_bytes = messenger.send(MessageType::Sigma2, &sigma2).await?;

        let (sigma3, sigma3_bytes) = messenger.read::<CaseSigma3>(MessageType::Sigma3).await?;
        let s3k = sigma3_key(&fabric, &shared_secret, &sigma1_bytes, &sigma2_bytes)?;
        let peer_node_id = open_credentials(
            &fabric,
            &sigma3.encrypted,
            ephemeral.public_key(),
            &sigma1.ephemeral_public_key,
            &s3k,
            SIGMA3_NONCE,
        )?;

        let salt = session_salt(&fabric, &sigma1_bytes, &sigma2_bytes, &sigma3_bytes);
        let mrp = sigma1.mrp_parameters.unwrap_or_default();
        let session = self.sessions.create_secure_session(SecureSessionParams {
            id: session_id,
            fabric: Some(fabric.clone()),
            peer_node_id,
            peer_session_id: sigma1.session_id,
            shared_secret: &shared_secret[..],
            salt: &salt,
            is_initiator: false,
            is_resumption: false,
            idle_retransmission_timeout_ms: mrp.idle_retransmission_timeout_ms,
            active_retransmission_timeout_ms: mrp.active_retransmission_timeout_ms,
        })?;
        if let Err(e) = messenger.send_success().await {
            self.sessions.remove_session(session.id());
            return Err(e);
        }
        info!(
            session_id,
            peer_session_id = sigma1.session_id,
            peer_node_id,
            fabric_index = %fabric.fabric_index(),
            "CASE session established"
        );
        Ok(())
    }
}

/// Initiator side of CASE.
pub struct CaseClient {
    sessions: Arc<SessionManager>,
}

impl CaseClient {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Run CASE with `peer_node_id` on `fabric`. The exchange is closed either way.
    pub async fn pair(
        &self,
        exchange: MessageExchange,
        fabric: Arc<Fabric>,
        peer_node_id: NodeId,
    ) -> Result<Arc<Session>, HandshakeError> {
        let messenger = SecureChannelMessenger::new(exchange);
        let result = self.run(&messenger, fabric, peer_node_id).await;
        if let Err(e) = &result {
            report_failure(&messenger, e).await;
        }
        messenger.close();
        result
    }

    async fn run(
        &self,
        messenger: &SecureChannelMessenger,
        fabric: Arc<Fabric>,
        peer_node_id: NodeId,
    ) -> Result<Arc<Session>, HandshakeError> {
        let random: [u8; 32] = random_bytes();
        let session_id = self.sessions.next_available_session_id()?;
        let ephemeral = EphemeralKeyPair::generate();
        let sigma1 = CaseSigma1 {
            random,
            session_id,
            destination_id: fabric.destination_id(peer_node_id, &random)?,
            ephemeral_public_key: ephemeral.public_key().to_vec(),
            mrp_parameters: Some(local_session_parameters(&self.sessions)),
        };
        let sigma1_bytes = messenger.send(MessageType::Sigma1, &sigma1).await?;

        let (sigma2, sigma2_bytes) = messenger.read::<CaseSigma2>(MessageType::Sigma2).await?;
        let shared_secret = ephemeral.shared_secret(&sigma2.ephemeral_public_key)?;
        let s2k = sigma2_key(
            &fabric,
            &shared_secret,
            &sigma2.random,
            &sigma2.ephemeral_public_key,
            &sigma1_bytes,
        )?;
        let responder_node_id = open_credentials(
            &fabric,
            &sigma2.encrypted,
            ephemeral.public_key(),
            &sigma2.ephemeral_public_key,
            &s2k,
            SIGMA2_NONCE,
        )?;
        if responder_node_id != peer_node_id {
            return Err(HandshakeError::PeerNodeIdMismatch {
                expected: peer_node_id,
                actual: responder_node_id,
            });
        }

        let s3k = sigma3_key(&fabric, &shared_secret, &sigma1_bytes, &sigma2_bytes)?;
        let sigma3 = CaseSigma3 {
            encrypted: seal_credentials(
                &fabric,
                ephemeral.public_key(),
                &sigma2.ephemeral_public_key,
                &s3k,
                SIGMA3_NONCE,
            )?,
        };
        let sigma3_bytes = messenger.send(MessageType::Sigma3, &sigma3).await?;
        messenger.wait_for_success().await?;

        let salt = session_salt(&fabric, &sigma1_bytes, &sigma2_bytes, &sigma3_bytes);
        let mrp = sigma2.mrp_parameters.unwrap_or_default();
        let session = self.sessions.create_secure_session(SecureSessionParams {
            id: session_id,
            fabric: Some(fabric.clone()),
            peer_node_id,
            peer_session_id: sigma2.session_id,
            shared_secret: &shared_secret[..],
            salt: &salt,
            is_initiator: true,
            is_resumption: false,
            idle_retransmission_timeout_ms: mrp.idle_retransmission_timeout_ms,
            active_retransmission_timeout_ms: mrp.active_retransmission_timeout_ms,
        })?;
        info!(
            session_id,
            peer_session_id = sigma2.session_id,
            peer_node_id,
            fabric_index = %fabric.fabric_index(),
            "CASE session established"
        );
        Ok(session)
    }
}
