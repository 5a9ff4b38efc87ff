//! Encrypted unicast sessions.
//!
//! A [`SecureSession`] holds the symmetric keys derived at the end of PASE or
//! CASE and encrypts every message with AES-128-CCM:
//!
//! ```text
//! nonce = securityFlags (1) ‖ messageId (4 LE) ‖ nodeId (8 LE)
//! aad   = encoded packet header
//! keys  = HKDF(sharedSecret, salt, "SessionKeys" | "SessionResumptionKeys", 48)
//!       = I2R key (16) ‖ R2I key (16) ‖ attestation challenge (16)
//! ```
//!
//! The node id in the nonce is the sender's: encoding uses the local node id
//! (the fabric's, or the undefined node id when no fabric is bound) and
//! decoding uses the peer's.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError, AEAD_NONCE_LENGTH, SYMMETRIC_KEY_LENGTH};
use crate::fabric::Fabric;
use tessel_core::codec::{self, Message, Packet};
use tessel_core::{CodecError, MessageCounter, MrpParameters, NodeId, UNDEFINED_NODE_ID};

const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";
const SESSION_RESUMPTION_KEYS_INFO: &[u8] = b"SessionResumptionKeys";
const SESSION_KEYS_LENGTH: usize = SYMMETRIC_KEY_LENGTH * 3;

/// Session encryption errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session key derivation failed: {0}")]
    KeyDerivation(CryptoError),

    #[error("encryption failed for message {message_id}: {source}")]
    Encryption { message_id: u32, source: CryptoError },

    #[error("authentication failed for message {message_id}")]
    AuthenticationFailure { message_id: u32 },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// An active subscription owned by a session; cancelled when the session ends.
pub trait Subscription: Send + Sync {
    fn cancel(&self);
}

#[derive(Default)]
struct Subscriptions {
    next_id: u32,
    active: Vec<(u32, Box<dyn Subscription>)>,
}

/// Inputs to [`SecureSession::create`].
pub struct SecureSessionParams<'a> {
    pub id: u16,
    pub fabric: Option<Arc<Fabric>>,
    pub peer_node_id: NodeId,
    pub peer_session_id: u16,
    pub shared_secret: &'a [u8],
    pub salt: &'a [u8],
    pub is_initiator: bool,
    pub is_resumption: bool,
    pub idle_retransmission_timeout_ms: Option<u32>,
    pub active_retransmission_timeout_ms: Option<u32>,
}

pub struct SecureSession {
    id: u16,
    fabric: Option<Arc<Fabric>>,
    peer_node_id: NodeId,
    peer_session_id: u16,
    encrypt_key: Zeroizing<[u8; SYMMETRIC_KEY_LENGTH]>,
    decrypt_key: Zeroizing<[u8; SYMMETRIC_KEY_LENGTH]>,
    attestation_key: Zeroizing<[u8; SYMMETRIC_KEY_LENGTH]>,
    mrp: MrpParameters,
    message_counter: MessageCounter,
    subscriptions: Mutex<Subscriptions>,
}

impl SecureSession {
    /// Derive the session keys and build the session.
    pub fn create(params: SecureSessionParams<'_>) -> Result<Self, SessionError> {
        let info = if params.is_resumption {
            SESSION_RESUMPTION_KEYS_INFO
        } else {
            SESSION_KEYS_INFO
        };
        let keys = crypto::hkdf(params.shared_secret, params.salt, info, SESSION_KEYS_LENGTH)
            .map_err(SessionError::KeyDerivation)?;

        let (i2r, rest) = keys.split_at(SYMMETRIC_KEY_LENGTH);
        let (r2i, attestation) = rest.split_at(SYMMETRIC_KEY_LENGTH);
        let (encrypt, decrypt) = if params.is_initiator {
            (i2r, r2i)
        } else {
            (r2i, i2r)
        };

        debug!(
            session_id = params.id,
            peer_session_id = params.peer_session_id,
            peer_node_id = params.peer_node_id,
            initiator = params.is_initiator,
            "derived secure session keys"
        );

        Ok(Self {
            id: params.id,
            fabric: params.fabric,
            peer_node_id: params.peer_node_id,
            peer_session_id: params.peer_session_id,
            encrypt_key: key_array(encrypt),
            decrypt_key: key_array(decrypt),
            attestation_key: key_array(attestation),
            mrp: MrpParameters::negotiated(
                params.idle_retransmission_timeout_ms,
                params.active_retransmission_timeout_ms,
            ),
            message_counter: MessageCounter::new(),
            subscriptions: Mutex::new(Subscriptions::default()),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> String {
        format!("secure/{}", self.id)
    }

    pub fn peer_session_id(&self) -> u16 {
        self.peer_session_id
    }

    pub fn peer_node_id(&self) -> NodeId {
        self.peer_node_id
    }

    /// The fabric's node id, or the undefined node id for unbound sessions.
    pub fn node_id(&self) -> NodeId {
        self.fabric
            .as_ref()
            .map_or(UNDEFINED_NODE_ID, |fabric| fabric.node_id())
    }

    pub fn fabric(&self) -> Option<&Arc<Fabric>> {
        self.fabric.as_ref()
    }

    pub fn attestation_challenge_key(&self) -> &[u8] {
        &self.attestation_key[..]
    }

    pub fn mrp_parameters(&self) -> MrpParameters {
        self.mrp
    }

    pub fn message_counter(&self) -> &MessageCounter {
        &self.message_counter
    }

    /// Encrypt the payload header and payload; the packet header stays plaintext.
    pub fn encode(&self, message: Message) -> Result<Packet, SessionError> {
        let message_id = message.packet_header.message_id;
        let plain = codec::encode_payload(&message);
        let aad = plain.header.encode();
        let nonce = nonce(plain.header.security_flags(), message_id, self.node_id());

        let ciphertext = crypto::encrypt(&self.encrypt_key[..], &plain.bytes, &nonce, &aad)
            .map_err(|source| SessionError::Encryption { message_id, source })?;

        Ok(Packet {
            header: plain.header,
            bytes: ciphertext.into(),
        })
    }

    pub fn decode(&self, packet: Packet) -> Result<Message, SessionError> {
        let message_id = packet.header.message_id;
        let aad = packet.header.encode();
        let nonce = nonce(packet.header.security_flags(), message_id, self.peer_node_id);

        let plaintext = crypto::decrypt(&self.decrypt_key[..], &packet.bytes, &nonce, &aad)
            .map_err(|_| SessionError::AuthenticationFailure { message_id })?;

        Ok(codec::decode_payload(Packet {
            header: packet.header,
            bytes: plaintext.into(),
        })?)
    }

    /// Register a subscription built from its freshly assigned id.
    pub fn add_subscription<F>(&self, build: F) -> u32
    where
        F: FnOnce(u32) -> Box<dyn Subscription>,
    {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = subscriptions.next_id;
        subscriptions.next_id = subscriptions.next_id.wrapping_add(1);
        let subscription = build(id);
        subscriptions.active.push((id, subscription));
        id
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .len()
    }

    /// Cancel and drop every subscription.
    pub fn clear_subscriptions(&self) {
        let active = std::mem::take(
            &mut self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .active,
        );
        for (id, subscription) in active {
            debug!(session_id = self.id, subscription_id = id, "cancelling subscription");
            subscription.cancel();
        }
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("id", &self.id)
            .field("peer_session_id", &self.peer_session_id)
            .field("peer_node_id", &self.peer_node_id)
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// `securityFlags (1) ‖ messageId (4 LE) ‖ nodeId (8 LE)`
pub fn nonce(security_flags: u8, message_id: u32, node_id: NodeId) -> [u8; AEAD_NONCE_LENGTH] {
    let mut nonce = [0u8; AEAD_NONCE_LENGTH];
    nonce[0] = security_flags;
    nonce[1..5].copy_from_slice(&message_id.to_le_bytes());
    nonce[5..].copy_from_slice(&node_id.to_le_bytes());
    nonce
}

fn key_array(bytes: &[u8]) -> Zeroizing<[u8; SYMMETRIC_KEY_LENGTH]> {
    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_LENGTH]);
    key.copy_from_slice(bytes);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessel_core::{PacketHeader, PayloadHeader};

    fn params(id: u16, peer_session_id: u16, is_initiator: bool) -> SecureSessionParams<'static> {
        SecureSessionParams {
            id,
            fabric: None,
            peer_node_id: UNDEFINED_NODE_ID,
            peer_session_id,
            shared_secret: b"0123456789abcdef",
            salt: &[],
            is_initiator,
            is_resumption: false,
            idle_retransmission_timeout_ms: None,
            active_retransmission_timeout_ms: Some(100),
        }
    }

    fn pair() -> (SecureSession, SecureSession) {
        (
            SecureSession::create(params(10, 20, true)).unwrap(),
            SecureSession::create(params(20, 10, false)).unwrap(),
        )
    }

    fn message(session_id: u16, message_id: u32) -> Message {
        Message {
            packet_header: PacketHeader::unicast(
                session_id,
                message_id,
                Some(UNDEFINED_NODE_ID),
                Some(UNDEFINED_NODE_ID),
            ),
            payload_header: PayloadHeader {
                exchange_id: 3,
                protocol_id: 1,
                message_type: 2,
                is_initiator_message: true,
                requires_ack: true,
                acked_message_id: None,
            },
            payload: Bytes::from_static(b"read attribute"),
        }
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = nonce(0x01, 0x0403_0201, 0x0c0b_0a09_0807_0605);
        assert_eq!(nonce, [1, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_initiator_to_responder() {
        let (initiator, responder) = pair();
        let original = message(20, 1000);
        let packet = initiator.encode(original.clone()).unwrap();
        assert_ne!(packet.bytes, codec::encode_payload(&original).bytes);

        let wire = codec::encode_packet(&packet);
        let decoded = responder.decode(codec::decode_packet(wire).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_responder_to_initiator() {
        let (initiator, responder) = pair();
        let original = message(10, 7);
        let packet = responder.encode(original.clone()).unwrap();
        assert_eq!(initiator.decode(packet).unwrap(), original);
    }

    #[test]
    fn test_own_packets_do_not_decrypt_locally() {
        let (initiator, _) = pair();
        let packet = initiator.encode(message(20, 5)).unwrap();
        assert_eq!(
            initiator.decode(packet).unwrap_err(),
            SessionError::AuthenticationFailure { message_id: 5 }
        );
    }

    #[test]
    fn test_header_tamper_detected() {
        let (initiator, responder) = pair();
        let mut packet = initiator.encode(message(20, 9)).unwrap();
        packet.header.message_id = 10;
        assert_eq!(
            responder.decode(packet).unwrap_err(),
            SessionError::AuthenticationFailure { message_id: 10 }
        );
    }

    #[test]
    fn test_resumption_keys_differ() {
        let mut resumed = params(10, 20, true);
        resumed.is_resumption = true;
        let resumed = SecureSession::create(resumed).unwrap();
        let (_, responder) = pair();
        let packet = resumed.encode(message(20, 1)).unwrap();
        assert!(responder.decode(packet).is_err());
    }

    #[test]
    fn test_attestation_key_shared() {
        let (initiator, responder) = pair();
        assert_eq!(
            initiator.attestation_challenge_key(),
            responder.attestation_challenge_key()
        );
        assert_eq!(initiator.attestation_challenge_key().len(), 16);
    }

    #[test]
    fn test_session_metadata() {
        let (initiator, _) = pair();
        assert_eq!(initiator.name(), "secure/10");
        assert_eq!(initiator.node_id(), UNDEFINED_NODE_ID);
        assert_eq!(initiator.mrp_parameters().active_retransmission_timeout_ms, 100);
        assert_eq!(initiator.mrp_parameters().idle_retransmission_timeout_ms, 5000);
    }

    struct CountingSubscription(Arc<AtomicUsize>);

    impl Subscription for CountingSubscription {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_clear_subscriptions_cancels_each() {
        let (session, _) = pair();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let first = session.add_subscription(|_| Box::new(CountingSubscription(cancelled.clone())));
        let second =
            session.add_subscription(|_| Box::new(CountingSubscription(cancelled.clone())));
        assert_ne!(first, second);
        assert_eq!(session.subscription_count(), 2);

        session.clear_subscriptions();
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
        assert_eq!(session.subscription_count(), 0);
    }
}
