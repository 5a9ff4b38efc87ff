//! Secure-channel protocol: session establishment over the unsecured session.
//!
//! - PASE: passcode-authenticated, SPAKE2+ ([`PaseServer`], [`PaseClient`])
//! - CASE: certificate-authenticated, ECDH + ECDSA ([`CaseServer`], [`CaseClient`])
//!
//! The responder roles are driven by [`SecureChannelProtocol`], which looks at
//! the message that opened an exchange and runs the matching handshake.
//! Any failure on the responder side is answered with a generic failure
//! status report; no session is created.

mod case;
mod messenger;
mod pase;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{error, warn};

use crate::exchange::{ExchangeError, MessageExchange};
use crate::fabric_manager::{FabricLifecycleError, FabricManager};
use crate::session::{SessionIdsExhausted, SessionManager};
use tessel_core::messages::SessionParameters;
use tessel_core::secure_channel::{MessageType, StatusReport};
use tessel_core::{CodecError, NodeId, MAX_PBKDF_ITERATIONS, SECURE_CHANNEL_PROTOCOL_ID};
use tessel_crypto::{CertificateError, CryptoError, FabricError, SessionError};

pub use case::{CaseClient, CaseServer};
pub use messenger::SecureChannelMessenger;
pub use pase::{PaseClient, PaseServer};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported passcode id {0}")]
    UnsupportedPasscodeId(u16),

    #[error("no PBKDF parameters available")]
    MissingPbkdfParameters,

    #[error("peer asked for {0} PBKDF iterations, limit is {max}", max = MAX_PBKDF_ITERATIONS)]
    PbkdfIterationsOutOfRange(u32),

    #[error("key confirmation mismatch")]
    KeyConfirmationMismatch,

    #[error("peer did not echo our random")]
    UnexpectedRandom,

    #[error("peer node id {actual:#x} does not match expected {expected:#x}")]
    PeerNodeIdMismatch { expected: NodeId, actual: NodeId },

    #[error("unexpected opening message {0:#04x}")]
    UnexpectedOpeningMessage(u8),

    #[error("PASE is not enabled on this node")]
    PaseDisabled,

    #[error(transparent)]
    Fabric(#[from] FabricLifecycleError),

    #[error("certificate rejected: {0}")]
    Certificate(#[from] CertificateError),

    #[error("credentials rejected: {0}")]
    Credentials(#[from] FabricError),

    #[error("peer reported failure: {0}")]
    PeerStatus(StatusReport),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    SessionIds(#[from] SessionIdsExhausted),
}

/// Whether the peer should get a failure status for `err`. It already knows
/// when it sent one itself, and there is nobody to tell once the exchange is
/// gone.
fn peer_needs_report(err: &HandshakeError) -> bool {
    !matches!(
        err,
        HandshakeError::PeerStatus(_)
            | HandshakeError::Exchange(
                ExchangeError::PeerUnreachable { .. }
                    | ExchangeError::Closed
                    | ExchangeError::QueueClosed
                    | ExchangeError::Transport(_)
            )
    )
}

/// Log a failed handshake and tell the peer, unless the peer already knows.
async fn report_failure(messenger: &SecureChannelMessenger, err: &HandshakeError) {
    error!(channel = %messenger.channel_name(), "session establishment failed: {}", err);
    if !peer_needs_report(err) {
        return;
    }
    if let Err(e) = messenger.send_error().await {
        warn!(channel = %messenger.channel_name(), "failed to report error to peer: {}", e);
    }
}

/// MRP timing this node asks its peers to use.
fn local_session_parameters(sessions: &SessionManager) -> SessionParameters {
    let mrp = sessions.unsecure_session().mrp_parameters();
    SessionParameters {
        idle_retransmission_timeout_ms: Some(mrp.idle_retransmission_timeout_ms),
        active_retransmission_timeout_ms: Some(mrp.active_retransmission_timeout_ms),
    }
}

/// Responder for the secure-channel protocol id.
pub struct SecureChannelProtocol {
    pase: Option<PaseServer>,
    case: CaseServer,
}

impl SecureChannelProtocol {
    pub fn new(
        pase: Option<PaseServer>,
        sessions: Arc<SessionManager>,
        fabrics: Arc<Mutex<FabricManager>>,
    ) -> Self {
        Self {
            pase,
            case: CaseServer::new(sessions, fabrics),
        }
    }

    pub fn protocol_id(&self) -> u16 {
        SECURE_CHANNEL_PROTOCOL_ID
    }

    pub async fn on_new_exchange(&self, exchange: MessageExchange) {
        let messenger = SecureChannelMessenger::new(exchange);
        if let Err(e) = self.run(&messenger).await {
            report_failure(&messenger, &e).await;
        }
        messenger.close();
    }

    async fn run(&self, messenger: &SecureChannelMessenger) -> Result<(), HandshakeError> {
        let opening = messenger.peek_opening().await?;
        match MessageType::try_from(opening) {
            Ok(MessageType::PbkdfParamRequest) => match &self.pase {
                Some(pase) => pase.handle(messenger).await,
                None => Err(HandshakeError::PaseDisabled),
            },
            Ok(MessageType::Sigma1) => self.case.handle(messenger).await,
            _ => Err(HandshakeError::UnexpectedOpeningMessage(opening)),
        }
    }
}
