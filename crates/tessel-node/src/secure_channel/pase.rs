//! PASE: SPAKE2+ keyed by the setup passcode.
//!
//! ```text
//! initiator                               responder
//!   PbkdfParamRequest  ─────────────────▶
//!                      ◀─────────────────  PbkdfParamResponse
//!   Pake1 (X)          ─────────────────▶
//!                      ◀─────────────────  Pake2 (Y, cB)
//!   Pake3 (cA)         ─────────────────▶
//!                      ◀─────────────────  StatusReport(success)
//! ```
//!
//! The SPAKE2+ context is `SHA256(prefix ‖ request ‖ response)` over the exact
//! encoded payloads. The resulting session carries no fabric.

use std::sync::Arc;

use tracing::{debug, info};

use super::{local_session_parameters, report_failure, HandshakeError, SecureChannelMessenger};
use crate::exchange::MessageExchange;
use crate::session::{Session, SessionManager};
use tessel_common::helpers::constant_time_eq;
use tessel_core::messages::{
    PasePake1, PasePake2, PasePake3, PbkdfParamRequest, PbkdfParamResponse, PbkdfParameters,
};
use tessel_core::secure_channel::MessageType;
use tessel_core::{DEFAULT_PASSCODE_ID, MAX_PBKDF_ITERATIONS, UNDEFINED_NODE_ID};
use tessel_crypto::crypto::{self, random_bytes};
use tessel_crypto::spake2p::SPAKE_CONTEXT_PREFIX;
use tessel_crypto::{SecureSessionParams, Spake2p, VerificationValue};

fn spake_context(request: &[u8], response: &[u8]) -> [u8; crypto::HASH_LENGTH] {
    crypto::hash(&[SPAKE_CONTEXT_PREFIX, request, response])
}

/// Responder side of PASE.
pub struct PaseServer {
    verification: VerificationValue,
    pbkdf: Option<PbkdfParameters>,
    sessions: Arc<SessionManager>,
}

impl PaseServer {
    pub fn from_pin(pin: u32, pbkdf: PbkdfParameters, sessions: Arc<SessionManager>) -> Self {
        Self {
            verification: Spake2p::compute_w0_l(&pbkdf, pin),
            pbkdf: Some(pbkdf),
            sessions,
        }
    }

    /// From a stored `w0 ‖ L` verification value. Without PBKDF parameters
    /// only peers that already know them can pair.
    pub fn from_verification_value(
        verification_value: &[u8],
        pbkdf: Option<PbkdfParameters>,
        sessions: Arc<SessionManager>,
    ) -> Result<Self, HandshakeError> {
        Ok(Self {
            verification: VerificationValue::from_bytes(verification_value)?,
            pbkdf,
            sessions,
        })
    }

    pub(super) async fn handle(
        &self,
        messenger: &SecureChannelMessenger,
    ) -> Result<(), HandshakeError> {
        let (request, request_bytes) = messenger
            .read::<PbkdfParamRequest>(MessageType::PbkdfParamRequest)
            .await?;
        if request.passcode_id != DEFAULT_PASSCODE_ID {
            return Err(HandshakeError::UnsupportedPasscodeId(request.passcode_id));
        }

        let pbkdf_parameters = if request.has_pbkdf_parameters {
            None
        } else {
            Some(
                self.pbkdf
                    .clone()
                    .ok_or(HandshakeError::MissingPbkdfParameters)?,
            )
        };
        let session_id = self.sessions.next_available_session_id()?;
        let response = PbkdfParamResponse {
            peer_random: request.random,
            random: random_bytes(),
            session_id,
            pbkdf_parameters,
            mrp_parameters: Some(local_session_parameters(&self.sessions)),
        };
        let response_bytes = messenger
            .send(MessageType::PbkdfParamResponse, &response)
            .await?;

        let spake = Spake2p::create(
            spake_context(&request_bytes, &response_bytes),
            self.verification.w0,
        );
        let (pake1, _) = messenger.read::<PasePake1>(MessageType::PasePake1).await?;
        let y = spake.compute_y()?;
        let secrets = spake.compute_secret_and_verifiers_from_x(&self.verification.l, &pake1.x, &y)?;
        messenger
            .send(
                MessageType::PasePake2,
                &PasePake2 {
                    y,
                    verifier: secrets.h_bx.to_vec(),
                },
            )
            .await?;

        let (pake3, _) = messenger.read::<PasePake3>(MessageType::PasePake3).await?;
        if !constant_time_eq(&pake3.verifier, &secrets.h_ay) {
            return Err(HandshakeError::KeyConfirmationMismatch);
        }

        let mrp = request.mrp_parameters.unwrap_or_default();
        let session = self.sessions.create_secure_session(SecureSessionParams {
            id: session_id,
            fabric: None,
            peer_node_id: UNDEFINED_NODE_ID,
            peer_session_id: request.session_id,
            shared_secret: &secrets.ke[..],
            salt: &[],
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
            peer_session_id = request.session_id,
            channel = %messenger.channel_name(),
            "PASE session established"
        );
        Ok(())
    }
}

/// Initiator side of PASE.
pub struct PaseClient {
    sessions: Arc<SessionManager>,
}

impl PaseClient {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Run PASE on `exchange` and return the new session. The exchange is
    /// closed either way.
    pub async fn pair(
        &self,
        exchange: MessageExchange,
        passcode: u32,
    ) -> Result<Arc<Session>, HandshakeError> {
        let messenger = SecureChannelMessenger::new(exchange);
        let result = self.run(&messenger, passcode).await;
        if let Err(e) = &result {
            report_failure(&messenger, e).await;
        }
        messenger.close();
        result
    }

    async fn run(
        &self,
        messenger: &SecureChannelMessenger,
        passcode: u32,
    ) -> Result<Arc<Session>, HandshakeError> {
        let session_id = self.sessions.next_available_session_id()?;
        let request = PbkdfParamRequest {
            random: random_bytes(),
            session_id,
            passcode_id: DEFAULT_PASSCODE_ID,
            has_pbkdf_parameters: false,
            mrp_parameters: Some(local_session_parameters(&self.sessions)),
        };
        let request_bytes = messenger
            .send(MessageType::PbkdfParamRequest, &request)
            .await?;
        let (response, response_bytes) = messenger
            .read::<PbkdfParamResponse>(MessageType::PbkdfParamResponse)
            .await?;
        if response.peer_random != request.random {
            return Err(HandshakeError::UnexpectedRandom);
        }
        let pbkdf = response
            .pbkdf_parameters
            .as_ref()
            .ok_or(HandshakeError::MissingPbkdfParameters)?;
        debug!(iterations = pbkdf.iterations, "received PBKDF parameters");
        if !(1..=MAX_PBKDF_ITERATIONS).contains(&pbkdf.iterations) {
            return Err(HandshakeError::PbkdfIterationsOutOfRange(pbkdf.iterations));
        }

        let (w0, w1) = Spake2p::compute_w0_w1(pbkdf, passcode);
        let spake = Spake2p::create(spake_context(&request_bytes, &response_bytes), w0);
        let x = spake.compute_x()?;
        messenger
            .send(MessageType::PasePake1, &PasePake1 { x: x.clone() })
            .await?;

        let (pake2, _) = messenger.read::<PasePake2>(MessageType::PasePake2).await?;
        let secrets = spake.compute_secret_and_verifiers_from_y(&w1, &x, &pake2.y)?;
        if !constant_time_eq(&pake2.verifier, &secrets.h_bx) {
            return Err(HandshakeError::KeyConfirmationMismatch);
        }
        messenger
            .send(
                MessageType::PasePake3,
                &PasePake3 {
                    verifier: secrets.h_ay.to_vec(),
                },
            )
            .await?;
        messenger.wait_for_success().await?;

        let mrp = response.mrp_parameters.unwrap_or_default();
        let session = self.sessions.create_secure_session(SecureSessionParams {
            id: session_id,
            fabric: None,
            peer_node_id: UNDEFINED_NODE_ID,
            peer_session_id: response.session_id,
            shared_secret: &secrets.ke[..],
            salt: &[],
            is_initiator: true,
            is_resumption: false,
            idle_retransmission_timeout_ms: mrp.idle_retransmission_timeout_ms,
            active_retransmission_timeout_ms: mrp.active_retransmission_timeout_ms,
        })?;
        info!(
            session_id,
            peer_session_id = response.session_id,
            channel = %messenger.channel_name(),
            "PASE session established"
        );
        Ok(session)
    }
}
