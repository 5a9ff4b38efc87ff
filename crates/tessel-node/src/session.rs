//! Sessions and the session table.
//!
//! A node has exactly one unsecured session (id 0, used only for the
//! handshakes) and any number of secure sessions keyed by their local id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

use tessel_core::codec::{self, Message, Packet};
use tessel_core::{MessageCounter, MrpParameters, NodeId, UNSECURED_SESSION_ID};
use tessel_crypto::{SecureSession, SecureSessionParams, SessionError};

/// Plain-text session used before any keys exist.
#[derive(Debug, Default)]
pub struct UnsecureSession {
    message_counter: MessageCounter,
    mrp: MrpParameters,
}

impl UnsecureSession {
    pub fn new(mrp: MrpParameters) -> Self {
        Self {
            message_counter: MessageCounter::new(),
            mrp,
        }
    }
}

#[derive(Debug)]
pub enum Session {
    Unsecure(UnsecureSession),
    Secure(SecureSession),
}

impl Session {
    pub fn is_secure(&self) -> bool {
        matches!(self, Session::Secure(_))
    }

    pub fn name(&self) -> String {
        match self {
            Session::Unsecure(_) => "unsecure".to_string(),
            Session::Secure(session) => session.name(),
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            Session::Unsecure(_) => UNSECURED_SESSION_ID,
            Session::Secure(session) => session.id(),
        }
    }

    pub fn peer_session_id(&self) -> u16 {
        match self {
            Session::Unsecure(_) => UNSECURED_SESSION_ID,
            Session::Secure(session) => session.peer_session_id(),
        }
    }

    /// Local node id; `None` until the session is secured.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Session::Unsecure(_) => None,
            Session::Secure(session) => Some(session.node_id()),
        }
    }

    pub fn peer_node_id(&self) -> Option<NodeId> {
        match self {
            Session::Unsecure(_) => None,
            Session::Secure(session) => Some(session.peer_node_id()),
        }
    }

    pub fn mrp_parameters(&self) -> MrpParameters {
        match self {
            Session::Unsecure(session) => session.mrp,
            Session::Secure(session) => session.mrp_parameters(),
        }
    }

    pub fn message_counter(&self) -> &MessageCounter {
        match self {
            Session::Unsecure(session) => &session.message_counter,
            Session::Secure(session) => session.message_counter(),
        }
    }

    pub fn encode(&self, message: Message) -> Result<Packet, SessionError> {
        match self {
            Session::Unsecure(_) => Ok(codec::encode_payload(&message)),
            Session::Secure(session) => session.encode(message),
        }
    }

    pub fn decode(&self, packet: Packet) -> Result<Message, SessionError> {
        match self {
            Session::Unsecure(_) => Ok(codec::decode_payload(packet)?),
            Session::Secure(session) => session.decode(packet),
        }
    }

    pub fn as_secure(&self) -> Option<&SecureSession> {
        match self {
            Session::Unsecure(_) => None,
            Session::Secure(session) => Some(session),
        }
    }
}

struct SessionTable {
    next_session_id: u16,
    sessions: HashMap<u16, Arc<Session>>,
}

/// Every non-zero session id is held by a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no free session id")]
pub struct SessionIdsExhausted;

/// Owns the unsecured session and every secure session of a node.
pub struct SessionManager {
    unsecure: Arc<Session>,
    table: Mutex<SessionTable>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_mrp(MrpParameters::default())
    }

    pub fn with_mrp(mrp: MrpParameters) -> Self {
        Self {
            unsecure: Arc::new(Session::Unsecure(UnsecureSession::new(mrp))),
            table: Mutex::new(SessionTable {
                next_session_id: rand::thread_rng().gen_range(1..=u16::MAX),
                sessions: HashMap::new(),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn unsecure_session(&self) -> Arc<Session> {
        self.unsecure.clone()
    }

    /// Next id that is neither `0` nor held by a live session.
    pub fn next_available_session_id(&self) -> Result<u16, SessionIdsExhausted> {
        let mut table = self.table();
        for _ in 0..u16::MAX {
            let candidate = table.next_session_id;
            table.next_session_id = match candidate.wrapping_add(1) {
                UNSECURED_SESSION_ID => 1,
                next => next,
            };
            if candidate != UNSECURED_SESSION_ID && !table.sessions.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(SessionIdsExhausted)
    }

    pub fn create_secure_session(
        &self,
        params: SecureSessionParams<'_>,
    ) -> Result<Arc<Session>, SessionError> {
        let session = Arc::new(Session::Secure(SecureSession::create(params)?));
        let id = session.id();
        info!(
            session_id = id,
            peer_session_id = session.peer_session_id(),
            "secure session created"
        );
        if let Some(replaced) = self.table().sessions.insert(id, session.clone()) {
            debug!(session_id = id, "replacing existing session");
            if let Some(secure) = replaced.as_secure() {
                secure.clear_subscriptions();
            }
        }
        Ok(session)
    }

    /// Look up a session by the id carried in a packet header.
    pub fn get_session(&self, id: u16) -> Option<Arc<Session>> {
        if id == UNSECURED_SESSION_ID {
            return Some(self.unsecure.clone());
        }
        self.table().sessions.get(&id).cloned()
    }

    pub fn remove_session(&self, id: u16) -> Option<Arc<Session>> {
        let removed = self.table().sessions.remove(&id)?;
        if let Some(secure) = removed.as_secure() {
            secure.clear_subscriptions();
        }
        info!(session_id = id, "secure session removed");
        Some(removed)
    }

    pub fn session_count(&self) -> usize {
        self.table().sessions.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
