//! Core Tessel protocol types, framing, and constants.
//!
//! This crate provides:
//! - Packet header and payload header framing ([`codec`])
//! - Per-session message counters ([`MessageCounter`])
//! - Message reliability protocol parameters ([`MrpParameters`])
//! - Secure-channel message types and status reports ([`secure_channel`])
//! - Handshake payload structures exchanged during PASE and CASE ([`messages`])

#![forbid(unsafe_code)]

pub mod codec;
pub mod counter;
pub mod messages;
pub mod mrp;
pub mod secure_channel;

pub use codec::{Message, Packet, PacketHeader, PayloadHeader, SessionType};
pub use counter::MessageCounter;
pub use mrp::MrpParameters;
pub use secure_channel::{MessageType, StatusReport};

/// Operational node identifier.
pub type NodeId = u64;

/// Node id used when a session is not bound to an operational identity.
pub const UNDEFINED_NODE_ID: NodeId = 0;

/// Session id of the single unsecured session used for session establishment.
pub const UNSECURED_SESSION_ID: u16 = 0;

/// Message format version carried in the message flags.
pub const MESSAGE_VERSION: u8 = 0;

pub const SECURE_CHANNEL_PROTOCOL_ID: u16 = 0x0000;
pub const INTERACTION_PROTOCOL_ID: u16 = 0x0001;

/// Passcode id used by PASE when no other passcode is provisioned.
pub const DEFAULT_PASSCODE_ID: u16 = 0;

/// Largest PBKDF2 iteration count a PASE initiator will run.
pub const MAX_PBKDF_ITERATIONS: u32 = 100_000;

/// Upper bound for an encoded handshake payload.
pub const MAX_HANDSHAKE_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("packet too short: need {needed} bytes, have {available}")]
    TooShort { needed: usize, available: usize },
    #[error("unsupported message version: {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported session type: {0}")]
    UnsupportedSessionType(u8),
    #[error("unsupported destination node id size: {0}")]
    UnsupportedDestination(u8),
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("unknown status code {0}")]
    UnknownStatusCode(u16),
    #[error("payload encode error: {0}")]
    PayloadEncode(String),
    #[error("payload decode error: {0}")]
    PayloadDecode(String),
}
