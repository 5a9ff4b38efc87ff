//! Tessel node runtime.
//!
//! This crate wires the protocol core and the crypto layer to an async
//! datagram transport:
//! - [`MessageExchange`]: per-conversation reliability (acks, retransmission,
//!   duplicate suppression)
//! - [`ExchangeManager`]: routes inbound datagrams to sessions and exchanges
//! - [`secure_channel`]: PASE and CASE session establishment, both roles
//! - [`FabricManager`]: known fabrics and the commissioning lifecycle
//! - [`Device`] and [`Controller`] front-ends
//!
//! # Design
//!
//! Every exchange owns its state behind a `std::sync::Mutex` that is never held
//! across an `.await`. Suspension happens only at the documented points: a
//! reliable `send` waiting for its ack, a handler waiting for the next inbound
//! message, and retransmission timers running as their own tasks.

#![forbid(unsafe_code)]

pub mod channel;
pub mod controller;
pub mod device;
pub mod exchange;
pub mod exchange_manager;
pub mod fabric_manager;
pub mod interaction;
pub mod secure_channel;
pub mod session;

pub use channel::{Channel, UdpChannel};
pub use controller::Controller;
pub use device::{Device, DeviceBuilder};
pub use exchange::{ExchangeError, MessageExchange};
pub use exchange_manager::{DispatchError, ExchangeManager, ProtocolHandler};
pub use fabric_manager::{FabricLifecycle, FabricLifecycleError, FabricManager};
pub use interaction::InteractionProtocol;
pub use secure_channel::{HandshakeError, SecureChannelProtocol};
pub use session::{Session, SessionIdsExhausted, SessionManager, UnsecureSession};
pub use tessel_crypto::SessionError;
