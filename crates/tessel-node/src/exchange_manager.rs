//! Inbound routing and outbound exchange creation.
//!
//! Datagram path: packet header → session lookup → `Session::decode` →
//! existing exchange, or a new exchange handed to the protocol handler
//! registered for the message's protocol id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::exchange::{self, CloseCallback, ExchangeError, MessageExchange};
use crate::interaction::InteractionProtocol;
use crate::secure_channel::SecureChannelProtocol;
use crate::session::{Session, SessionManager};
use tessel_core::codec;
use tessel_core::secure_channel::is_standalone_ack;
use tessel_core::CodecError;
use tessel_crypto::SessionError;

/// Why an inbound datagram was not routed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed packet: {0}")]
    Codec(#[from] CodecError),

    #[error("session {0} not found")]
    SessionNotFound(u16),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("no handler for protocol {0:#06x}")]
    NoHandler(u16),
}

/// The closed set of protocol handlers a node can register.
#[derive(Clone)]
pub enum ProtocolHandler {
    SecureChannel(Arc<SecureChannelProtocol>),
    Interaction(InteractionProtocol),
}

impl ProtocolHandler {
    pub fn protocol_id(&self) -> u16 {
        match self {
            ProtocolHandler::SecureChannel(handler) => handler.protocol_id(),
            ProtocolHandler::Interaction(handler) => handler.protocol_id(),
        }
    }

    pub async fn on_new_exchange(&self, exchange: MessageExchange) {
        match self {
            ProtocolHandler::SecureChannel(handler) => handler.on_new_exchange(exchange).await,
            ProtocolHandler::Interaction(handler) => handler.on_new_exchange(exchange).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExchangeKey {
    channel: String,
    session_id: u16,
    exchange_id: u16,
    initiated_locally: bool,
}

type ExchangeTable = Mutex<HashMap<ExchangeKey, MessageExchange>>;

pub struct ExchangeManager {
    sessions: Arc<SessionManager>,
    handlers: RwLock<HashMap<u16, ProtocolHandler>>,
    exchanges: Arc<ExchangeTable>,
    next_exchange_id: AtomicU16,
}

impl ExchangeManager {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            handlers: RwLock::new(HashMap::new()),
            exchanges: Arc::new(Mutex::new(HashMap::new())),
            next_exchange_id: AtomicU16::new(rand::thread_rng().gen()),
        }
    }

    pub fn with_handler(self, handler: ProtocolHandler) -> Self {
        self.add_protocol_handler(handler);
        self
    }

    /// Register `handler` for its protocol id, replacing any previous one.
    pub fn add_protocol_handler(&self, handler: ProtocolHandler) {
        let protocol_id = handler.protocol_id();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol_id, handler);
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn exchanges(&self) -> MutexGuard<'_, HashMap<ExchangeKey, MessageExchange>> {
        self.exchanges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges().len()
    }

    /// Route one inbound datagram received on `channel`.
    pub async fn on_datagram(
        &self,
        channel: Arc<dyn Channel>,
        data: Bytes,
    ) -> Result<(), DispatchError> {
        let packet = codec::decode_packet(data)?;
        let session_id = packet.header.session_id;
        let session = self
            .sessions
            .get_session(session_id)
            .ok_or(DispatchError::SessionNotFound(session_id))?;
        let message = session.decode(packet)?;

        let header = &message.payload_header;
        let key = ExchangeKey {
            channel: channel.name(),
            session_id,
            exchange_id: header.exchange_id,
            initiated_locally: !header.is_initiator_message,
        };

        let existing = self.exchanges().get(&key).cloned();
        if let Some(exchange) = existing {
            exchange.on_message_received(message).await?;
            return Ok(());
        }

        if !header.is_initiator_message || is_standalone_ack(header.protocol_id, header.message_type) {
            debug!(
                channel = %key.channel,
                session_id,
                exchange_id = key.exchange_id,
                "message for unknown exchange dropped"
            );
            if header.requires_ack {
                exchange::send_standalone_ack(&session, channel.as_ref(), &message).await?;
            }
            return Ok(());
        }

        let protocol_id = header.protocol_id;
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol_id)
            .cloned()
            .ok_or(DispatchError::NoHandler(protocol_id))?;

        let exchange = MessageExchange::from_initial_message(
            session,
            channel,
            message,
            self.close_callback(key.clone()),
        )
        .await?;
        debug!(
            channel = %key.channel,
            session_id,
            exchange_id = key.exchange_id,
            protocol_id,
            "new inbound exchange"
        );
        self.exchanges().insert(key, exchange.clone());
        tokio::spawn(async move { handler.on_new_exchange(exchange).await });
        Ok(())
    }

    /// Open a locally initiated exchange on `session`.
    pub fn initiate_exchange(
        &self,
        session: Arc<Session>,
        channel: Arc<dyn Channel>,
        protocol_id: u16,
    ) -> MessageExchange {
        let exchange_id = self.next_exchange_id.fetch_add(1, Ordering::Relaxed);
        let key = ExchangeKey {
            channel: channel.name(),
            session_id: session.id(),
            exchange_id,
            initiated_locally: true,
        };
        let exchange = MessageExchange::initiate(
            session,
            channel,
            exchange_id,
            protocol_id,
            self.close_callback(key.clone()),
        );
        self.exchanges().insert(key, exchange.clone());
        exchange
    }

    /// Close every open exchange.
    pub fn close(&self) {
        let open: Vec<MessageExchange> = self.exchanges().values().cloned().collect();
        info!(exchanges = open.len(), "closing exchange manager");
        for exchange in open {
            exchange.close();
        }
    }

    fn close_callback(&self, key: ExchangeKey) -> CloseCallback {
        let table: Weak<ExchangeTable> = Arc::downgrade(&self.exchanges);
        Box::new(move || {
            if let Some(table) = table.upgrade() {
                table
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tessel_core::codec::{decode_packet, decode_payload, encode_packet, encode_payload, Message};
    use tessel_core::secure_channel::MessageType;
    use tessel_core::{PacketHeader, PayloadHeader, INTERACTION_PROTOCOL_ID, SECURE_CHANNEL_PROTOCOL_ID};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        async fn send(&self, data: Bytes) -> io::Result<()> {
            let message = decode_payload(decode_packet(data).unwrap()).unwrap();
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn name(&self) -> String {
            "recording".into()
        }
    }

    fn datagram(session_id: u16, exchange_id: u16, is_initiator: bool, message_type: u8) -> Bytes {
        let message = Message {
            packet_header: PacketHeader::unicast(session_id, 77, None, None),
            payload_header: PayloadHeader {
                exchange_id,
                protocol_id: INTERACTION_PROTOCOL_ID,
                message_type,
                is_initiator_message: is_initiator,
                requires_ack: true,
                acked_message_id: None,
            },
            payload: Bytes::from_static(b"request"),
        };
        encode_packet(&encode_payload(&message))
    }

    fn manager() -> (ExchangeManager, mpsc::Receiver<MessageExchange>) {
        let (interaction, rx) = InteractionProtocol::new(4);
        let manager = ExchangeManager::new(Arc::new(SessionManager::new()))
            .with_handler(ProtocolHandler::Interaction(interaction.allow_unsecured()));
        (manager, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_exchange_dispatched_to_handler() {
        let (manager, mut rx) = manager();
        let channel = Arc::new(RecordingChannel::default());

        manager
            .on_datagram(channel.clone(), datagram(0, 5, true, 0x02))
            .await
            .unwrap();
        let exchange = rx.recv().await.unwrap();
        assert_eq!(exchange.exchange_id(), 5);
        assert!(!exchange.is_initiator());
        assert_eq!(manager.exchange_count(), 1);
        assert_eq!(exchange.next_message().await.unwrap().payload.as_ref(), b"request");

        // Same exchange id again is routed to the existing exchange as a duplicate.
        manager
            .on_datagram(channel.clone(), datagram(0, 5, true, 0x02))
            .await
            .unwrap();
        assert_eq!(manager.exchange_count(), 1);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_responder_exchange_is_acked_and_dropped() {
        let (manager, mut rx) = manager();
        let channel = Arc::new(RecordingChannel::default());

        manager
            .on_datagram(channel.clone(), datagram(0, 9, false, 0x05))
            .await
            .unwrap();
        assert_eq!(manager.exchange_count(), 0);
        assert!(rx.try_recv().is_err());

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload_header.message_type, MessageType::StandaloneAck.code());
        assert_eq!(sent[0].payload_header.protocol_id, SECURE_CHANNEL_PROTOCOL_ID);
        assert_eq!(sent[0].payload_header.acked_message_id, Some(77));
    }

    #[tokio::test]
    async fn test_unknown_session_and_protocol() {
        let manager = ExchangeManager::new(Arc::new(SessionManager::new()));
        let channel = Arc::new(RecordingChannel::default());

        let err = manager
            .on_datagram(channel.clone(), datagram(4242, 1, true, 0x02))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SessionNotFound(4242)));

        let err = manager
            .on_datagram(channel.clone(), datagram(0, 1, true, 0x02))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoHandler(INTERACTION_PROTOCOL_ID)));

        let err = manager
            .on_datagram(channel, Bytes::from_static(&[0x00, 0x01]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Codec(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_exchanges_leave_the_table() {
        let manager = ExchangeManager::new(Arc::new(SessionManager::new()));
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel::default());
        let session = manager.sessions().unsecure_session();

        let a = manager.initiate_exchange(session.clone(), channel.clone(), INTERACTION_PROTOCOL_ID);
        let b = manager.initiate_exchange(session, channel, INTERACTION_PROTOCOL_ID);
        assert_eq!(b.exchange_id(), a.exchange_id().wrapping_add(1));
        assert_eq!(manager.exchange_count(), 2);

        manager.close();
        tokio::time::sleep(Duration::from_millis(901)).await;
        tokio::task::yield_now().await;
        assert_eq!(manager.exchange_count(), 0);
        assert!(a.is_closed() && b.is_closed());
    }
}
