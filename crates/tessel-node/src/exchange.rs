//! Message exchanges and the message reliability protocol (MRP).
//!
//! A [`MessageExchange`] is one request/response conversation on a session.
//! It provides:
//! - At most one unacknowledged reliable message in flight
//! - Piggy-backed acks: the next outbound message acks the last inbound one
//! - Retransmission of the in-flight message every active interval, up to the
//!   session's retry limit, after which the peer is reported unreachable
//! - Duplicate suppression for retransmitted inbound messages
//! - A close grace period that absorbs late retransmissions before teardown
//!
//! # Design
//!
//! State lives behind a `std::sync::Mutex` and is only touched between
//! suspension points. The caller of a reliable [`MessageExchange::send`] waits
//! on a oneshot that is resolved by the inbound path (ack), by the
//! retransmission task (retries exhausted) or by teardown (closed). Inbound
//! application messages flow through an unbounded queue so the receive loop
//! never blocks on a slow handler.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::channel::Channel;
use crate::session::Session;
use tessel_core::codec::{self, Message};
use tessel_core::secure_channel::{is_standalone_ack, MessageType};
use tessel_core::{MrpParameters, NodeId, PacketHeader, PayloadHeader, SECURE_CHANNEL_PROTOCOL_ID};
use tessel_crypto::SessionError;

/// Exchange-level failures. `Clone` so one error can reach both the inbound
/// queue and a waiting sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("the previous message has not been acked yet")]
    PreviousMessageNotAcked,

    #[error("message {message_id} does not ack outstanding message {expected}")]
    MissingAck { expected: u32, message_id: u32 },

    #[error("incorrect ack: expected {expected}, received {received}")]
    IncorrectAck { expected: u32, received: u32 },

    #[error("unexpected protocol: expected {expected:#06x}, received {received:#06x}")]
    UnexpectedProtocol { expected: u16, received: u16 },

    #[error("unexpected message type: expected {expected:#04x}, received {received:#04x}")]
    UnexpectedMessageType { expected: u8, received: u8 },

    #[error("exchange queue closed")]
    QueueClosed,

    #[error("peer unreachable: message {message_id} unacked after {retransmissions} retransmissions")]
    PeerUnreachable {
        message_id: u32,
        retransmissions: u32,
    },

    #[error("exchange closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Invoked once when the exchange is torn down.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

type Inbound = Result<Message, ExchangeError>;
type AckWaiter = oneshot::Sender<Result<(), ExchangeError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Lifecycle {
    #[default]
    Open,
    Closing,
    Closed,
}

struct PendingSend {
    message_id: u32,
    /// The inbound message this one acked, used to spot the peer retransmitting it.
    acked_message_id: Option<u32>,
    encoded: Bytes,
    waiter: Option<AckWaiter>,
}

#[derive(Default)]
struct ExchangeState {
    received_message_to_ack: Option<u32>,
    last_received_message_id: Option<u32>,
    pending_send: Option<PendingSend>,
    retransmission: Option<JoinHandle<()>>,
    lifecycle: Lifecycle,
}

impl ExchangeState {
    /// Drop the in-flight message and stop retransmitting it.
    fn clear_pending_send(&mut self) -> Option<AckWaiter> {
        if let Some(task) = self.retransmission.take() {
            task.abort();
        }
        self.pending_send.take().and_then(|pending| pending.waiter)
    }
}

/// What the inbound path decided while holding the state lock.
enum Disposition {
    Ignore,
    AckDuplicate(u32),
    Resend(Bytes),
    Deliver(Message),
    Reject(ExchangeError),
}

struct ExchangeInner {
    session: Arc<Session>,
    channel: Arc<dyn Channel>,
    is_initiator: bool,
    exchange_id: u16,
    protocol_id: u16,
    peer_session_id: u16,
    node_id: Option<NodeId>,
    peer_node_id: Option<NodeId>,
    mrp: MrpParameters,
    state: Mutex<ExchangeState>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl ExchangeInner {
    fn state(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_inbound(&self, item: Inbound) {
        let tx = self
            .inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = tx {
            // A dropped receiver only means nobody reads this exchange anymore.
            let _ = tx.send(item);
        }
    }

    fn teardown(&self) {
        let waiter = {
            let mut state = self.state();
            state.lifecycle = Lifecycle::Closed;
            state.clear_pending_send()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(ExchangeError::Closed));
        }

        self.inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let callback = self
            .close_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
        debug!(exchange_id = self.exchange_id, session = %self.session.name(), "exchange closed");
    }
}

/// One conversation on a session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageExchange {
    inner: Arc<ExchangeInner>,
}

impl MessageExchange {
    /// Responder side: bind a new exchange to the message that opened it and
    /// process that message.
    pub async fn from_initial_message(
        session: Arc<Session>,
        channel: Arc<dyn Channel>,
        message: Message,
        close_callback: CloseCallback,
    ) -> Result<Self, ExchangeError> {
        let exchange = Self::new(
            session,
            channel,
            false,
            message.payload_header.exchange_id,
            message.payload_header.protocol_id,
            message.packet_header.dest_node_id,
            message.packet_header.source_node_id,
            close_callback,
        );
        exchange.on_message_received(message).await?;
        Ok(exchange)
    }

    /// Requester side.
    pub fn initiate(
        session: Arc<Session>,
        channel: Arc<dyn Channel>,
        exchange_id: u16,
        protocol_id: u16,
        close_callback: CloseCallback,
    ) -> Self {
        let node_id = session.node_id();
        let peer_node_id = session.peer_node_id();
        Self::new(
            session,
            channel,
            true,
            exchange_id,
            protocol_id,
            node_id,
            peer_node_id,
            close_callback,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        session: Arc<Session>,
        channel: Arc<dyn Channel>,
        is_initiator: bool,
        exchange_id: u16,
        protocol_id: u16,
        node_id: Option<NodeId>,
        peer_node_id: Option<NodeId>,
        close_callback: CloseCallback,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mrp = session.mrp_parameters();
        debug!(
            exchange_id,
            protocol_id,
            initiator = is_initiator,
            session = %session.name(),
            active_ms = mrp.active_retransmission_timeout_ms,
            retries = mrp.retransmission_retries,
            "new exchange"
        );
        Self {
            inner: Arc::new(ExchangeInner {
                peer_session_id: session.peer_session_id(),
                session,
                channel,
                is_initiator,
                exchange_id,
                protocol_id,
                node_id,
                peer_node_id,
                mrp,
                state: Mutex::new(ExchangeState::default()),
                inbound_tx: Mutex::new(Some(tx)),
                inbound_rx: tokio::sync::Mutex::new(rx),
                close_callback: Mutex::new(Some(close_callback)),
            }),
        }
    }

    pub fn exchange_id(&self) -> u16 {
        self.inner.exchange_id
    }

    pub fn protocol_id(&self) -> u16 {
        self.inner.protocol_id
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.is_initiator
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn channel_name(&self) -> String {
        self.inner.channel.name()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().lifecycle == Lifecycle::Closed
    }

    /// Run one inbound message through ack bookkeeping and duplicate
    /// filtering, queueing it for the handler when it is new.
    ///
    /// Protocol violations are returned and also pushed onto the inbound queue
    /// and to any waiting sender, so whoever is suspended on this exchange sees
    /// them.
    pub async fn on_message_received(&self, message: Message) -> Result<(), ExchangeError> {
        let message_id = message.packet_header.message_id;
        trace!(
            exchange_id = self.inner.exchange_id,
            message_id,
            message_type = message.payload_header.message_type,
            acked = ?message.payload_header.acked_message_id,
            "message received"
        );

        match self.classify(message) {
            Disposition::Ignore => Ok(()),
            Disposition::AckDuplicate(duplicate_id) => {
                debug!(
                    exchange_id = self.inner.exchange_id,
                    message_id = duplicate_id,
                    "duplicate message, sending standalone ack"
                );
                self.send_ack_for(duplicate_id).await
            }
            Disposition::Resend(encoded) => {
                debug!(
                    exchange_id = self.inner.exchange_id,
                    message_id, "peer missed our ack, resending reply"
                );
                self.transmit(encoded).await
            }
            Disposition::Deliver(message) => {
                self.inner.push_inbound(Ok(message));
                Ok(())
            }
            Disposition::Reject(err) => {
                warn!(exchange_id = self.inner.exchange_id, message_id, "{}", err);
                let waiter = self.inner.state().clear_pending_send();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(err.clone()));
                }
                self.inner.push_inbound(Err(err.clone()));
                Err(err)
            }
        }
    }

    fn classify(&self, message: Message) -> Disposition {
        let message_id = message.packet_header.message_id;
        let header = &message.payload_header;
        let standalone_ack = is_standalone_ack(header.protocol_id, header.message_type);

        let duplicate = if header.requires_ack {
            Disposition::AckDuplicate(message_id)
        } else {
            Disposition::Ignore
        };

        let mut state = self.inner.state();

        // Retransmitted while our reply is still being prepared.
        if state.received_message_to_ack == Some(message_id) {
            return duplicate;
        }

        // Retransmitted because our reply, which carries the ack, was lost.
        let pending = state
            .pending_send
            .as_ref()
            .map(|pending| (pending.message_id, pending.acked_message_id, pending.encoded.clone()));
        if let Some((_, Some(acked), encoded)) = &pending {
            if *acked == message_id {
                return Disposition::Resend(encoded.clone());
            }
        }

        if state.last_received_message_id == Some(message_id) {
            return duplicate;
        }

        if let Some((expected, _, _)) = pending {
            match header.acked_message_id {
                None if standalone_ack => {}
                None => {
                    return Disposition::Reject(ExchangeError::MissingAck {
                        expected,
                        message_id,
                    })
                }
                Some(acked) if acked != expected => {
                    if !standalone_ack {
                        return Disposition::Reject(ExchangeError::IncorrectAck {
                            expected,
                            received: acked,
                        });
                    }
                    trace!(exchange_id = self.inner.exchange_id, acked, "stray standalone ack");
                }
                Some(_) => {
                    debug!(exchange_id = self.inner.exchange_id, message_id = expected, "message acked");
                    if let Some(waiter) = state.clear_pending_send() {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
        }

        if standalone_ack {
            return Disposition::Ignore;
        }

        if header.protocol_id != self.inner.protocol_id {
            return Disposition::Reject(ExchangeError::UnexpectedProtocol {
                expected: self.inner.protocol_id,
                received: header.protocol_id,
            });
        }

        if header.requires_ack {
            state.received_message_to_ack = Some(message_id);
        }
        state.last_received_message_id = Some(message_id);
        Disposition::Deliver(message)
    }

    /// Send a message on this exchange.
    ///
    /// Reliable messages (everything but a standalone ack) suspend the caller
    /// until the peer acks them, the retries run out, or the exchange closes.
    pub async fn send(&self, message_type: u8, payload: Bytes) -> Result<(), ExchangeError> {
        let standalone_ack = message_type == MessageType::StandaloneAck.code();
        let requires_ack = !standalone_ack;

        let (encoded, ack) = {
            let mut state = self.inner.state();
            if state.lifecycle == Lifecycle::Closed {
                return Err(ExchangeError::Closed);
            }
            if requires_ack && state.pending_send.is_some() {
                return Err(ExchangeError::PreviousMessageNotAcked);
            }

            let acked_message_id = state.received_message_to_ack.take();
            let message_id = self.inner.session.message_counter().next_id();
            let message = Message {
                packet_header: PacketHeader::unicast(
                    self.inner.peer_session_id,
                    message_id,
                    self.inner.node_id,
                    self.inner.peer_node_id,
                ),
                payload_header: PayloadHeader {
                    exchange_id: self.inner.exchange_id,
                    protocol_id: if standalone_ack {
                        SECURE_CHANNEL_PROTOCOL_ID
                    } else {
                        self.inner.protocol_id
                    },
                    message_type,
                    is_initiator_message: self.inner.is_initiator,
                    requires_ack,
                    acked_message_id,
                },
                payload,
            };

            let packet = match self.inner.session.encode(message) {
                Ok(packet) => packet,
                Err(e) => {
                    state.received_message_to_ack = acked_message_id;
                    return Err(e.into());
                }
            };
            let encoded = codec::encode_packet(&packet);
            trace!(
                exchange_id = self.inner.exchange_id,
                message_id,
                message_type,
                acked = ?acked_message_id,
                "sending message"
            );

            let ack = if requires_ack {
                let (tx, rx) = oneshot::channel();
                state.pending_send = Some(PendingSend {
                    message_id,
                    acked_message_id,
                    encoded: encoded.clone(),
                    waiter: Some(tx),
                });
                state.retransmission = Some(self.spawn_retransmission(message_id, encoded.clone()));
                Some((message_id, rx))
            } else {
                None
            };
            (encoded, ack)
        };

        if let Err(e) = self.transmit(encoded).await {
            if let Some((message_id, _)) = &ack {
                let mut state = self.inner.state();
                if state.pending_send.as_ref().map(|p| p.message_id) == Some(*message_id) {
                    state.clear_pending_send();
                }
            }
            return Err(e);
        }

        match ack {
            Some((_, rx)) => rx.await.unwrap_or(Err(ExchangeError::Closed)),
            None => Ok(()),
        }
    }

    /// Next inbound application message, in arrival order.
    pub async fn next_message(&self) -> Result<Message, ExchangeError> {
        let mut rx = self.inner.inbound_rx.lock().await;
        rx.recv().await.unwrap_or(Err(ExchangeError::QueueClosed))
    }

    /// Next inbound message, which must be of `message_type`.
    pub async fn wait_for(&self, message_type: u8) -> Result<Message, ExchangeError> {
        let message = self.next_message().await?;
        let received = message.payload_header.message_type;
        if received != message_type {
            return Err(ExchangeError::UnexpectedMessageType {
                expected: message_type,
                received,
            });
        }
        Ok(message)
    }

    /// Begin closing: flush an owed ack, then tear down after the grace period.
    ///
    /// Idempotent. Sends are still accepted until teardown.
    pub fn close(&self) {
        let owes_ack = {
            let mut state = self.inner.state();
            if state.lifecycle != Lifecycle::Open {
                return;
            }
            state.lifecycle = Lifecycle::Closing;
            state.received_message_to_ack.is_some()
        };

        if owes_ack {
            let exchange = self.clone();
            tokio::spawn(async move {
                if let Err(e) = exchange
                    .send(MessageType::StandaloneAck.code(), Bytes::new())
                    .await
                {
                    error!(exchange_id = exchange.exchange_id(), "closing ack failed: {}", e);
                }
            });
        }

        let inner = self.inner.clone();
        let grace = self.inner.mrp.close_grace_period();
        debug!(exchange_id = self.inner.exchange_id, ?grace, "closing exchange");
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            inner.teardown();
        });
    }

    async fn transmit(&self, encoded: Bytes) -> Result<(), ExchangeError> {
        self.inner
            .channel
            .send(encoded)
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))
    }

    /// Standalone ack for a duplicate, leaving the piggy-back slot alone.
    async fn send_ack_for(&self, message_id: u32) -> Result<(), ExchangeError> {
        let encoded = encode_standalone_ack(
            &self.inner.session,
            self.inner.exchange_id,
            self.inner.is_initiator,
            message_id,
            self.inner.node_id,
            self.inner.peer_node_id,
        )?;
        self.transmit(encoded).await
    }

    fn spawn_retransmission(&self, message_id: u32, encoded: Bytes) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.mrp.active_retransmission_timeout();
        let retries = self.inner.mrp.retransmission_retries;

        tokio::spawn(async move {
            for attempt in 1..=retries {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                debug!(
                    exchange_id = inner.exchange_id,
                    message_id, attempt, "retransmitting message"
                );
                if let Err(e) = inner.channel.send(encoded.clone()).await {
                    error!(exchange_id = inner.exchange_id, message_id, "retransmission failed: {}", e);
                }
            }

            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade() {
                MessageExchange { inner }.on_retransmissions_exhausted(message_id, retries);
            }
        })
    }

    fn on_retransmissions_exhausted(&self, message_id: u32, retransmissions: u32) {
        let waiter = {
            let mut state = self.inner.state();
            if state.pending_send.as_ref().map(|p| p.message_id) != Some(message_id) {
                return;
            }
            // This runs on the retransmission task itself, so detach instead of aborting.
            state.retransmission.take();
            state.pending_send.take().and_then(|pending| pending.waiter)
        };

        warn!(
            exchange_id = self.inner.exchange_id,
            message_id, retransmissions, "peer unreachable"
        );
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(ExchangeError::PeerUnreachable {
                message_id,
                retransmissions,
            }));
        }
        self.close();
    }
}

impl fmt::Debug for MessageExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageExchange")
            .field("exchange_id", &self.inner.exchange_id)
            .field("protocol_id", &self.inner.protocol_id)
            .field("initiator", &self.inner.is_initiator)
            .field("session", &self.inner.session.name())
            .finish_non_exhaustive()
    }
}

fn encode_standalone_ack(
    session: &Session,
    exchange_id: u16,
    is_initiator: bool,
    acked_message_id: u32,
    node_id: Option<NodeId>,
    peer_node_id: Option<NodeId>,
) -> Result<Bytes, ExchangeError> {
    let message = Message {
        packet_header: PacketHeader::unicast(
            session.peer_session_id(),
            session.message_counter().next_id(),
            node_id,
            peer_node_id,
        ),
        payload_header: PayloadHeader {
            exchange_id,
            protocol_id: SECURE_CHANNEL_PROTOCOL_ID,
            message_type: MessageType::StandaloneAck.code(),
            is_initiator_message: is_initiator,
            requires_ack: false,
            acked_message_id: Some(acked_message_id),
        },
        payload: Bytes::new(),
    };
    Ok(codec::encode_packet(&session.encode(message)?))
}

/// Ack a message that belongs to no known exchange.
pub(crate) async fn send_standalone_ack(
    session: &Session,
    channel: &dyn Channel,
    message: &Message,
) -> Result<(), ExchangeError> {
    let encoded = encode_standalone_ack(
        session,
        message.payload_header.exchange_id,
        !message.payload_header.is_initiator_message,
        message.packet_header.message_id,
        message.packet_header.dest_node_id,
        message.packet_header.source_node_id,
    )?;
    channel
        .send(encoded)
        .await
        .map_err(|e| ExchangeError::Transport(e.to_string()))
}
