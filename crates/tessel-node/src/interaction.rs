//! Interaction-protocol hand-off.
//!
//! The data model is not part of this crate. New interaction exchanges are
//! passed to the application over a bounded channel; the application then
//! drives `next_message`/`wait_for`/`send` on the exchange itself.

use tokio::sync::mpsc;
use tracing::warn;

use crate::exchange::MessageExchange;
use tessel_core::INTERACTION_PROTOCOL_ID;

#[derive(Debug, Clone)]
pub struct InteractionProtocol {
    exchanges: mpsc::Sender<MessageExchange>,
    allow_unsecured: bool,
}

impl InteractionProtocol {
    /// Handler plus the receiving end the application reads exchanges from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MessageExchange>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                exchanges: tx,
                allow_unsecured: false,
            },
            rx,
        )
    }

    /// Also accept exchanges on the unsecured session. Only useful in tests.
    pub fn allow_unsecured(mut self) -> Self {
        self.allow_unsecured = true;
        self
    }

    pub fn protocol_id(&self) -> u16 {
        INTERACTION_PROTOCOL_ID
    }

    pub async fn on_new_exchange(&self, exchange: MessageExchange) {
        if !self.allow_unsecured && !exchange.session().is_secure() {
            warn!(
                exchange_id = exchange.exchange_id(),
                channel = %exchange.channel_name(),
                "interaction request on unsecured session rejected"
            );
            exchange.close();
            return;
        }

        if let Err(mpsc::error::SendError(exchange)) = self.exchanges.send(exchange).await {
            warn!(
                exchange_id = exchange.exchange_id(),
                "no application consumer for interaction exchange"
            );
            exchange.close();
        }
    }
}
