use std::sync::{Mutex, PoisonError};

use bytes::Bytes;

use super::HandshakeError;
use crate::exchange::{ExchangeError, MessageExchange};
use tessel_core::messages::HandshakePayload;
use tessel_core::secure_channel::{MessageType, StatusReport};
use tessel_core::Message;

/// Typed send/receive of handshake payloads over one exchange.
///
/// The first inbound message can be inspected with [`peek_opening`] before a
/// handshake takes over; it is then returned by the next [`read`].
///
/// [`peek_opening`]: SecureChannelMessenger::peek_opening
/// [`read`]: SecureChannelMessenger::read
pub struct SecureChannelMessenger {
    exchange: MessageExchange,
    buffered: Mutex<Option<Message>>,
}

impl SecureChannelMessenger {
    pub fn new(exchange: MessageExchange) -> Self {
        Self {
            exchange,
            buffered: Mutex::new(None),
        }
    }

    pub fn exchange(&self) -> &MessageExchange {
        &self.exchange
    }

    pub fn channel_name(&self) -> String {
        self.exchange.channel_name()
    }

    /// Type of the message that opened the exchange.
    pub async fn peek_opening(&self) -> Result<u8, HandshakeError> {
        let message = self.exchange.next_message().await?;
        let message_type = message.payload_header.message_type;
        *self.buffered.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
        Ok(message_type)
    }

    async fn next_message(&self) -> Result<Message, HandshakeError> {
        let buffered = self
            .buffered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match buffered {
            Some(message) => Ok(message),
            None => Ok(self.exchange.next_message().await?),
        }
    }

    /// Encode and send `payload`; returns the encoded bytes for transcripts.
    pub async fn send<T: HandshakePayload>(
        &self,
        message_type: MessageType,
        payload: &T,
    ) -> Result<Bytes, HandshakeError> {
        let bytes = payload.to_bytes()?;
        self.exchange
            .send(message_type.code(), bytes.clone())
            .await?;
        Ok(bytes)
    }

    /// Read the next message as `T`. Returns the decoded payload and its raw bytes.
    ///
    /// A status report in place of the expected message is surfaced as
    /// [`HandshakeError::PeerStatus`].
    pub async fn read<T: HandshakePayload>(
        &self,
        expected: MessageType,
    ) -> Result<(T, Bytes), HandshakeError> {
        let message = self.next_message().await?;
        let received = message.payload_header.message_type;
        if received != expected.code() {
            if received == MessageType::StatusReport.code() {
                return Err(HandshakeError::PeerStatus(StatusReport::decode(
                    &message.payload,
                )?));
            }
            return Err(ExchangeError::UnexpectedMessageType {
                expected: expected.code(),
                received,
            }
            .into());
        }
        let payload = T::from_bytes(&message.payload)?;
        Ok((payload, message.payload))
    }

    pub async fn send_success(&self) -> Result<(), HandshakeError> {
        self.send_status(StatusReport::success()).await
    }

    pub async fn send_error(&self) -> Result<(), HandshakeError> {
        self.send_status(StatusReport::failure()).await
    }

    async fn send_status(&self, report: StatusReport) -> Result<(), HandshakeError> {
        self.exchange
            .send(MessageType::StatusReport.code(), report.encode())
            .await?;
        Ok(())
    }

    /// Wait for the peer's closing status report.
    pub async fn wait_for_success(&self) -> Result<(), HandshakeError> {
        let message = self.next_message().await?;
        let received = message.payload_header.message_type;
        if received != MessageType::StatusReport.code() {
            return Err(ExchangeError::UnexpectedMessageType {
                expected: MessageType::StatusReport.code(),
                received,
            }
            .into());
        }
        let report = StatusReport::decode(&message.payload)?;
        if !report.is_success() {
            return Err(HandshakeError::PeerStatus(report));
        }
        Ok(())
    }

    pub fn close(&self) {
        self.exchange.close();
    }
}
