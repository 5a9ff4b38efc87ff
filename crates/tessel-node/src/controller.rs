//! Commissioner-side front-end: opens channels and runs the handshakes as
//! initiator.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::channel::{self, Channel, UdpChannel};
use crate::exchange_manager::ExchangeManager;
use crate::secure_channel::{CaseClient, HandshakeError, PaseClient};
use crate::session::{Session, SessionManager};
use tessel_core::{MrpParameters, NodeId, SECURE_CHANNEL_PROTOCOL_ID};
use tessel_crypto::Fabric;

pub struct Controller {
    sessions: Arc<SessionManager>,
    exchanges: Arc<ExchangeManager>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new() -> Self {
        Self::with_mrp(MrpParameters::default())
    }

    pub fn with_mrp(mrp: MrpParameters) -> Self {
        let sessions = Arc::new(SessionManager::with_mrp(mrp));
        Self {
            exchanges: Arc::new(ExchangeManager::new(sessions.clone())),
            sessions,
            receivers: Mutex::new(Vec::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn exchanges(&self) -> &Arc<ExchangeManager> {
        &self.exchanges
    }

    /// Bind a local socket, start receiving on it and return a channel to `peer`.
    pub async fn connect_udp(
        &self,
        bind: SocketAddr,
        peer: SocketAddr,
    ) -> io::Result<Arc<UdpChannel>> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        info!(local = %socket.local_addr()?, peer = %peer, "controller socket bound");

        let manager = self.exchanges.clone();
        let receiver = tokio::spawn({
            let socket = socket.clone();
            async move {
                if let Err(e) = channel::receive_loop(socket, manager).await {
                    error!("controller receive loop ended: {}", e);
                }
            }
        });
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(receiver);
        Ok(Arc::new(UdpChannel::new(socket, peer)))
    }

    /// Establish a PASE session with the device behind `channel`.
    pub async fn pair_pase(
        &self,
        channel: Arc<dyn Channel>,
        passcode: u32,
    ) -> Result<Arc<Session>, HandshakeError> {
        let exchange = self.exchanges.initiate_exchange(
            self.sessions.unsecure_session(),
            channel,
            SECURE_CHANNEL_PROTOCOL_ID,
        );
        PaseClient::new(self.sessions.clone())
            .pair(exchange, passcode)
            .await
    }

    /// Establish a CASE session with `peer_node_id` on `fabric`.
    pub async fn pair_case(
        &self,
        channel: Arc<dyn Channel>,
        fabric: Arc<Fabric>,
        peer_node_id: NodeId,
    ) -> Result<Arc<Session>, HandshakeError> {
        let exchange = self.exchanges.initiate_exchange(
            self.sessions.unsecure_session(),
            channel,
            SECURE_CHANNEL_PROTOCOL_ID,
        );
        CaseClient::new(self.sessions.clone())
            .pair(exchange, fabric, peer_node_id)
            .await
    }

    /// Close open exchanges and stop the receive loops.
    pub fn close(&self) {
        self.exchanges.close();
        for receiver in self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            receiver.abort();
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}
