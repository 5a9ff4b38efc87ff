//! Commissionable device front-end.
//!
//! A [`Device`] owns the session table, the fabric table and an exchange
//! manager with the secure-channel responder registered. Datagrams arrive on
//! one UDP socket; each sender address becomes its own [`UdpChannel`].
//!
//! [`UdpChannel`]: crate::channel::UdpChannel

use std::io;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tracing::info;

use crate::channel;
use crate::exchange_manager::{ExchangeManager, ProtocolHandler};
use crate::fabric_manager::FabricManager;
use crate::interaction::InteractionProtocol;
use crate::secure_channel::{PaseServer, SecureChannelProtocol};
use crate::session::SessionManager;
use tessel_common::{Error, NodeConfig, Result};
use tessel_core::messages::PbkdfParameters;
use tessel_crypto::crypto::random_vec;
use tessel_crypto::Fabric;

pub struct DeviceBuilder {
    config: NodeConfig,
    fabrics: Vec<Fabric>,
    interaction: Option<InteractionProtocol>,
}

impl DeviceBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            fabrics: Vec::new(),
            interaction: None,
        }
    }

    /// Preload an operational fabric so CASE works without commissioning.
    pub fn with_fabric(mut self, fabric: Fabric) -> Self {
        self.fabrics.push(fabric);
        self
    }

    pub fn with_interaction(mut self, handler: InteractionProtocol) -> Self {
        self.interaction = Some(handler);
        self
    }

    pub fn build(self) -> Result<Device> {
        self.config.validate()?;

        let sessions = Arc::new(SessionManager::with_mrp(self.config.mrp));
        let mut fabric_manager = FabricManager::new();
        for fabric in self.fabrics {
            fabric_manager.add_fabric(fabric);
        }
        let fabrics = Arc::new(Mutex::new(fabric_manager));

        let pbkdf = PbkdfParameters {
            iterations: self.config.pbkdf_iterations,
            salt: random_vec(self.config.pbkdf_salt_length),
        };
        let pase = PaseServer::from_pin(self.config.passcode, pbkdf, sessions.clone());
        let secure_channel = SecureChannelProtocol::new(Some(pase), sessions.clone(), fabrics.clone());

        let exchanges = ExchangeManager::new(sessions.clone())
            .with_handler(ProtocolHandler::SecureChannel(Arc::new(secure_channel)));
        if let Some(interaction) = self.interaction {
            exchanges.add_protocol_handler(ProtocolHandler::Interaction(interaction));
        }

        info!(
            discriminator = self.config.discriminator,
            vendor_id = self.config.vendor_id,
            "device ready for commissioning"
        );
        Ok(Device {
            config: self.config,
            sessions,
            fabrics,
            exchanges: Arc::new(exchanges),
        })
    }
}

pub struct Device {
    config: NodeConfig,
    sessions: Arc<SessionManager>,
    fabrics: Arc<Mutex<FabricManager>>,
    exchanges: Arc<ExchangeManager>,
}

impl Device {
    pub fn builder(config: NodeConfig) -> DeviceBuilder {
        DeviceBuilder::new(config)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn fabrics(&self) -> &Arc<Mutex<FabricManager>> {
        &self.fabrics
    }

    pub fn exchanges(&self) -> &Arc<ExchangeManager> {
        &self.exchanges
    }

    /// Serve datagrams from an already bound socket until it fails.
    pub async fn serve(&self, socket: Arc<UdpSocket>) -> io::Result<()> {
        info!(listen = %socket.local_addr()?, "device listening");
        channel::receive_loop(socket, self.exchanges.clone()).await
    }

    /// Bind the configured listen address and serve.
    pub async fn run(&self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.listen)
            .await
            .map_err(|e| Error::config(format!("binding {}: {e}", self.config.listen)))?;
        self.serve(Arc::new(socket)).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        info!(sessions = self.sessions.session_count(), "device shutting down");
        self.exchanges.close();
    }
}
