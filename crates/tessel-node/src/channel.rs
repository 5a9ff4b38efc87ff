//! Datagram channels.
//!
//! A [`Channel`] is one peer on one transport. Exchanges only ever need to
//! push an encoded packet at it; receiving is driven by whoever owns the
//! socket, which feeds datagrams into an [`ExchangeManager`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::exchange_manager::ExchangeManager;

/// Largest datagram read from the socket.
pub const MAX_DATAGRAM_SIZE: usize = 1280;

#[async_trait]
pub trait Channel: Send + Sync {
    /// Transmit one encoded packet.
    async fn send(&self, data: Bytes) -> io::Result<()>;

    /// Stable name used in logs and as part of the exchange key.
    fn name(&self) -> String;
}

/// A peer reachable through a shared UDP socket.
#[derive(Debug, Clone)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpChannel {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn send(&self, data: Bytes) -> io::Result<()> {
        let sent = self.socket.send_to(&data, self.peer).await?;
        if sent != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {sent} of {} bytes", data.len()),
            ));
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("udp://{}", self.peer)
    }
}

/// Read datagrams forever and hand each one to `manager`.
///
/// Routing failures are logged and the datagram dropped; only socket errors
/// end the loop.
pub async fn receive_loop(socket: Arc<UdpSocket>, manager: Arc<ExchangeManager>) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let data = Bytes::copy_from_slice(&buf[..len]);
        let channel: Arc<dyn Channel> = Arc::new(UdpChannel::new(socket.clone(), peer));
        debug!(peer = %peer, len, "datagram received");

        if let Err(e) = manager.on_datagram(channel, data).await {
            warn!(peer = %peer, "dropping datagram: {}", e);
        }
    }
}
