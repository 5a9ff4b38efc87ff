//! Device and controller talking over real UDP sockets on loopback.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use tessel_common::NodeConfig;
use tessel_node::{Controller, Device};

const PASSCODE: u32 = 34_567_890;

async fn start_device(config: NodeConfig) -> (Arc<Device>, SocketAddr) {
    let device = Arc::new(Device::builder(config).build().unwrap());
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    tokio::spawn({
        let device = device.clone();
        async move { device.serve(socket).await }
    });
    (device, addr)
}

#[tokio::test]
async fn test_pair_over_udp() {
    let config = NodeConfig {
        passcode: PASSCODE,
        ..NodeConfig::default()
    };
    let (device, addr) = start_device(config).await;

    let controller = Controller::new();
    let channel = controller
        .connect_udp("127.0.0.1:0".parse().unwrap(), addr)
        .await
        .unwrap();
    let session = controller.pair_pase(channel, PASSCODE).await.unwrap();

    let device_session = device
        .sessions()
        .get_session(session.peer_session_id())
        .unwrap();
    assert_eq!(device_session.peer_session_id(), session.id());

    controller.close();
    device.shutdown();
}

#[tokio::test]
async fn test_two_controllers_pair_independently() {
    let config = NodeConfig {
        passcode: PASSCODE,
        ..NodeConfig::default()
    };
    let (device, addr) = start_device(config).await;

    let first = Controller::new();
    let second = Controller::new();
    let first_channel = first
        .connect_udp("127.0.0.1:0".parse().unwrap(), addr)
        .await
        .unwrap();
    let second_channel = second
        .connect_udp("127.0.0.1:0".parse().unwrap(), addr)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        first.pair_pase(first_channel, PASSCODE),
        second.pair_pase(second_channel, PASSCODE)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.peer_session_id(), b.peer_session_id());
    assert_eq!(device.sessions().session_count(), 2);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = NodeConfig {
        passcode: 11_111_111,
        ..NodeConfig::default()
    };
    assert!(Device::builder(config).build().is_err());
}
