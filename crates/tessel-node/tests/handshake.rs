//! PASE and CASE between a controller and a device joined by an in-memory pipe.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use tessel_common::config::DEFAULT_PASSCODE;
use tessel_common::NodeConfig;
use tessel_core::messages::{
    HandshakePayload, PasePake1, PasePake3, PbkdfParamRequest, PbkdfParamResponse, PbkdfParameters,
};
use tessel_core::{
    MessageType, StatusReport, DEFAULT_PASSCODE_ID, INTERACTION_PROTOCOL_ID,
    SECURE_CHANNEL_PROTOCOL_ID,
};
use tessel_crypto::crypto::{self, random_bytes};
use tessel_crypto::spake2p::SPAKE_CONTEXT_PREFIX;
use tessel_crypto::{CertificateAuthority, Fabric, FabricBuilder, FabricIndex, Spake2p};
use tessel_node::secure_channel::PaseServer;
use tessel_node::{
    Channel, Controller, Device, ExchangeManager, FabricManager, HandshakeError,
    InteractionProtocol, MessageExchange, ProtocolHandler, SecureChannelProtocol, SessionManager,
};

const FABRIC_ID: u64 = 0x2906_c908_d115_d362;
const DEVICE_NODE_ID: u64 = 0x0000_0000_0000_0d01;
const CONTROLLER_NODE_ID: u64 = 0x0000_0000_0001_b669;
const IPK: [u8; 16] = [0x74; 16];

struct PipeChannel {
    name: &'static str,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Channel for PipeChannel {
    async fn send(&self, data: Bytes) -> io::Result<()> {
        self.tx
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
    }

    fn name(&self) -> String {
        self.name.to_string()
    }
}

/// Join two managers. Returns the channel `a` uses to reach `b`.
fn connect(a: Arc<ExchangeManager>, b: Arc<ExchangeManager>) -> Arc<dyn Channel> {
    let (to_b, mut at_b) = mpsc::unbounded_channel();
    let (to_a, mut at_a) = mpsc::unbounded_channel();
    let a_to_b: Arc<dyn Channel> = Arc::new(PipeChannel {
        name: "pipe://b",
        tx: to_b,
    });
    let b_to_a: Arc<dyn Channel> = Arc::new(PipeChannel {
        name: "pipe://a",
        tx: to_a,
    });

    tokio::spawn({
        let reply = b_to_a.clone();
        async move {
            while let Some(data) = at_b.recv().await {
                let _ = b.on_datagram(reply.clone(), data).await;
            }
        }
    });
    tokio::spawn({
        let reply = a_to_b.clone();
        async move {
            while let Some(data) = at_a.recv().await {
                let _ = a.on_datagram(reply.clone(), data).await;
            }
        }
    });
    a_to_b
}

fn fabric(ca: &mut CertificateAuthority, node_id: u64) -> Fabric {
    let mut builder = FabricBuilder::new(FabricIndex(1));
    let noc = ca
        .generate_noc(&builder.public_key(), FABRIC_ID, node_id)
        .unwrap();
    builder
        .set_root_cert(ca.root_cert().clone())
        .set_operational_cert(noc)
        .set_identity_protection_key(&IPK)
        .set_vendor_id(0xfff1);
    builder.build().unwrap()
}

/// Start PASE by hand and finish the parameter round trip. Returns the
/// exchange with the raw request and response payloads.
async fn open_pase(
    controller: &Controller,
    to_device: Arc<dyn Channel>,
) -> (MessageExchange, Bytes, Bytes) {
    let exchange = controller.exchanges().initiate_exchange(
        controller.sessions().unsecure_session(),
        to_device,
        SECURE_CHANNEL_PROTOCOL_ID,
    );
    let request = PbkdfParamRequest {
        random: random_bytes(),
        session_id: 0x4242,
        passcode_id: DEFAULT_PASSCODE_ID,
        has_pbkdf_parameters: false,
        mrp_parameters: None,
    }
    .to_bytes()
    .unwrap();
    exchange
        .send(MessageType::PbkdfParamRequest.code(), request.clone())
        .await
        .unwrap();
    let response = exchange
        .wait_for(MessageType::PbkdfParamResponse.code())
        .await
        .unwrap();
    (exchange, request, response.payload)
}

async fn assert_failure_status(exchange: &MessageExchange) {
    let message = exchange
        .wait_for(MessageType::StatusReport.code())
        .await
        .unwrap();
    let report = StatusReport::decode(&message.payload).unwrap();
    assert!(!report.is_success(), "{report}");
}

#[tokio::test]
async fn test_pase_session_carries_interaction_traffic() {
    let (interaction, mut incoming) = InteractionProtocol::new(4);
    let device = Device::builder(NodeConfig::default())
        .with_interaction(interaction)
        .build()
        .unwrap();
    let controller = Controller::new();
    let to_device = connect(controller.exchanges().clone(), device.exchanges().clone());

    let session = controller
        .pair_pase(to_device.clone(), DEFAULT_PASSCODE)
        .await
        .unwrap();
    assert!(session.is_secure());
    assert_eq!(controller.sessions().session_count(), 1);

    let device_session = device
        .sessions()
        .get_session(session.peer_session_id())
        .unwrap();
    assert_eq!(device_session.peer_session_id(), session.id());
    assert!(device_session.as_secure().unwrap().fabric().is_none());

    // Round trip on the new session: request, report, closing ack.
    let exchange =
        controller
            .exchanges()
            .initiate_exchange(session.clone(), to_device, INTERACTION_PROTOCOL_ID);
    let request = tokio::spawn({
        let exchange = exchange.clone();
        async move { exchange.send(0x02, Bytes::from_static(b"read")).await }
    });

    let inbound = incoming.recv().await.unwrap();
    assert!(inbound.session().is_secure());
    assert_eq!(inbound.next_message().await.unwrap().payload.as_ref(), b"read");
    let report = tokio::spawn({
        let inbound = inbound.clone();
        async move { inbound.send(0x05, Bytes::from_static(b"report")).await }
    });

    request.await.unwrap().unwrap();
    assert_eq!(exchange.next_message().await.unwrap().payload.as_ref(), b"report");
    exchange.close();
    report.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_pase_wrong_passcode_creates_no_session() {
    let device = Device::builder(NodeConfig::default()).build().unwrap();
    let controller = Controller::new();
    let to_device = connect(controller.exchanges().clone(), device.exchanges().clone());

    let err = controller.pair_pase(to_device, 12_341_234).await.unwrap_err();
    assert!(matches!(err, HandshakeError::KeyConfirmationMismatch));
    assert_eq!(controller.sessions().session_count(), 0);
    assert_eq!(device.sessions().session_count(), 0);
}

#[tokio::test]
async fn test_pase_out_of_order_message_gets_failure_status() {
    let device = Device::builder(NodeConfig::default()).build().unwrap();
    let controller = Controller::new();
    let to_device = connect(controller.exchanges().clone(), device.exchanges().clone());
    let (exchange, _, _) = open_pase(&controller, to_device).await;

    // Pake3 where Pake1 belongs.
    let pake3 = PasePake3 {
        verifier: vec![0; 32],
    }
    .to_bytes()
    .unwrap();
    exchange
        .send(MessageType::PasePake3.code(), pake3)
        .await
        .unwrap();

    assert_failure_status(&exchange).await;
    exchange.close();
    assert_eq!(device.sessions().session_count(), 0);
}

#[tokio::test]
async fn test_pase_bad_initiator_confirmation_gets_failure_status() {
    let device = Device::builder(NodeConfig::default()).build().unwrap();
    let controller = Controller::new();
    let to_device = connect(controller.exchanges().clone(), device.exchanges().clone());
    let (exchange, request, response) = open_pase(&controller, to_device).await;

    let pbkdf = PbkdfParamResponse::from_bytes(&response)
        .unwrap()
        .pbkdf_parameters
        .unwrap();
    let (w0, _) = Spake2p::compute_w0_w1(&pbkdf, DEFAULT_PASSCODE);
    let context = crypto::hash(&[SPAKE_CONTEXT_PREFIX, &request[..], &response[..]]);
    let x = Spake2p::create(context, w0).compute_x().unwrap();
    exchange
        .send(MessageType::PasePake1.code(), PasePake1 { x }.to_bytes().unwrap())
        .await
        .unwrap();
    exchange
        .wait_for(MessageType::PasePake2.code())
        .await
        .unwrap();

    let pake3 = PasePake3 {
        verifier: vec![0xa5; 32],
    }
    .to_bytes()
    .unwrap();
    exchange
        .send(MessageType::PasePake3.code(), pake3)
        .await
        .unwrap();

    assert_failure_status(&exchange).await;
    exchange.close();
    assert_eq!(device.sessions().session_count(), 0);
}

#[tokio::test]
async fn test_pase_client_refuses_excessive_iterations() {
    let salt = vec![0x5a; 32];
    let verification = Spake2p::compute_w0_l(
        &PbkdfParameters {
            iterations: 1000,
            salt: salt.clone(),
        },
        DEFAULT_PASSCODE,
    )
    .to_bytes();
    let sessions = Arc::new(SessionManager::new());
    let pase = PaseServer::from_verification_value(
        &verification,
        Some(PbkdfParameters {
            iterations: u32::MAX,
            salt,
        }),
        sessions.clone(),
    )
    .unwrap();
    let responder = SecureChannelProtocol::new(
        Some(pase),
        sessions.clone(),
        Arc::new(Mutex::new(FabricManager::new())),
    );
    let responder = Arc::new(
        ExchangeManager::new(sessions.clone())
            .with_handler(ProtocolHandler::SecureChannel(Arc::new(responder))),
    );
    let controller = Controller::new();
    let to_responder = connect(controller.exchanges().clone(), responder);

    let err = controller
        .pair_pase(to_responder, DEFAULT_PASSCODE)
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::PbkdfIterationsOutOfRange(u32::MAX)));
    assert_eq!(controller.sessions().session_count(), 0);
    assert_eq!(sessions.session_count(), 0);
}

#[tokio::test]
async fn test_case_binds_session_to_fabric() {
    let mut ca = CertificateAuthority::new().unwrap();
    let device = Device::builder(NodeConfig::default())
        .with_fabric(fabric(&mut ca, DEVICE_NODE_ID))
        .build()
        .unwrap();
    let controller = Controller::new();
    let controller_fabric = Arc::new(fabric(&mut ca, CONTROLLER_NODE_ID));
    let to_device = connect(controller.exchanges().clone(), device.exchanges().clone());

    let session = controller
        .pair_case(to_device, controller_fabric, DEVICE_NODE_ID)
        .await
        .unwrap();
    assert_eq!(session.node_id(), Some(CONTROLLER_NODE_ID));
    assert_eq!(session.peer_node_id(), Some(DEVICE_NODE_ID));

    let device_session = device
        .sessions()
        .get_session(session.peer_session_id())
        .unwrap();
    assert_eq!(device_session.node_id(), Some(DEVICE_NODE_ID));
    assert_eq!(device_session.peer_node_id(), Some(CONTROLLER_NODE_ID));
    assert_eq!(
        device_session.as_secure().unwrap().fabric().unwrap().fabric_id(),
        FABRIC_ID
    );
}

#[tokio::test]
async fn test_case_with_foreign_root_is_rejected() {
    let mut device_ca = CertificateAuthority::new().unwrap();
    let mut other_ca = CertificateAuthority::new().unwrap();
    let device = Device::builder(NodeConfig::default())
        .with_fabric(fabric(&mut device_ca, DEVICE_NODE_ID))
        .build()
        .unwrap();
    let controller = Controller::new();
    let to_device = connect(controller.exchanges().clone(), device.exchanges().clone());

    let err = controller
        .pair_case(
            to_device,
            Arc::new(fabric(&mut other_ca, CONTROLLER_NODE_ID)),
            DEVICE_NODE_ID,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::PeerStatus(_)));
    assert_eq!(controller.sessions().session_count(), 0);
    assert_eq!(device.sessions().session_count(), 0);
}
