//! Connection handshake over real sockets.

use rust_eudaq::protocol::{Channel, ClientHandshake, Inbound, ServerHandshake};
use rust_eudaq::transport::{self, HandshakeState, TransportEvent, TransportServer};
use rust_eudaq::DaqError;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Serves handshakes until the first identification and returns it.
async fn serve_one(server: Arc<dyn TransportServer>, handshake: ServerHandshake, accepting: bool) -> Option<Inbound> {
    loop {
        match server.process(WAIT).await? {
            TransportEvent::Connect(conn) => {
                handshake.on_connect(server.as_ref(), conn, accepting).await.ok()?;
            }
            TransportEvent::Receive(conn, packet) => {
                return handshake.on_receive(server.as_ref(), conn, packet).await.ok();
            }
            TransportEvent::Disconnect(_) => {
                if !accepting {
                    return None;
                }
            }
        }
    }
}

#[tokio::test]
async fn test_tcp_handshake_records_identity() {
    let server = transport::listen("tcp://127.0.0.1:0").await.unwrap();
    let address = server.connection_string();
    let serving = tokio::spawn(serve_one(Arc::clone(&server), ServerHandshake::new(Channel::Data), true));

    let mut client = transport::connect(&address).await.unwrap();
    let hs = ClientHandshake::new(Channel::Data, "Producer", "tlu")
        .perform(client.as_mut(), WAIT, WAIT)
        .await
        .unwrap();
    assert_eq!(hs.state(), HandshakeState::Identified);
    assert!(hs.peer_view().is_some());

    let info = match serving.await.unwrap() {
        Some(Inbound::Identified(info)) => info,
        other => panic!("expected identification, got {other:?}"),
    };
    assert_eq!(info.role, "Producer");
    assert_eq!(info.name, "tlu");
    assert!(server.registry().is_identified(info.id));

    // Later packets on the same connection are payload.
    client.send(b"payload").await.unwrap();
    let TransportEvent::Receive(conn, packet) = server.process(WAIT).await.unwrap() else {
        panic!("expected a packet");
    };
    let inbound = ServerHandshake::new(Channel::Data)
        .on_receive(server.as_ref(), conn, packet)
        .await
        .unwrap();
    assert_eq!(inbound, Inbound::Payload(bytes::Bytes::from_static(b"payload")));

    server.shutdown().await;
}

#[tokio::test]
async fn test_refused_client_sees_reason() {
    let server = transport::listen("tcp://127.0.0.1:0").await.unwrap();
    let address = server.connection_string();
    let serving = tokio::spawn(serve_one(Arc::clone(&server), ServerHandshake::new(Channel::Cmd), false));

    let mut client = transport::connect(&address).await.unwrap();
    let err = ClientHandshake::new(Channel::Cmd, "Producer", "late")
        .perform(client.as_mut(), WAIT, WAIT)
        .await
        .unwrap_err();
    match err {
        DaqError::Protocol(message) => {
            assert!(message.contains("refused"), "{message}");
            assert!(message.contains("Not accepting new connections"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    drop(client);
    assert!(serving.await.unwrap().is_none());
    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_identification_still_acknowledged() {
    let server = transport::listen("tcp://127.0.0.1:0").await.unwrap();
    let address = server.connection_string();
    let serving = tokio::spawn(serve_one(Arc::clone(&server), ServerHandshake::new(Channel::Log), true));

    let mut client = transport::connect(&address).await.unwrap();
    let greeting = client.receive(WAIT).await.unwrap().unwrap();
    assert!(greeting.starts_with(b"OK EUDAQ LOG LogCollector"));
    client.send(b"HELLO there").await.unwrap();
    let ack = client.receive(WAIT).await.unwrap().unwrap();
    assert_eq!(&ack[..], b"OK");

    let Some(Inbound::Identified(info)) = serving.await.unwrap() else {
        panic!("expected identification");
    };
    assert_eq!(info.role, "");
    assert_eq!(info.name, "");
    server.shutdown().await;
}

#[tokio::test]
async fn test_null_transport_identifies_immediately() {
    let mut client = transport::connect("null://anything").await.unwrap();
    assert!(client.is_null());
    let hs = ClientHandshake::new(Channel::Cmd, "Producer", "p1")
        .perform(client.as_mut(), WAIT, WAIT)
        .await
        .unwrap();
    assert_eq!(hs.state(), HandshakeState::Identified);
    client.send(b"dropped").await.unwrap();
}
