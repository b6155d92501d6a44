//! End-to-end tests for the tunnel relay and the emulated socket
//!
//! Each test stands up a real relay on an ephemeral port plus a real TCP
//! (or TLS) target, then drives the bridge through the client-side socket
//! emulation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use sockbridge::{
    tls, ClientSocket, ConnectionDescriptor, Envelope, HeaderDecoder, ProxyTarget, Relay,
    RelayConfig, SocketEvent,
};

async fn start_relay(config: RelayConfig) -> (Arc<Relay>, ProxyTarget) {
    let relay = Relay::new(config, Arc::new(HeaderDecoder)).unwrap();
    let listener = relay.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = listener.relay();
    tokio::spawn(async move {
        let _ = listener.run().await;
    });
    let target = ProxyTarget {
        secure: false,
        host: "127.0.0.1".to_string(),
        port: addr.port(),
    };
    (handle, target)
}

fn relay_config() -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Echo server that also reports accepted-connection count and per-connection
/// teardown.
async fn start_echo_server() -> (SocketAddr, Arc<AtomicUsize>, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = closed_tx.send(());
            });
        }
    });

    (addr, accepted, closed_rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SocketEvent>) -> SocketEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for socket event")
        .expect("event channel closed")
}

async fn assert_no_more_events(events: &mut mpsc::UnboundedReceiver<SocketEvent>) {
    match timeout(Duration::from_millis(300), events.recv()).await {
        Err(_elapsed) => {}
        Ok(None) => {}
        Ok(Some(event)) => panic!("unexpected event: {:?}", event),
    }
}

async fn wait_for_no_sessions(relay: &Relay) {
    for _ in 0..100 {
        if relay.active_sessions().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "sessions still active: {}",
        relay.active_sessions().await
    );
}

async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (echo_addr, _, _) = start_echo_server().await;
    let (relay, target) = start_relay(relay_config()).await;

    let descriptor = ConnectionDescriptor::new("127.0.0.1", echo_addr.port());
    let (socket, mut events) = ClientSocket::connect(descriptor, &target).await.unwrap();

    assert_eq!(next_event(&mut events).await, SocketEvent::Connect);

    socket.write(&b"ping"[..]).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SocketEvent::Data(Bytes::from_static(b"ping"))
    );

    socket.end().await.unwrap();
    wait_for_no_sessions(&relay).await;
}

#[tokio::test]
async fn test_payload_with_control_marker_stays_data() {
    // Bytes that look exactly like a control message body must pass
    // through untouched in both directions.
    let (echo_addr, _, _) = start_echo_server().await;
    let (_relay, target) = start_relay(relay_config()).await;

    let descriptor = ConnectionDescriptor::new("127.0.0.1", echo_addr.port());
    let (socket, mut events) = ClientSocket::connect(descriptor, &target).await.unwrap();
    assert_eq!(next_event(&mut events).await, SocketEvent::Connect);

    let tricky = Bytes::from_static(br#"{"evt":"close"}"#);
    socket.write(tricky.clone()).unwrap();
    assert_eq!(next_event(&mut events).await, SocketEvent::Data(tricky));

    socket.end().await.unwrap();
}

#[tokio::test]
async fn test_exactly_one_socket_per_session() {
    let (echo_addr, accepted, _) = start_echo_server().await;
    let (relay, target) = start_relay(relay_config()).await;

    let descriptor = ConnectionDescriptor::new("127.0.0.1", echo_addr.port());
    let (socket, mut events) = ClientSocket::connect(descriptor, &target).await.unwrap();
    assert_eq!(next_event(&mut events).await, SocketEvent::Connect);

    socket.end().await.unwrap();
    wait_for_no_sessions(&relay).await;

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refused_target_yields_single_error() {
    let (relay, target) = start_relay(relay_config()).await;
    let dead_port = refused_port().await;

    let descriptor = ConnectionDescriptor::new("127.0.0.1", dead_port);
    let (_socket, mut events) = ClientSocket::connect(descriptor, &target).await.unwrap();

    match next_event(&mut events).await {
        SocketEvent::Error(detail) => assert!(!detail.is_empty()),
        other => panic!("expected error, got {:?}", other),
    }

    // one terminal event per failure: no connect, no data, no trailing close
    assert_no_more_events(&mut events).await;
    wait_for_no_sessions(&relay).await;
}

#[tokio::test]
async fn test_sustained_transfer_preserves_order() {
    // No backpressure exists between the transports; a burst of writes
    // must still arrive complete and in order.
    let (echo_addr, _, _) = start_echo_server().await;
    let (_relay, target) = start_relay(relay_config()).await;

    let descriptor = ConnectionDescriptor::new("127.0.0.1", echo_addr.port());
    let (socket, mut events) = ClientSocket::connect(descriptor, &target).await.unwrap();
    assert_eq!(next_event(&mut events).await, SocketEvent::Connect);

    let mut expected = Vec::new();
    for i in 0..64u32 {
        let chunk: Vec<u8> = (0..(257 + i * 13)).map(|j| (i + j) as u8).collect();
        expected.extend_from_slice(&chunk);
        socket.write(chunk).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < expected.len() {
        match next_event(&mut events).await {
            SocketEvent::Data(bytes) => received.extend_from_slice(&bytes),
            other => panic!("expected data, got {:?}", other),
        }
    }

    assert_eq!(received, expected);
    socket.end().await.unwrap();
}

#[tokio::test]
async fn test_tunnel_close_tears_down_real_socket() {
    let (echo_addr, _, mut closed_rx) = start_echo_server().await;
    let (relay, target) = start_relay(relay_config()).await;

    let descriptor = ConnectionDescriptor::new("127.0.0.1", echo_addr.port());
    let (socket, mut events) = ClientSocket::connect(descriptor, &target).await.unwrap();
    assert_eq!(next_event(&mut events).await, SocketEvent::Connect);

    socket.write(&b"mid-transfer"[..]).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SocketEvent::Data(Bytes::from_static(b"mid-transfer"))
    );

    // tunnel side goes first; the real socket must follow
    socket.destroy();

    timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("real socket was not closed")
        .expect("echo server gone");
    wait_for_no_sessions(&relay).await;
}

#[tokio::test]
async fn test_socket_close_tears_down_tunnel() {
    // Target that answers once and closes: real socket goes first.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"bye").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let (relay, target) = start_relay(relay_config()).await;
    let descriptor = ConnectionDescriptor::new("127.0.0.1", addr.port());
    let (_socket, mut events) = ClientSocket::connect(descriptor, &target).await.unwrap();

    assert_eq!(next_event(&mut events).await, SocketEvent::Connect);
    assert_eq!(
        next_event(&mut events).await,
        SocketEvent::Data(Bytes::from_static(b"bye"))
    );
    assert_eq!(next_event(&mut events).await, SocketEvent::Close);

    wait_for_no_sessions(&relay).await;
}

#[tokio::test]
async fn test_first_message_not_descriptor_closes_silently() {
    let (relay, target) = start_relay(relay_config()).await;

    // Raw tunnel client sending a data frame where the descriptor belongs
    let (mut ws, _) = tokio_tungstenite::connect_async(target.url()).await.unwrap();
    let frame = Envelope::Data(Bytes::from_static(b"hello")).encode().unwrap();
    ws.send(WsMessage::Binary(frame.to_vec())).await.unwrap();

    // the relay closes the session and emits no event
    loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("relay did not close the session")
        {
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            other => panic!("expected close, got {:?}", other),
        }
    }

    wait_for_no_sessions(&relay).await;
}

#[tokio::test]
async fn test_tls_echo_emits_secure_connect_first() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let ca_path = write_temp_ca(&cert);

    let addr = start_tls_echo_server(&cert).await;

    let config = RelayConfig {
        extra_ca: Some(ca_path.clone()),
        ..relay_config()
    };
    let (relay, target) = start_relay(config).await;

    let descriptor =
        ConnectionDescriptor::new("127.0.0.1", addr.port()).with_servername("localhost");
    let (socket, mut events) = tls::connect(descriptor, &target).await.unwrap();

    assert_eq!(next_event(&mut events).await, SocketEvent::SecureConnect);

    socket.write(&b"ping"[..]).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SocketEvent::Data(Bytes::from_static(b"ping"))
    );

    socket.end().await.unwrap();
    wait_for_no_sessions(&relay).await;
    let _ = std::fs::remove_file(ca_path);
}

fn write_temp_ca(cert: &rcgen::CertifiedKey) -> PathBuf {
    let path = std::env::temp_dir().join(format!("sockbridge-test-ca-{}.pem", std::process::id()));
    std::fs::write(&path, cert.cert.pem()).unwrap();
    path
}

async fn start_tls_echo_server(cert: &rcgen::CertifiedKey) -> SocketAddr {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    let (mut read, mut write) = tokio::io::split(tls);
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                }
            });
        }
    });

    addr
}
