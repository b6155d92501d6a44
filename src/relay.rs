//! Tunnel-terminating relay server
//!
//! The relay accepts WebSocket tunnel sessions, reads the connection
//! descriptor that opens each one, dials the real TCP or TLS socket, and
//! forwards frames verbatim in both directions. Each relayed chunk is also
//! offered to a [`WireDecoder`] for diagnostics; decoding never affects
//! forwarding.
//!
//! Session lifecycle:
//!
//! ```text
//! INIT ──descriptor──▶ CONNECTING ──connect/secureConnect──▶ OPEN ──▶ CLOSED
//!   │                      │                                  │
//!   └─ violation: close    └─ error/timeout event, close      └─ close/error/
//!      without event                                             timeout/parseError
//! ```
//!
//! Sessions are one-shot: no retries at any state, one terminal event per
//! failure. Whichever half of a session closes first, the other half is
//! shut down before the session leaves the active set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::decode::WireDecoder;
use crate::envelope::{ConnectionDescriptor, ControlEvent, Envelope, EventKind};
use crate::SockbridgeError;

/// Session identifier, unique for the lifetime of a relay
pub type SessionId = u64;

/// Forwarding buffer for reads from the real socket
const READ_BUF_SIZE: usize = 16 * 1024;

trait TargetStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TargetStream for T {}

/// How a session left the OPEN state.
enum Closed {
    /// Tunnel side closed first
    TunnelClosed,
    /// Tunnel channel failed
    TunnelError(String),
    /// Real socket reached EOF
    SocketClosed,
    /// Real socket failed
    SocketError(std::io::Error),
    /// Tunnel side broke the session protocol
    Violation(String),
    /// Relay shutdown
    Cancelled,
}

/// Relay server: terminates tunnel sessions and bridges them to real
/// TCP/TLS sockets.
pub struct Relay {
    config: RelayConfig,
    decoder: Arc<dyn WireDecoder>,
    connector: TlsConnector,
    force_tls: bool,
    sessions: Mutex<HashMap<SessionId, CancellationToken>>,
    next_session: AtomicU64,
}

impl Relay {
    /// Create a relay. Certificate material named by the configuration is
    /// loaded here, once, and applies uniformly to all TLS sessions.
    pub fn new(config: RelayConfig, decoder: Arc<dyn WireDecoder>) -> Result<Self, SockbridgeError> {
        config.validate().map_err(SockbridgeError::InvalidConfig)?;
        let connector = build_connector(&config)?;
        let force_tls = config.cert.is_some();

        Ok(Self {
            config,
            decoder,
            connector,
            force_tls,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    /// Bind the configured listen address.
    pub async fn bind(self) -> Result<RelayListener, SockbridgeError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        log::info!("relay listening on {}", listener.local_addr()?);
        Ok(RelayListener {
            relay: Arc::new(self),
            listener,
        })
    }

    /// Number of live sessions, for accounting and shutdown only.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Cancel every live session.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.lock().await;
        log::info!("shutting down {} active sessions", sessions.len());
        for cancel in sessions.values() {
            cancel.cancel();
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let active = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(id, cancel.clone());
            sessions.len()
        };
        log::info!("session {}: tunnel accepted from {} ({} active)", id, peer, active);

        if let Err(e) = self.run_session(id, stream, cancel).await {
            log::debug!("session {}: {}", id, e);
        }

        // The session's two halves are already closed; only now does the
        // session leave the active set.
        self.sessions.lock().await.remove(&id);
        log::info!("session {}: closed", id);
    }

    async fn run_session(
        &self,
        id: SessionId,
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> Result<(), SockbridgeError> {
        let mut tunnel = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| SockbridgeError::Tunnel(format!("handshake failed: {}", e)))?;

        // INIT: the first message must be the descriptor. Anything else is
        // a protocol violation: close the session, emit no event.
        let descriptor = match self.read_descriptor(&mut tunnel, &cancel).await? {
            Some(descriptor) => descriptor,
            None => return Ok(()),
        };

        // CONNECTING
        let use_tls = descriptor.tls || self.force_tls;
        log::info!(
            "session {}: opening{} connection to {}:{}",
            id,
            if use_tls { " secure" } else { "" },
            descriptor.host,
            descriptor.port
        );

        let target = match tokio::time::timeout(
            self.config.connect_timeout,
            self.open_target(&descriptor, use_tls),
        )
        .await
        {
            Err(_elapsed) => {
                log::info!("session {}: connect timed out", id);
                let _ = send_control(&mut tunnel, ControlEvent::new(EventKind::Timeout)).await;
                let _ = tunnel.close(None).await;
                return Ok(());
            }
            Ok(Err(e)) => {
                log::info!("session {}: connect failed: {}", id, e);
                let _ = send_control(
                    &mut tunnel,
                    ControlEvent::with_detail(EventKind::Error, e.to_string()),
                )
                .await;
                let _ = tunnel.close(None).await;
                return Ok(());
            }
            Ok(Ok(target)) => target,
        };

        let connected = if use_tls {
            EventKind::SecureConnect
        } else {
            EventKind::Connect
        };
        send_control(&mut tunnel, ControlEvent::new(connected)).await?;
        log::info!(
            "session {}: connected to {}:{}",
            id,
            descriptor.host,
            descriptor.port
        );

        // OPEN, then symmetric CLOSED teardown
        self.relay_frames(id, tunnel, target, cancel).await;
        Ok(())
    }

    async fn read_descriptor(
        &self,
        tunnel: &mut WebSocketStream<TcpStream>,
        cancel: &CancellationToken,
    ) -> Result<Option<ConnectionDescriptor>, SockbridgeError> {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tunnel.close(None).await;
                    return Ok(None);
                }
                message = tunnel.next() => message,
            };

            return match message {
                Some(Ok(WsMessage::Binary(raw))) => match Envelope::decode(Bytes::from(raw)) {
                    Ok(Envelope::Descriptor(descriptor)) => Ok(Some(descriptor)),
                    Ok(_) => {
                        let _ = tunnel.close(None).await;
                        Err(SockbridgeError::Protocol(
                            "first message was not a descriptor".to_string(),
                        ))
                    }
                    Err(e) => {
                        let _ = tunnel.close(None).await;
                        Err(SockbridgeError::Protocol(format!(
                            "bad first message: {}",
                            e
                        )))
                    }
                },
                // Transport-level frames before the descriptor are fine
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => Ok(None),
                Some(Ok(_)) => {
                    let _ = tunnel.close(None).await;
                    Err(SockbridgeError::Protocol(
                        "first message was not a descriptor".to_string(),
                    ))
                }
                Some(Err(e)) => Err(SockbridgeError::Tunnel(e.to_string())),
            };
        }
    }

    async fn open_target(
        &self,
        descriptor: &ConnectionDescriptor,
        use_tls: bool,
    ) -> Result<Box<dyn TargetStream>, SockbridgeError> {
        let tcp = TcpStream::connect((descriptor.host.as_str(), descriptor.port)).await?;

        if !use_tls {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(descriptor.tls_server_name().to_string())
            .map_err(|e| {
                SockbridgeError::Protocol(format!(
                    "invalid server name {}: {}",
                    descriptor.tls_server_name(),
                    e
                ))
            })?;
        let tls = self.connector.connect(server_name, tcp).await?;
        Ok(Box::new(tls))
    }

    /// Full-duplex forwarding between the tunnel and the real socket,
    /// then teardown of both halves.
    async fn relay_frames(
        &self,
        id: SessionId,
        tunnel: WebSocketStream<TcpStream>,
        target: Box<dyn TargetStream>,
        cancel: CancellationToken,
    ) {
        let (mut sink, mut stream) = tunnel.split();
        let (mut target_read, mut target_write) = tokio::io::split(target);
        let mut diagnostics =
            Diagnostics::new(id, &*self.decoder, self.config.decode_failure_log_limit);
        let mut buf = vec![0u8; READ_BUF_SIZE];

        let closed = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Closed::Cancelled,

                message = stream.next() => match message {
                    Some(Ok(WsMessage::Binary(raw))) => match Envelope::decode(Bytes::from(raw)) {
                        Ok(Envelope::Data(bytes)) => {
                            diagnostics.inspect("client", &bytes);
                            if let Err(e) = target_write.write_all(&bytes).await {
                                break Closed::SocketError(e);
                            }
                        }
                        Ok(Envelope::Descriptor(_)) => {
                            break Closed::Violation("descriptor repeated".to_string());
                        }
                        Ok(Envelope::Control(_)) => {
                            break Closed::Violation("control event from client".to_string());
                        }
                        Err(e) => break Closed::Violation(e.to_string()),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break Closed::TunnelClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Closed::TunnelError(e.to_string()),
                },

                read = target_read.read(&mut buf) => match read {
                    Ok(0) => break Closed::SocketClosed,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        diagnostics.inspect("server", &chunk);
                        let raw = match Envelope::Data(chunk).encode() {
                            Ok(raw) => raw,
                            Err(e) => break Closed::TunnelError(e.to_string()),
                        };
                        if let Err(e) = sink.send(WsMessage::Binary(raw.to_vec())).await {
                            break Closed::TunnelError(e.to_string());
                        }
                    }
                    Err(e) => break Closed::SocketError(e),
                },
            }
        };

        // CLOSED: report the trigger to the tunnel side while it can still
        // receive, then close both halves together.
        match &closed {
            Closed::SocketClosed => {
                log::info!("session {}: server socket closed", id);
                let _ = send_control(&mut sink, ControlEvent::new(EventKind::Close)).await;
            }
            Closed::SocketError(e) => {
                log::info!("session {}: server socket error: {}", id, e);
                let _ = send_control(&mut sink, socket_error_event(e)).await;
            }
            Closed::Cancelled => {
                log::info!("session {}: cancelled", id);
                let _ = send_control(&mut sink, ControlEvent::new(EventKind::Close)).await;
            }
            Closed::TunnelClosed => log::info!("session {}: tunnel closed", id),
            Closed::TunnelError(e) => log::info!("session {}: tunnel error: {}", id, e),
            Closed::Violation(e) => log::info!("session {}: protocol violation: {}", id, e),
        }

        let _ = target_write.shutdown().await;
        drop(target_write);
        drop(target_read);
        let _ = sink.close().await;
    }
}

/// Bound relay, ready to accept tunnel connections.
pub struct RelayListener {
    relay: Arc<Relay>,
    listener: TcpListener,
}

impl RelayListener {
    /// The address actually bound, for `:0` listens.
    pub fn local_addr(&self) -> Result<SocketAddr, SockbridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the relay for accounting and shutdown.
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Accept tunnel connections until the listener fails. Each session
    /// runs on its own task with its own real socket.
    pub async fn run(self) -> Result<(), SockbridgeError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let relay = Arc::clone(&self.relay);
            tokio::spawn(relay.handle_connection(stream, peer));
        }
    }
}

/// Per-session diagnostic decoding with a cap on logged failures.
struct Diagnostics<'a> {
    session: SessionId,
    decoder: &'a dyn WireDecoder,
    failures: u32,
    limit: u32,
}

impl<'a> Diagnostics<'a> {
    fn new(session: SessionId, decoder: &'a dyn WireDecoder, limit: u32) -> Self {
        Self {
            session,
            decoder,
            failures: 0,
            limit,
        }
    }

    /// Best-effort decode of one relayed chunk. Never fails the caller.
    fn inspect(&mut self, direction: &str, bytes: &[u8]) {
        match self.decoder.decode(bytes) {
            Ok(summary) => {
                log::debug!("session {}: {} {}", self.session, direction, summary);
            }
            Err(e) => {
                self.failures += 1;
                if self.failures <= self.limit {
                    log::debug!(
                        "session {}: {} chunk of {} bytes not decoded: {}",
                        self.session,
                        direction,
                        bytes.len(),
                        e
                    );
                } else if self.failures == self.limit + 1 {
                    log::debug!(
                        "session {}: further decode failures suppressed",
                        self.session
                    );
                }
            }
        }
    }
}

fn socket_error_event(e: &std::io::Error) -> ControlEvent {
    let kind = match e.kind() {
        std::io::ErrorKind::TimedOut => EventKind::Timeout,
        // TLS record and framing failures surface as InvalidData
        std::io::ErrorKind::InvalidData => EventKind::ParseError,
        _ => EventKind::Error,
    };
    ControlEvent::with_detail(kind, e.to_string())
}

async fn send_control<S>(tunnel: &mut S, event: ControlEvent) -> Result<(), SockbridgeError>
where
    S: Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let raw = Envelope::Control(event).encode()?;
    tunnel
        .send(WsMessage::Binary(raw.to_vec()))
        .await
        .map_err(|e| SockbridgeError::Tunnel(e.to_string()))
}

fn build_connector(config: &RelayConfig) -> Result<TlsConnector, SockbridgeError> {
    let mut roots = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        log::warn!("native trust root skipped: {}", error);
    }
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            log::warn!("native trust root rejected: {}", e);
        }
    }

    if let Some(path) = &config.extra_ca {
        for cert in read_pem_certs(path)? {
            roots.add(cert).map_err(|e| {
                SockbridgeError::InvalidConfig(format!(
                    "bad CA certificate in {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let client_config = match config.client_identity() {
        Some((cert_path, key_path)) => {
            let certs = read_pem_certs(&cert_path)?;
            let key = read_pem_key(&key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| SockbridgeError::InvalidConfig(e.to_string()))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SockbridgeError> {
    let file = std::fs::File::open(path)
        .map_err(|e| SockbridgeError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SockbridgeError::InvalidConfig(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(SockbridgeError::InvalidConfig(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_pem_key(path: &Path) -> Result<PrivateKeyDer<'static>, SockbridgeError> {
    let file = std::fs::File::open(path)
        .map_err(|e| SockbridgeError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| SockbridgeError::InvalidConfig(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| {
            SockbridgeError::InvalidConfig(format!("{}: no private key found", path.display()))
        })
}
