//! Emulated TCP/TLS socket over the tunnel channel
//!
//! [`ClientSocket`] presents stream-like semantics (connect, write, end,
//! destroy, plus lifecycle and data events) to code written against
//! conventional socket APIs, while the actual transport is a WebSocket
//! session to the relay. Lifecycle transitions and data arrive as
//! [`SocketEvent`]s on an unbounded channel; cancellation is one
//! [`CancellationToken`] covering every pending operation of the session.
//!
//! Writes are fire-and-forget: they enqueue a data envelope and return.
//! No flow-control signal crosses back from the tunnel, so a fast writer
//! can outrun a slow receiver's buffering. Known limitation.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Once;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::ProxyTarget;
use crate::envelope::{ConnectionDescriptor, ControlEvent, Envelope, EventKind};
use crate::SockbridgeError;

type Tunnel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Event surfaced by an emulated socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Real socket connected (plain TCP)
    Connect,
    /// Real socket connected and TLS handshake completed
    SecureConnect,
    /// Application bytes from the far endpoint
    Data(Bytes),
    /// Session closed
    Close,
    /// Session failed; one per failure
    Error(String),
    /// Real socket timed out
    Timeout,
    /// Framing-level failure on the real socket
    ParseError,
}

impl From<ControlEvent> for SocketEvent {
    fn from(event: ControlEvent) -> Self {
        match event.evt {
            EventKind::Connect => SocketEvent::Connect,
            EventKind::SecureConnect => SocketEvent::SecureConnect,
            EventKind::Close => SocketEvent::Close,
            EventKind::Error => SocketEvent::Error(
                event
                    .detail
                    .unwrap_or_else(|| "relay reported an error".to_string()),
            ),
            EventKind::Timeout => SocketEvent::Timeout,
            EventKind::ParseError => SocketEvent::ParseError,
        }
    }
}

enum WriteCmd {
    Data(Bytes),
    End,
}

/// Emulated bidirectional byte stream over a tunnel session.
#[derive(Debug)]
pub struct ClientSocket {
    writes: mpsc::UnboundedSender<WriteCmd>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

static INSECURE_TUNNEL_WARNING: Once = Once::new();

impl ClientSocket {
    /// Open a tunnel session to `target` and send `descriptor` as its
    /// first message. Data may be written once this returns; lifecycle
    /// events arrive on the returned channel.
    pub async fn connect(
        descriptor: ConnectionDescriptor,
        target: &ProxyTarget,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SocketEvent>), SockbridgeError> {
        if descriptor.tls && !target.secure {
            INSECURE_TUNNEL_WARNING.call_once(|| {
                log::warn!("descriptor requests tls but the tunnel itself is not secure; use a wss relay target");
            });
        }

        let url = target.url();
        let (mut tunnel, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| SockbridgeError::Tunnel(format!("connect to {} failed: {}", url, e)))?;

        log::debug!(
            "tunnel session open to {}, sending descriptor for {}:{}",
            url,
            descriptor.host,
            descriptor.port
        );

        let first = Envelope::Descriptor(descriptor).encode()?;
        tunnel
            .send(WsMessage::Binary(first.to_vec()))
            .await
            .map_err(|e| SockbridgeError::Tunnel(format!("descriptor send failed: {}", e)))?;

        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session_task(tunnel, writes_rx, events_tx, cancel.clone()));

        Ok((
            Self {
                writes: writes_tx,
                cancel,
                task,
            },
            events_rx,
        ))
    }

    /// Queue bytes for the far endpoint. Fire-and-forget: returns once the
    /// frame is enqueued, with no flow-control signal back.
    pub fn write(&self, bytes: impl Into<Bytes>) -> Result<(), SockbridgeError> {
        self.writes
            .send(WriteCmd::Data(bytes.into()))
            .map_err(|_| SockbridgeError::Tunnel("write on closed session".to_string()))
    }

    /// Graceful teardown: flush queued writes, close the tunnel, wait for
    /// the session task to drain.
    pub async fn end(self) -> Result<(), SockbridgeError> {
        let _ = self.writes.send(WriteCmd::End);
        self.task
            .await
            .map_err(|e| SockbridgeError::Tunnel(format!("session task failed: {}", e)))
    }

    /// Immediate teardown. Queued writes may be dropped.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }
}

async fn session_task(
    tunnel: Tunnel,
    mut writes: mpsc::UnboundedReceiver<WriteCmd>,
    events: mpsc::UnboundedSender<SocketEvent>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = tunnel.split();
    let mut writes_done = false;
    // Exactly one terminal event per session failure: once the relay has
    // delivered close/error/timeout/parseError, the tunnel's own shutdown
    // is not re-reported.
    let mut terminal_seen = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                if !terminal_seen {
                    let _ = events.send(SocketEvent::Close);
                }
                break;
            }

            cmd = writes.recv(), if !writes_done => match cmd {
                Some(WriteCmd::Data(bytes)) => {
                    let raw = match Envelope::Data(bytes).encode() {
                        Ok(raw) => raw,
                        Err(e) => {
                            let _ = events.send(SocketEvent::Error(e.to_string()));
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Binary(raw.to_vec())).await {
                        if !terminal_seen {
                            terminal_seen = true;
                            let _ = events.send(SocketEvent::Error(format!(
                                "tunnel write failed: {}",
                                e
                            )));
                        }
                        break;
                    }
                }
                // End, or every handle dropped: close our side, then keep
                // draining until the relay closes too.
                Some(WriteCmd::End) | None => {
                    writes_done = true;
                    let _ = sink.close().await;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Binary(raw))) => {
                    match Envelope::decode(Bytes::from(raw)) {
                        Ok(Envelope::Data(bytes)) => {
                            let _ = events.send(SocketEvent::Data(bytes));
                        }
                        Ok(Envelope::Control(control)) => {
                            if matches!(
                                control.evt,
                                EventKind::Close
                                    | EventKind::Error
                                    | EventKind::Timeout
                                    | EventKind::ParseError
                            ) {
                                terminal_seen = true;
                            }
                            let _ = events.send(SocketEvent::from(control));
                        }
                        Ok(Envelope::Descriptor(_)) => {
                            let _ = events.send(SocketEvent::Error(
                                "unexpected descriptor from relay".to_string(),
                            ));
                        }
                        Err(e) => {
                            let _ = events.send(SocketEvent::Error(e.to_string()));
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    if !terminal_seen {
                        let _ = events.send(SocketEvent::Close);
                    }
                    break;
                }
                // Pings are answered by the transport; anything else on
                // the tunnel is noise.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    // The real cause cannot cross the channel boundary with
                    // full fidelity; surface one generic error.
                    if !terminal_seen {
                        terminal_seen = true;
                        let _ = events.send(SocketEvent::Error(format!("tunnel failed: {}", e)));
                    }
                    break;
                }
            },
        }
    }
}
