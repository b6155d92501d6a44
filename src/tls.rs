//! TLS policy wrapper for the emulated socket
//!
//! Not a cryptographic implementation: connecting here only marks the
//! descriptor as requiring transport security. Certificate validation and
//! handshake negotiation happen on the relay, which the sandboxed caller
//! trusts; no certificate material ever reaches this side.

use tokio::sync::mpsc;

use crate::config::ProxyTarget;
use crate::envelope::ConnectionDescriptor;
use crate::socket::{ClientSocket, SocketEvent};
use crate::SockbridgeError;

/// Equivalent to [`ClientSocket::connect`] with the descriptor's `tls`
/// flag set. A `SecureConnect` event replaces `Connect` once the relay
/// completes the handshake.
pub async fn connect(
    descriptor: ConnectionDescriptor,
    target: &ProxyTarget,
) -> Result<(ClientSocket, mpsc::UnboundedReceiver<SocketEvent>), SockbridgeError> {
    ClientSocket::connect(descriptor.with_tls(), target).await
}
