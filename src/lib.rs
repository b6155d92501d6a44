//! Sockbridge: Socket-over-Tunnel Bridge
//!
//! Sockbridge lets a database wire-protocol driver that expects direct
//! TCP/TLS socket access run inside a sandboxed host with no raw socket
//! capability. All traffic is tunnelled through a WebSocket channel to a
//! trusted relay process that holds the real socket.
//!
//! ## Components
//!
//! - **Emulated socket**: TCP/TLS-like stream semantics over the tunnel
//!   ([`ClientSocket`], [`tls::connect`])
//! - **Relay**: terminates tunnel sessions, opens the real TCP/TLS socket,
//!   forwards frames bidirectionally ([`Relay`])
//! - **Resolver**: SRV/TXT lookups over DNS-over-HTTPS ([`Resolver`])
//! - **Envelope**: tagged, length-prefixed tunnel wire format
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use sockbridge::{ClientSocket, ConnectionDescriptor, ProxyTarget, SocketEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sockbridge::SockbridgeError> {
//!     let target = ProxyTarget::from_env();
//!     let descriptor = ConnectionDescriptor::new("db.example.com", 27017);
//!     let (socket, mut events) = ClientSocket::connect(descriptor, &target).await?;
//!
//!     socket.write(&b"..."[..])?;
//!     while let Some(event) = events.recv().await {
//!         if let SocketEvent::Data(bytes) = event {
//!             println!("received {} bytes", bytes.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Run the relay
//! sockbridge relay --bind 0.0.0.0:1337
//!
//! # Debug a DNS seed-list lookup
//! sockbridge resolve --record srv _db._tcp.cluster0.example.com
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  envelopes   ┌────────────┐  TCP / TLS  ┌────────────┐
//! │  Sandboxed │─────────────▶│ Sockbridge │────────────▶│  Database  │
//! │   Driver   │◀─────────────│   Relay    │◀────────────│   Server   │
//! └────────────┘  WebSocket   └────────────┘             └────────────┘
//!        │                           │
//!        │ SRV/TXT                   │ diagnostics
//!        ▼                           ▼
//! ┌────────────┐              ┌────────────┐
//! │  DoH       │              │  Wire      │
//! │  Resolver  │              │  Decoder   │
//! └────────────┘              └────────────┘
//! ```

pub mod config;
pub mod decode;
pub mod envelope;
pub mod relay;
pub mod resolver;
pub mod socket;
pub mod tls;

// Re-export core types
pub use config::{DohConfig, ProxyTarget, RelayConfig};
pub use decode::{DecodeError, HeaderDecoder, WireDecoder};
pub use envelope::{ConnectionDescriptor, ControlEvent, Envelope, EventKind};
pub use relay::{Relay, RelayListener, SessionId};
pub use resolver::{Resolver, SrvRecord};
pub use socket::{ClientSocket, SocketEvent};

/// Sockbridge error types
#[derive(Debug, thiserror::Error)]
pub enum SockbridgeError {
    /// Malformed tunnel envelope
    #[error("Invalid envelope: {0}")]
    Envelope(String),

    /// Session-level protocol violation
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// DNS-over-HTTPS lookup failure
    #[error("DNS query failed: {0}")]
    Dns(String),

    /// Tunnel channel failure
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
