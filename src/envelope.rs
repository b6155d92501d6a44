//! Tunnel wire format
//!
//! Every message on the tunnel channel is exactly one envelope: a one-byte
//! tag, a big-endian u32 payload length, then the payload. The tag makes
//! control-plane signaling and application payload unambiguous on a shared
//! channel; payload content is never inspected to classify a message.
//!
//! ```text
//! ┌─────┬─────────────┬──────────────────┐
//! │ tag │ len (u32 BE)│ payload (len B)  │
//! └─────┴─────────────┴──────────────────┘
//! ```
//!
//! Three tags exist. The descriptor is the first message of every session,
//! sent exactly once by the client. Control events flow relay→client only.
//! Data frames flow both ways and are relayed byte-for-byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::SockbridgeError;

/// Envelope header size: tag byte plus payload length.
pub const HEADER_LEN: usize = 5;

const TAG_DESCRIPTOR: u8 = 0x01;
const TAG_CONTROL: u8 = 0x02;
const TAG_DATA: u8 = 0x03;

/// Connection parameters, sent once as the first message of a session.
///
/// Consumed exactly once by the relay to open the real socket. Immutable
/// after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Target host name or address
    pub host: String,

    /// Target port
    pub port: u16,

    /// Whether the relay should open a TLS connection
    #[serde(default)]
    pub tls: bool,

    /// TLS server name, when it differs from `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servername: Option<String>,
}

impl ConnectionDescriptor {
    /// Create a plain TCP descriptor.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            servername: None,
        }
    }

    /// Mark the descriptor as requiring transport security.
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Set an explicit TLS server name.
    pub fn with_servername(mut self, servername: impl Into<String>) -> Self {
        self.servername = Some(servername.into());
        self
    }

    /// The name used for TLS server-name validation: `servername` if
    /// present, else `host`.
    pub fn tls_server_name(&self) -> &str {
        self.servername.as_deref().unwrap_or(&self.host)
    }
}

/// Socket lifecycle event, produced only by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Connect,
    SecureConnect,
    Close,
    Error,
    Timeout,
    ParseError,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Connect => write!(f, "connect"),
            EventKind::SecureConnect => write!(f, "secureConnect"),
            EventKind::Close => write!(f, "close"),
            EventKind::Error => write!(f, "error"),
            EventKind::Timeout => write!(f, "timeout"),
            EventKind::ParseError => write!(f, "parseError"),
        }
    }
}

/// Relay-to-client lifecycle signal standing in for a native socket event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    /// Event kind
    pub evt: EventKind,

    /// Optional human-readable cause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ControlEvent {
    /// Event without detail.
    pub fn new(evt: EventKind) -> Self {
        Self { evt, detail: None }
    }

    /// Event carrying a cause string.
    pub fn with_detail(evt: EventKind, detail: impl Into<String>) -> Self {
        Self {
            evt,
            detail: Some(detail.into()),
        }
    }
}

/// One tunnel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Connection parameters, first message of a session (client→relay)
    Descriptor(ConnectionDescriptor),
    /// Lifecycle signal (relay→client)
    Control(ControlEvent),
    /// Opaque application payload (either direction)
    Data(Bytes),
}

impl Envelope {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Bytes, SockbridgeError> {
        let (tag, payload) = match self {
            Envelope::Descriptor(descriptor) => {
                let body = serde_json::to_vec(descriptor)
                    .map_err(|e| SockbridgeError::Envelope(e.to_string()))?;
                (TAG_DESCRIPTOR, Bytes::from(body))
            }
            Envelope::Control(event) => {
                let body = serde_json::to_vec(event)
                    .map_err(|e| SockbridgeError::Envelope(e.to_string()))?;
                (TAG_CONTROL, Bytes::from(body))
            }
            Envelope::Data(bytes) => (TAG_DATA, bytes.clone()),
        };

        if payload.len() > u32::MAX as usize {
            return Err(SockbridgeError::Envelope(format!(
                "payload of {} bytes exceeds envelope limit",
                payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(tag);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Parse one wire message. The message must contain exactly one
    /// envelope; trailing bytes are an error.
    pub fn decode(mut raw: Bytes) -> Result<Self, SockbridgeError> {
        if raw.len() < HEADER_LEN {
            return Err(SockbridgeError::Envelope(format!(
                "truncated header: {} bytes",
                raw.len()
            )));
        }

        let tag = raw.get_u8();
        let len = raw.get_u32() as usize;
        if raw.len() != len {
            return Err(SockbridgeError::Envelope(format!(
                "length mismatch: header says {} bytes, message carries {}",
                len,
                raw.len()
            )));
        }

        match tag {
            TAG_DESCRIPTOR => {
                let descriptor = serde_json::from_slice(&raw)
                    .map_err(|e| SockbridgeError::Envelope(format!("bad descriptor: {}", e)))?;
                Ok(Envelope::Descriptor(descriptor))
            }
            TAG_CONTROL => {
                let event = serde_json::from_slice(&raw)
                    .map_err(|e| SockbridgeError::Envelope(format!("bad control event: {}", e)))?;
                Ok(Envelope::Control(event))
            }
            TAG_DATA => Ok(Envelope::Data(raw)),
            other => Err(SockbridgeError::Envelope(format!(
                "unknown tag 0x{:02x}",
                other
            ))),
        }
    }
}
