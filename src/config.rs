//! Sockbridge configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Tunnel listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Client certificate (PEM) offered on outbound TLS connections.
    /// When set, every session is opened over TLS regardless of the
    /// descriptor's `tls` flag.
    pub cert: Option<PathBuf>,

    /// Private key (PEM) for `cert`. Falls back to the `cert` file when
    /// absent, for combined cert+key bundles.
    pub key: Option<PathBuf>,

    /// Additional CA certificates (PEM) appended to the native trust roots
    pub extra_ca: Option<PathBuf>,

    /// Upper bound on opening the real socket, reported as a `timeout`
    /// event when exceeded
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Per-session cap on logged diagnostic decode failures
    #[serde(default = "default_decode_failure_log_limit")]
    pub decode_failure_log_limit: u32,
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:1337".parse().unwrap()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_decode_failure_log_limit() -> u32 {
    16
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cert: None,
            key: None,
            extra_ca: None,
            connect_timeout: default_connect_timeout(),
            decode_failure_log_limit: default_decode_failure_log_limit(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_some() && self.cert.is_none() {
            return Err("key requires cert to be set".to_string());
        }

        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be non-zero".to_string());
        }

        Ok(())
    }

    /// Outbound client identity as (certificate, key) paths. The key
    /// defaults to the certificate file.
    pub fn client_identity(&self) -> Option<(PathBuf, PathBuf)> {
        self.cert.as_ref().map(|cert| {
            let key = self.key.clone().unwrap_or_else(|| cert.clone());
            (cert.clone(), key)
        })
    }
}

/// Client-side tunnel target: which relay instance to tunnel through.
///
/// Constructed once at startup and threaded explicitly into every connect
/// call; there is no process-wide mutable default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    /// Use a secure (wss) tunnel
    pub secure: bool,

    /// Relay host
    pub host: String,

    /// Relay port
    pub port: u16,
}

impl Default for ProxyTarget {
    fn default() -> Self {
        Self {
            secure: false,
            host: "127.0.0.1".to_string(),
            port: 1337,
        }
    }
}

impl ProxyTarget {
    /// Read the target from `SOCKBRIDGE_SECURE`, `SOCKBRIDGE_HOST` and
    /// `SOCKBRIDGE_PORT`, defaulting any unset field.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            secure: lookup("SOCKBRIDGE_SECURE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.secure),
            host: lookup("SOCKBRIDGE_HOST").unwrap_or(defaults.host),
            port: lookup("SOCKBRIDGE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    /// Tunnel URL for this target
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// DNS-over-HTTPS resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DohConfig {
    /// RFC 8484 endpoint accepting `application/dns-message` POSTs
    pub endpoint: String,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://cloudflare-dns.com/dns-query".to_string(),
        }
    }
}
