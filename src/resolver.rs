//! SRV/TXT resolution over DNS-over-HTTPS
//!
//! The sandboxed host cannot issue raw UDP/TCP DNS queries, so seed-list
//! lookups go over an RFC 8484 HTTP transport instead. Queries are built
//! and responses parsed with `hickory-proto`; no resolver machinery, no
//! caching, no retries. A transport or RCODE failure surfaces as a single
//! error and retry policy stays with the caller.

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::config::DohConfig;
use crate::SockbridgeError;

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    /// Target host, with the trailing root dot stripped
    pub name: String,
    /// Target port
    pub port: u16,
    /// Record priority
    pub priority: u16,
    /// Record weight
    pub weight: u16,
}

/// SRV/TXT resolver over an RFC 8484 endpoint.
#[derive(Debug, Clone)]
pub struct Resolver {
    http: reqwest::Client,
    endpoint: String,
}

impl Resolver {
    /// Create a resolver against the configured endpoint.
    pub fn new(config: &DohConfig) -> Result<Self, SockbridgeError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SockbridgeError::Dns(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
        })
    }

    /// Look up SRV records for `hostname`.
    pub async fn resolve_srv(&self, hostname: &str) -> Result<Vec<SrvRecord>, SockbridgeError> {
        let response = self.query(hostname, RecordType::SRV).await?;
        Ok(srv_records(&response))
    }

    /// Look up TXT records for `hostname`. Each answer is the record's
    /// list of character strings.
    pub async fn resolve_txt(&self, hostname: &str) -> Result<Vec<Vec<String>>, SockbridgeError> {
        let response = self.query(hostname, RecordType::TXT).await?;
        Ok(txt_records(&response))
    }

    /// Callback-style SRV lookup for callers expecting that convention.
    /// The callback runs on a spawned task.
    pub fn resolve_srv_cb<F>(&self, hostname: &str, callback: F)
    where
        F: FnOnce(Result<Vec<SrvRecord>, SockbridgeError>) + Send + 'static,
    {
        let resolver = self.clone();
        let hostname = hostname.to_string();
        tokio::spawn(async move {
            callback(resolver.resolve_srv(&hostname).await);
        });
    }

    /// Callback-style TXT lookup. The callback runs on a spawned task.
    pub fn resolve_txt_cb<F>(&self, hostname: &str, callback: F)
    where
        F: FnOnce(Result<Vec<Vec<String>>, SockbridgeError>) + Send + 'static,
    {
        let resolver = self.clone();
        let hostname = hostname.to_string();
        tokio::spawn(async move {
            callback(resolver.resolve_txt(&hostname).await);
        });
    }

    async fn query(
        &self,
        hostname: &str,
        record_type: RecordType,
    ) -> Result<Message, SockbridgeError> {
        let name = Name::from_utf8(hostname)
            .map_err(|e| SockbridgeError::Dns(format!("bad hostname {}: {}", hostname, e)))?;

        let mut message = Message::new();
        message
            .set_id(0)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, record_type));

        let body = message
            .to_vec()
            .map_err(|e| SockbridgeError::Dns(e.to_string()))?;

        log::debug!(
            "DoH {} query for {} ({} bytes)",
            record_type,
            hostname,
            body.len()
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(body)
            .send()
            .await
            .map_err(|e| SockbridgeError::Dns(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SockbridgeError::Dns(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SockbridgeError::Dns(e.to_string()))?;

        let parsed = Message::from_vec(&bytes)
            .map_err(|e| SockbridgeError::Dns(format!("bad response message: {}", e)))?;

        if parsed.response_code() != ResponseCode::NoError {
            return Err(SockbridgeError::Dns(format!(
                "{} query for {} failed: {}",
                record_type,
                hostname,
                parsed.response_code()
            )));
        }

        log::debug!(
            "DoH {} query for {}: {} answers",
            record_type,
            hostname,
            parsed.answer_count()
        );

        Ok(parsed)
    }
}

fn srv_records(message: &Message) -> Vec<SrvRecord> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::SRV(srv)) => Some(SrvRecord {
                name: trim_root(&srv.target().to_utf8()),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            }),
            _ => None,
        })
        .collect()
}

fn txt_records(message: &Message) -> Vec<Vec<String>> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::TXT(txt)) => Some(
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn trim_root(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_string()
}
