//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files and
//! every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen addresses of the built-in servers.
    pub listen: ListenConfig,

    /// In-process RPC channel settings.
    pub loopback: LoopbackConfig,

    /// Settings shared by the external and internal HTTP servers.
    pub http: HttpConfig,
}

/// Listen addresses. `host:port`, `:port` for every interface, or empty to
/// disable the server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub grpc: String,
    pub http: String,
    pub internal_grpc: String,
    pub internal_http: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            grpc: ":9090".to_string(),
            http: ":8080".to_string(),
            internal_grpc: "localhost:19090".to_string(),
            internal_http: "localhost:18080".to_string(),
        }
    }
}

impl ListenConfig {
    /// `(field, address)` pairs in registration order.
    pub fn entries(&self) -> [(&'static str, &str); 4] {
        [
            ("grpc", &self.grpc),
            ("http", &self.http),
            ("internal_grpc", &self.internal_grpc),
            ("internal_http", &self.internal_http),
        ]
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopbackConfig {
    /// How long a loopback dial waits for the server to accept.
    pub dial_timeout_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    /// Upper bound on waiting for in-flight requests during shutdown.
    /// Unset waits as long as they take.
    pub drain_timeout_secs: Option<u64>,

    /// Emit a span per request.
    pub trace_requests: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: None,
            trace_requests: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen.grpc, ":9090");
        assert_eq!(config.listen.internal_http, "localhost:18080");
        assert_eq!(config.loopback.dial_timeout_ms, 5_000);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [listen]
            http = "127.0.0.1:8081"
            internal_grpc = ""

            [http]
            drain_timeout_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.http, "127.0.0.1:8081");
        assert_eq!(config.listen.grpc, ":9090");
        assert!(config.listen.internal_grpc.is_empty());
        assert_eq!(config.http.drain_timeout_secs, Some(10));
        assert!(config.http.trace_requests);
    }
}
