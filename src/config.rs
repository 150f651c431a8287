// Copyright 2020 Joyent, Inc.

//! Client configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;
use crate::protocol::Invocation;

pub mod defaults {
    pub const HOST: &str = "127.0.0.1";

    /// Default Dubbo provider port.
    pub const PORT: u16 = 20880;

    pub const PIPELINE_DEPTH: usize = 1;

    pub const TOTAL_REQUESTS: usize = 1;

    /// Send and receive timeout of the synchronous path.
    pub const TIMEOUT_MS: u64 = 3000;

    /// Consecutive encode failures tolerated before a run is abandoned.
    pub const MAX_ENCODE_FAILURES: u32 = 3;

    pub fn host() -> String {
        String::from(HOST)
    }

    pub fn port() -> u16 {
        PORT
    }

    pub fn pipeline_depth() -> usize {
        PIPELINE_DEPTH
    }

    pub fn total_requests() -> usize {
        TOTAL_REQUESTS
    }

    pub fn timeout_ms() -> u64 {
        TIMEOUT_MS
    }

    pub fn max_encode_failures() -> u32 {
        MAX_ENCODE_FAILURES
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    pub invocation: Invocation,
    #[serde(default = "defaults::pipeline_depth")]
    pub pipeline_depth: usize,
    #[serde(default = "defaults::total_requests")]
    pub total_requests: usize,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    /// Abandon the run after this many reconnects. Unlimited when absent.
    #[serde(default)]
    pub max_reconnects: Option<u32>,
    #[serde(default = "defaults::max_encode_failures")]
    pub max_encode_failures: u32,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, invocation: Invocation) -> ClientConfig {
        ClientConfig {
            host: String::from(host),
            port,
            invocation,
            pipeline_depth: defaults::PIPELINE_DEPTH,
            total_requests: defaults::TOTAL_REQUESTS,
            timeout_ms: defaults::TIMEOUT_MS,
            max_reconnects: None,
            max_encode_failures: defaults::MAX_ENCODE_FAILURES,
        }
    }

    pub fn from_json_str(s: &str) -> Result<ClientConfig, Error> {
        let config: ClientConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.pipeline_depth == 0 {
            return Err(Error::Config(String::from("pipeline depth must be at least 1")));
        }
        if self.total_requests == 0 {
            return Err(Error::Config(String::from("total requests must be at least 1")));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config(String::from("timeout must be non-zero")));
        }
        if self.max_encode_failures == 0 {
            return Err(Error::Config(String::from("max encode failures must be at least 1")));
        }
        if self.invocation.service.is_empty() || self.invocation.method.is_empty() {
            return Err(Error::Config(String::from("service and method are required")));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn resolve(&self) -> Result<SocketAddr, Error> {
        let resolve_err = |reason: String| Error::Resolve {
            host: self.host.clone(),
            reason,
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| resolve_err(e.to_string()))?
            .next()
            .ok_or_else(|| resolve_err(String::from("no addresses found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn defaults_fill_in() {
        let config = ClientConfig::from_json_str(
            r#"{"invocation": {"service": "com.example.Echo", "method": "echo"}}"#,
        )
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 20880);
        assert_eq!(config.pipeline_depth, 1);
        assert_eq!(config.total_requests, 1);
        assert_eq!(config.timeout(), Duration::from_secs(3));
        assert_eq!(config.max_reconnects, None);
        assert_eq!(config.invocation.version, "0.0.0");
    }

    #[test]
    fn explicit_values() {
        let config = ClientConfig::from_json_str(
            &json!({
                "host": "localhost",
                "port": 12345,
                "invocation": {
                    "service": "com.example.Echo",
                    "method": "echo",
                    "args": ["hi", 3],
                    "attachments": {"timeout": "100"}
                },
                "pipeline_depth": 8,
                "total_requests": 1000,
                "max_reconnects": 5
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(config.pipeline_depth, 8);
        assert_eq!(config.invocation.args, vec![json!("hi"), json!(3)]);
        assert_eq!(config.max_reconnects, Some(5));
    }

    #[test]
    fn rejects_zero_counts() {
        let inv = Invocation::new("svc", "m", vec![]);
        let mut config = ClientConfig::new("127.0.0.1", 20880, inv);
        config.pipeline_depth = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.pipeline_depth = 1;
        config.total_requests = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.total_requests = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn resolves_literal_and_rejects_garbage() {
        let inv = Invocation::new("svc", "m", vec![]);
        let config = ClientConfig::new("127.0.0.1", 20880, inv.clone());
        assert_eq!(config.resolve().unwrap(), "127.0.0.1:20880".parse().unwrap());

        let config = ClientConfig::new("no such host.invalid", 20880, inv);
        assert!(matches!(config.resolve(), Err(Error::Resolve { .. })));
    }
}
