// =============================================================================
// Nucleon Matrix Federation Server - Configuration Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-02
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Server configuration, loaded from a TOML file merged with NUCLEON_*
//   environment variables. Only the federation ingress and its internal
//   API endpoints are configured here; downstream services carry their
//   own configuration.
//
// =============================================================================

use ruma::OwnedServerName;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Configuration for the Nucleon federation server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// The public server name this homeserver federates as.
    pub server_name: OwnedServerName,

    /// Federation listener address.
    #[serde(default = "default_address")]
    pub address: IpAddr,

    /// Federation listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Tracing filter directives, e.g. "info,nucleon=debug".
    #[serde(default = "default_log")]
    pub log: String,

    /// Whether to expose the Prometheus `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Maximum accepted request body size in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,

    /// Endpoints of the internal component APIs.
    #[serde(default)]
    pub internal_api: InternalApiConfig,
}

/// Base URLs for the internal HTTP RPC surface of each downstream
/// component. These are loopback-only; nothing here is reachable from the
/// federation listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InternalApiConfig {
    #[serde(default = "default_roomserver_url")]
    pub roomserver_url: String,

    #[serde(default = "default_eduserver_url")]
    pub eduserver_url: String,

    #[serde(default = "default_keyserver_url")]
    pub keyserver_url: String,

    /// Connect timeout for internal RPC connections, in milliseconds.
    /// Individual calls carry no RPC-level timeout; callers bound them.
    #[serde(default = "default_internal_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for InternalApiConfig {
    fn default() -> Self {
        Self {
            roomserver_url: default_roomserver_url(),
            eduserver_url: default_eduserver_url(),
            keyserver_url: default_keyserver_url(),
            connect_timeout_ms: default_internal_connect_timeout_ms(),
        }
    }
}

impl Config {
    pub fn warn_deprecated(&self) {
        tracing::info!("Configuration loaded successfully");
    }
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    8448
}

fn default_log() -> String {
    "warn,nucleon=info".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_max_request_size() -> u64 {
    20 * 1024 * 1024
}

fn default_roomserver_url() -> String {
    "http://localhost:7770".to_owned()
}

fn default_eduserver_url() -> String {
    "http://localhost:7778".to_owned()
}

fn default_keyserver_url() -> String {
    "http://localhost:7779".to_owned()
}

fn default_internal_connect_timeout_ms() -> u64 {
    5_000
}
