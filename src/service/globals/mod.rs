// =============================================================================
// Nucleon Matrix Federation Server - Globals Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-02
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Server-wide state: the loaded configuration and the shared HTTP
//   client pool used for loopback RPC to the other components.
//
// =============================================================================

use ruma::ServerName;
use std::time::Duration;

use crate::{Config, Error, Result};

pub struct Service {
    pub config: Config,
    internal_client: reqwest::Client,
}

impl Service {
    pub fn load(config: Config) -> Result<Self> {
        let internal_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.internal_api.connect_timeout_ms))
            .build()
            .map_err(|e| Error::BadConfig(format!("Failed to build internal HTTP client: {e}")))?;

        Ok(Self {
            config,
            internal_client,
        })
    }

    pub fn server_name(&self) -> &ServerName {
        &self.config.server_name
    }

    /// Pooled client for the internal RPC surface. Cheap to clone.
    pub fn internal_client(&self) -> reqwest::Client {
        self.internal_client.clone()
    }

    pub fn max_request_size(&self) -> u64 {
        self.config.max_request_size
    }
}
