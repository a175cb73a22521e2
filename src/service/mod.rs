// =============================================================================
// Nucleon Matrix Federation Server - Service Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-02
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Central service container. Each service owns one slice of the
//   federation ingress; the container wires them to the downstream
//   component APIs, which reach the other processes over the internal
//   RPC transport.
//
// =============================================================================

use std::sync::Arc;

pub mod eduserver;
pub mod federation;
pub mod globals;
pub mod keyserver;
pub mod pdu;
pub mod roomserver;

use eduserver::{EduServerApi, HttpEduServerClient};
use keyserver::{HttpKeyServerClient, KeyServerApi};
use roomserver::{HttpRoomserverClient, RoomserverApi};

use crate::{Config, Result};

/// Central service container for the federation ingress.
pub struct Services {
    pub globals: globals::Service,
    pub federation: Arc<federation::Service>,
}

impl Services {
    /// Wire the services against the internal HTTP APIs named in the
    /// configuration.
    pub fn build(config: Config) -> Result<Self> {
        let globals = globals::Service::load(config)?;
        let client = globals.internal_client();
        let internal = &globals.config.internal_api;

        let roomserver: Arc<dyn RoomserverApi> = Arc::new(HttpRoomserverClient::new(
            &internal.roomserver_url,
            client.clone(),
        ));
        let eduserver: Arc<dyn EduServerApi> = Arc::new(HttpEduServerClient::new(
            &internal.eduserver_url,
            client.clone(),
        ));
        let keyserver: Arc<dyn KeyServerApi> =
            Arc::new(HttpKeyServerClient::new(&internal.keyserver_url, client));

        Self::with_apis(globals, roomserver, eduserver, keyserver)
    }

    /// Wire the services against in-process API implementations. Used by
    /// tests and monolith deployments.
    pub fn with_apis(
        globals: globals::Service,
        roomserver: Arc<dyn RoomserverApi>,
        eduserver: Arc<dyn EduServerApi>,
        keyserver: Arc<dyn KeyServerApi>,
    ) -> Result<Self> {
        let federation = federation::Service::build(
            globals.config.server_name.clone(),
            roomserver,
            eduserver,
            keyserver,
        );

        Ok(Self {
            globals,
            federation,
        })
    }
}
