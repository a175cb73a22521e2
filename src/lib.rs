// =============================================================================
// Nucleon Matrix Federation Server - Library Crate
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-02
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Core library for the Nucleon federation server: the transaction
//   ingress, per-room event serialization, EDU dispatch and the internal
//   RPC plumbing towards the roomserver, EDU server and key server.
//
// =============================================================================

use std::sync::OnceLock;

pub mod api;
pub mod config;
pub mod metrics;
pub mod service;
pub mod utils;

// Re-export common types
pub use ruma;
pub use tokio;
pub use tracing;

pub use config::Config;
pub use service::pdu::PduEvent;
pub use service::Services;
pub use utils::error::{Error, Result};

/// Global services instance
static SERVICES: OnceLock<Services> = OnceLock::new();

/// Service dependencies and global state
pub fn services() -> &'static Services {
    SERVICES.get().expect("Services not initialized")
}

/// Initialize global services. Must happen exactly once, before any
/// request is served.
pub fn init_services(services: Services) {
    if SERVICES.set(services).is_err() {
        panic!("Services already initialized");
    }
}
