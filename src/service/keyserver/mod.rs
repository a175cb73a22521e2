// =============================================================================
// Nucleon Matrix Federation Server - Key Server API Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-10-05
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Internal API surface of the key server as seen from the federation
//   ingress. The key server owns signing-key material and therefore both
//   verifies event signatures on our behalf and ingests device-list
//   update EDUs.
//
// =============================================================================

use async_trait::async_trait;
use axum::Router;
use ruma::{OwnedServerName, OwnedUserId, RoomVersionId, UInt};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;
use std::sync::Arc;

use crate::api::internal::{make_rpc_api, RpcClient};
use crate::Result;

pub const KEYSERVER_VERIFY_EVENT_PATH: &str = "/keyserver/verifyEvent";
pub const KEYSERVER_INPUT_DEVICE_LIST_UPDATE_PATH: &str = "/keyserver/inputDeviceListUpdate";

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyEventRequest {
    /// The server whose signature must be present and valid.
    pub origin: OwnedServerName,
    pub room_version: RoomVersionId,
    /// Full canonical event JSON.
    pub event: Box<RawJsonValue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VerifyEventResponse {
    /// Present when verification failed; the string is surfaced to the
    /// sending server in the PDU result map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A device-list update as delivered by `m.device_list_update`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceListUpdateEvent {
    pub user_id: OwnedUserId,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
    pub stream_id: UInt,
    #[serde(default)]
    pub prev_id: Vec<UInt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Box<RawJsonValue>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputDeviceListUpdateRequest {
    pub event: DeviceListUpdateEvent,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InputDeviceListUpdateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The key server operations the federation ingress requires.
#[async_trait]
pub trait KeyServerApi: Send + Sync {
    /// Verify the signatures of an event against the origin's published
    /// signing keys.
    async fn verify_event(&self, request: VerifyEventRequest) -> Result<VerifyEventResponse>;

    async fn input_device_list_update(
        &self,
        request: InputDeviceListUpdateRequest,
    ) -> Result<InputDeviceListUpdateResponse>;
}

/// HTTP client for the key server's internal API.
#[derive(Debug, Clone)]
pub struct HttpKeyServerClient {
    verify_event: RpcClient,
    input_device_list_update: RpcClient,
}

impl HttpKeyServerClient {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            verify_event: RpcClient::new(
                "VerifyEvent",
                format!("{base_url}{KEYSERVER_VERIFY_EVENT_PATH}"),
                client.clone(),
            ),
            input_device_list_update: RpcClient::new(
                "InputDeviceListUpdate",
                format!("{base_url}{KEYSERVER_INPUT_DEVICE_LIST_UPDATE_PATH}"),
                client,
            ),
        }
    }
}

#[async_trait]
impl KeyServerApi for HttpKeyServerClient {
    async fn verify_event(&self, request: VerifyEventRequest) -> Result<VerifyEventResponse> {
        self.verify_event.call(&request).await
    }

    async fn input_device_list_update(
        &self,
        request: InputDeviceListUpdateRequest,
    ) -> Result<InputDeviceListUpdateResponse> {
        self.input_device_list_update.call(&request).await
    }
}

/// Mount the key server API handlers on an internal router.
pub fn add_routes(api: Arc<dyn KeyServerApi>, router: Router) -> Router {
    let verify_api = api.clone();
    let device_list_api = api;
    router
        .route(
            KEYSERVER_VERIFY_EVENT_PATH,
            make_rpc_api("VerifyEvent", move |request| {
                let api = verify_api.clone();
                async move { api.verify_event(request).await }
            }),
        )
        .route(
            KEYSERVER_INPUT_DEVICE_LIST_UPDATE_PATH,
            make_rpc_api("InputDeviceListUpdate", move |request| {
                let api = device_list_api.clone();
                async move { api.input_device_list_update(request).await }
            }),
        )
}
