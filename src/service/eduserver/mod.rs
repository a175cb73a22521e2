// =============================================================================
// Nucleon Matrix Federation Server - EDU Server API Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-21
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Internal API surface of the EDU server as seen from the federation
//   ingress: typing notifications, send-to-device messages, read receipts
//   and cross-signing key updates. Ephemeral data never touches the room
//   DAG, so these calls bypass the per-room serialization entirely.
//
// =============================================================================

use async_trait::async_trait;
use axum::Router;
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, UInt};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;
use std::sync::Arc;

use crate::api::internal::{make_rpc_api, RpcClient};
use crate::Result;

pub const EDUSERVER_INPUT_TYPING_PATH: &str = "/eduserver/inputTypingEvent";
pub const EDUSERVER_INPUT_SEND_TO_DEVICE_PATH: &str = "/eduserver/inputSendToDeviceEvent";
pub const EDUSERVER_INPUT_RECEIPT_PATH: &str = "/eduserver/inputReceiptEvent";
pub const EDUSERVER_INPUT_CROSS_SIGNING_PATH: &str = "/eduserver/inputCrossSigningKeyUpdate";

#[derive(Debug, Serialize, Deserialize)]
pub struct InputTypingEventRequest {
    pub user_id: OwnedUserId,
    pub room_id: OwnedRoomId,
    pub typing: bool,
    /// How long the typing notice stays valid, in milliseconds.
    pub timeout_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InputTypingEventResponse {}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputSendToDeviceEventRequest {
    pub sender: OwnedUserId,
    pub user_id: OwnedUserId,
    pub device_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: Box<RawJsonValue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InputSendToDeviceEventResponse {}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputReceiptEventRequest {
    pub user_id: OwnedUserId,
    pub room_id: OwnedRoomId,
    pub event_id: OwnedEventId,
    #[serde(rename = "type")]
    pub receipt_type: String,
    pub timestamp: UInt,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InputReceiptEventResponse {}

/// A cross-signing key update as delivered by `m.signing_key_update`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CrossSigningKeyUpdate {
    pub user_id: OwnedUserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<Box<RawJsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signing_key: Option<Box<RawJsonValue>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputCrossSigningKeyUpdateRequest {
    pub update: CrossSigningKeyUpdate,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InputCrossSigningKeyUpdateResponse {}

/// The EDU server operations the federation ingress dispatches to.
#[async_trait]
pub trait EduServerApi: Send + Sync {
    async fn input_typing_event(
        &self,
        request: InputTypingEventRequest,
    ) -> Result<InputTypingEventResponse>;

    async fn input_send_to_device_event(
        &self,
        request: InputSendToDeviceEventRequest,
    ) -> Result<InputSendToDeviceEventResponse>;

    async fn input_receipt_event(
        &self,
        request: InputReceiptEventRequest,
    ) -> Result<InputReceiptEventResponse>;

    async fn input_cross_signing_key_update(
        &self,
        request: InputCrossSigningKeyUpdateRequest,
    ) -> Result<InputCrossSigningKeyUpdateResponse>;
}

/// HTTP client for the EDU server's internal API.
#[derive(Debug, Clone)]
pub struct HttpEduServerClient {
    input_typing: RpcClient,
    input_send_to_device: RpcClient,
    input_receipt: RpcClient,
    input_cross_signing: RpcClient,
}

impl HttpEduServerClient {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            input_typing: RpcClient::new(
                "InputTypingEvent",
                format!("{base_url}{EDUSERVER_INPUT_TYPING_PATH}"),
                client.clone(),
            ),
            input_send_to_device: RpcClient::new(
                "InputSendToDeviceEvent",
                format!("{base_url}{EDUSERVER_INPUT_SEND_TO_DEVICE_PATH}"),
                client.clone(),
            ),
            input_receipt: RpcClient::new(
                "InputReceiptEvent",
                format!("{base_url}{EDUSERVER_INPUT_RECEIPT_PATH}"),
                client.clone(),
            ),
            input_cross_signing: RpcClient::new(
                "InputCrossSigningKeyUpdate",
                format!("{base_url}{EDUSERVER_INPUT_CROSS_SIGNING_PATH}"),
                client,
            ),
        }
    }
}

#[async_trait]
impl EduServerApi for HttpEduServerClient {
    async fn input_typing_event(
        &self,
        request: InputTypingEventRequest,
    ) -> Result<InputTypingEventResponse> {
        self.input_typing.call(&request).await
    }

    async fn input_send_to_device_event(
        &self,
        request: InputSendToDeviceEventRequest,
    ) -> Result<InputSendToDeviceEventResponse> {
        self.input_send_to_device.call(&request).await
    }

    async fn input_receipt_event(
        &self,
        request: InputReceiptEventRequest,
    ) -> Result<InputReceiptEventResponse> {
        self.input_receipt.call(&request).await
    }

    async fn input_cross_signing_key_update(
        &self,
        request: InputCrossSigningKeyUpdateRequest,
    ) -> Result<InputCrossSigningKeyUpdateResponse> {
        self.input_cross_signing.call(&request).await
    }
}

/// Mount the EDU server API handlers on an internal router.
pub fn add_routes(api: Arc<dyn EduServerApi>, router: Router) -> Router {
    let typing_api = api.clone();
    let send_to_device_api = api.clone();
    let receipt_api = api.clone();
    let cross_signing_api = api;
    router
        .route(
            EDUSERVER_INPUT_TYPING_PATH,
            make_rpc_api("InputTypingEvent", move |request| {
                let api = typing_api.clone();
                async move { api.input_typing_event(request).await }
            }),
        )
        .route(
            EDUSERVER_INPUT_SEND_TO_DEVICE_PATH,
            make_rpc_api("InputSendToDeviceEvent", move |request| {
                let api = send_to_device_api.clone();
                async move { api.input_send_to_device_event(request).await }
            }),
        )
        .route(
            EDUSERVER_INPUT_RECEIPT_PATH,
            make_rpc_api("InputReceiptEvent", move |request| {
                let api = receipt_api.clone();
                async move { api.input_receipt_event(request).await }
            }),
        )
        .route(
            EDUSERVER_INPUT_CROSS_SIGNING_PATH,
            make_rpc_api("InputCrossSigningKeyUpdate", move |request| {
                let api = cross_signing_api.clone();
                async move { api.input_cross_signing_key_update(request).await }
            }),
        )
}
