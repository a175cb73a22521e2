// =============================================================================
// Nucleon Matrix Federation Server - Roomserver API Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-21
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Internal API surface of the roomserver as seen from the federation
//   ingress: room protocol-version lookup, server-ACL queries and event
//   input. The roomserver itself runs in another process; this module
//   carries the trait, the wire types, the HTTP client and the route
//   table for the server side.
//
// =============================================================================

use async_trait::async_trait;
use axum::Router;
use ruma::{OwnedRoomId, OwnedServerName, RoomVersionId};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;
use std::sync::Arc;

use crate::api::internal::{make_rpc_api, RpcClient};
use crate::Result;

pub const ROOMSERVER_QUERY_ROOM_VERSION_PATH: &str = "/roomserver/queryRoomVersionForRoom";
pub const ROOMSERVER_QUERY_SERVER_BANNED_PATH: &str = "/roomserver/queryServerBannedFromRoom";
pub const ROOMSERVER_INPUT_ROOM_EVENTS_PATH: &str = "/roomserver/inputRoomEvents";

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRoomVersionForRoomRequest {
    pub room_id: OwnedRoomId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRoomVersionForRoomResponse {
    pub room_version: RoomVersionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryServerBannedFromRoomRequest {
    pub server_name: OwnedServerName,
    pub room_id: OwnedRoomId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryServerBannedFromRoomResponse {
    pub banned: bool,
}

/// How an input event should be treated by the roomserver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// A regular new event that must pass auth checks.
    New,
    /// An event stored outside the room DAG, exempt from auth.
    Outlier,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputRoomEvent {
    pub kind: InputKind,
    pub room_version: RoomVersionId,
    /// Full canonical event JSON.
    pub event: Box<RawJsonValue>,
    pub origin: OwnedServerName,
    #[serde(default)]
    pub send_to_other_servers: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputRoomEventsRequest {
    pub input_room_events: Vec<InputRoomEvent>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InputRoomEventsResponse {
    /// Set when the roomserver failed to process the events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Set when the events failed the roomserver's auth checks.
    #[serde(default)]
    pub not_allowed: bool,
}

/// The subset of the roomserver's internal API the federation ingress
/// requires. Useful for testing.
#[async_trait]
pub trait RoomserverApi: Send + Sync {
    async fn query_room_version_for_room(
        &self,
        request: QueryRoomVersionForRoomRequest,
    ) -> Result<QueryRoomVersionForRoomResponse>;

    async fn query_server_banned_from_room(
        &self,
        request: QueryServerBannedFromRoomRequest,
    ) -> Result<QueryServerBannedFromRoomResponse>;

    async fn input_room_events(
        &self,
        request: InputRoomEventsRequest,
    ) -> Result<InputRoomEventsResponse>;
}

/// HTTP client for the roomserver's internal API.
#[derive(Debug, Clone)]
pub struct HttpRoomserverClient {
    query_room_version: RpcClient,
    query_server_banned: RpcClient,
    input_room_events: RpcClient,
}

impl HttpRoomserverClient {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            query_room_version: RpcClient::new(
                "QueryRoomVersionForRoom",
                format!("{base_url}{ROOMSERVER_QUERY_ROOM_VERSION_PATH}"),
                client.clone(),
            ),
            query_server_banned: RpcClient::new(
                "QueryServerBannedFromRoom",
                format!("{base_url}{ROOMSERVER_QUERY_SERVER_BANNED_PATH}"),
                client.clone(),
            ),
            input_room_events: RpcClient::new(
                "InputRoomEvents",
                format!("{base_url}{ROOMSERVER_INPUT_ROOM_EVENTS_PATH}"),
                client,
            ),
        }
    }
}

#[async_trait]
impl RoomserverApi for HttpRoomserverClient {
    async fn query_room_version_for_room(
        &self,
        request: QueryRoomVersionForRoomRequest,
    ) -> Result<QueryRoomVersionForRoomResponse> {
        self.query_room_version.call(&request).await
    }

    async fn query_server_banned_from_room(
        &self,
        request: QueryServerBannedFromRoomRequest,
    ) -> Result<QueryServerBannedFromRoomResponse> {
        self.query_server_banned.call(&request).await
    }

    async fn input_room_events(
        &self,
        request: InputRoomEventsRequest,
    ) -> Result<InputRoomEventsResponse> {
        self.input_room_events.call(&request).await
    }
}

/// Mount the roomserver API handlers on an internal router.
pub fn add_routes(api: Arc<dyn RoomserverApi>, router: Router) -> Router {
    let version_api = api.clone();
    let banned_api = api.clone();
    let input_api = api;
    router
        .route(
            ROOMSERVER_QUERY_ROOM_VERSION_PATH,
            make_rpc_api("QueryRoomVersionForRoom", move |request| {
                let api = version_api.clone();
                async move { api.query_room_version_for_room(request).await }
            }),
        )
        .route(
            ROOMSERVER_QUERY_SERVER_BANNED_PATH,
            make_rpc_api("QueryServerBannedFromRoom", move |request| {
                let api = banned_api.clone();
                async move { api.query_server_banned_from_room(request).await }
            }),
        )
        .route(
            ROOMSERVER_INPUT_ROOM_EVENTS_PATH,
            make_rpc_api("InputRoomEvents", move |request| {
                let api = input_api.clone();
                async move { api.input_room_events(request).await }
            }),
        )
}
