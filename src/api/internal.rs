// =============================================================================
// Nucleon Matrix Federation Server - Internal RPC Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-14
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Thin typed request/response layer over loopback HTTP+JSON, used for
//   RPC between Nucleon components (federation ingress, roomserver, EDU
//   server, key server). The transport has no retry and no timeout of its
//   own; callers bound each call with their own deadline.
//
// =============================================================================

use axum::{
    body::Bytes,
    http::StatusCode,
    response::IntoResponse,
    routing::{post, MethodRouter},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, info_span, Instrument};

use crate::{Error, Result};

/// Error relayed on behalf of a remote federation endpoint. Carries an
/// HTTP-status-like code so the ultimate caller can reproduce the remote
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("remote responded with {code}: {err}")]
pub struct FederationClientError {
    pub code: u16,
    pub err: String,
}

/// Wire envelope of the proxy RPC flavor: exactly one of `response` or
/// `error` is present.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyEnvelope<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FederationClientError>,
}

/// Build a POST handler for an internal RPC operation.
///
/// The request body is decoded as JSON into `Req`; a decode failure is
/// answered with HTTP 400 and the decode error, a handler error with HTTP
/// 500 and the error string, and success with the serialized `Res` at 200.
pub fn make_rpc_api<Req, Res, F, Fut>(name: &'static str, f: F) -> MethodRouter
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Res>> + Send + 'static,
{
    post(move |body: Bytes| {
        let f = f.clone();
        async move {
            let request: Req = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(e) => {
                    debug!(rpc = name, "Failed to decode internal RPC request: {e}");
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({ "error": e.to_string() })),
                    )
                        .into_response();
                }
            };
            match f(request).await {
                Ok(response) => match serde_json::to_value(&response) {
                    Ok(value) => (StatusCode::OK, Json(value)).into_response(),
                    Err(e) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({ "error": e.to_string() })),
                    )
                        .into_response(),
                },
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response(),
            }
        }
        .instrument(info_span!("internal_rpc", rpc = name))
    })
}

/// Build a POST handler for a proxied federation operation.
///
/// Semantics match [`make_rpc_api`], except the handler's error is a
/// [`FederationClientError`] which is wrapped into the reply envelope at
/// HTTP 200 so the status-like code survives the hop intact.
pub fn make_proxy_api<Req, Res, F, Fut>(name: &'static str, f: F) -> MethodRouter
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Res, FederationClientError>> + Send + 'static,
{
    post(move |body: Bytes| {
        let f = f.clone();
        async move {
            let request: Req = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(e) => {
                    debug!(rpc = name, "Failed to decode internal proxy request: {e}");
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({ "error": e.to_string() })),
                    )
                        .into_response();
                }
            };
            let envelope = match f(request).await {
                Ok(response) => ProxyEnvelope {
                    response: Some(response),
                    error: None,
                },
                Err(e) => ProxyEnvelope {
                    response: None,
                    error: Some(e),
                },
            };
            match serde_json::to_value(&envelope) {
                Ok(value) => (StatusCode::OK, Json(value)).into_response(),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response(),
            }
        }
        .instrument(info_span!("internal_rpc", rpc = name))
    })
}

/// Client half of the internal RPC transport: one named operation bound to
/// one URL, sharing a pooled HTTP client.
#[derive(Debug, Clone)]
pub struct RpcClient {
    name: &'static str,
    url: String,
    client: reqwest::Client,
}

impl RpcClient {
    pub fn new(name: &'static str, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name,
            url: url.into(),
            client,
        }
    }

    /// Perform one RPC-flavored call: POST the request as JSON, decode the
    /// 200 response as `Res`.
    pub async fn call<Req, Res>(&self, request: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        async {
            let response = self
                .client
                .post(&self.url)
                .json(request)
                .send()
                .await
                .map_err(|e| Error::Rpc(self.name, e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                let message = body
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_owned();
                return Err(Error::BadServerResponse(format!(
                    "{} answered {status}: {message}",
                    self.name
                )));
            }

            response
                .json()
                .await
                .map_err(|e| Error::Rpc(self.name, e.to_string()))
        }
        .instrument(info_span!("internal_rpc_call", rpc = self.name))
        .await
    }

    /// Perform one proxy-flavored call and unwrap the reply envelope.
    pub async fn call_proxy<Req, Res>(&self, request: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let envelope: ProxyEnvelope<Res> = self.call(request).await?;
        if let Some(e) = envelope.error {
            return Err(Error::FederationClient {
                code: e.code,
                err: e.err,
            });
        }
        envelope.response.ok_or_else(|| {
            Error::BadServerResponse(format!("{} returned an empty proxy envelope", self.name))
        })
    }
}
