// =============================================================================
// Nucleon Matrix Federation Server - Server-Server API Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-10-19
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Matrix Server-Server API routes served to remote homeservers. The
//   transaction ingress endpoint lives here; request-signature checks
//   happen in the federation auth layer in front of these handlers, so
//   the parsed X-Matrix origin is trusted to be authenticated.
//
// =============================================================================

use axum::{
    body::Bytes,
    extract::Path,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use ruma::{OwnedServerName, OwnedTransactionId, ServerName};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::service::federation::TxnOutcome;
use crate::{services, Error, Result};

/// Mount the federation routes served to remote homeservers.
pub fn federation_router() -> Router {
    Router::new()
        .route(
            "/_matrix/federation/v1/send/:txn_id",
            put(send_transaction_message_route),
        )
        .route(
            "/_matrix/federation/v1/version",
            get(get_server_version_route),
        )
}

/// # `PUT /_matrix/federation/v1/send/{txnId}`
///
/// Receive a transaction of PDUs and EDUs from a remote homeserver. The
/// response is 200 with a per-PDU result map even when individual PDUs
/// fail; only envelope-level protocol violations reject the whole
/// transaction.
pub async fn send_transaction_message_route(
    Path(txn_id): Path<OwnedTransactionId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let origin = match parse_x_matrix_origin(&headers) {
        Ok(origin) => origin,
        Err(e) => {
            debug!("Rejecting transaction {txn_id:?}: {e}");
            return e.into_response();
        }
    };

    // The guard cancels the token if the sending server goes away while
    // we still hold the request; queued work that has not started yet is
    // then expired instead of processed.
    let cancelled = CancellationToken::new();
    let _request_scope = cancelled.clone().drop_guard();

    let outcome = services()
        .federation
        .receive_transaction(origin, txn_id, body.to_vec(), cancelled)
        .await;

    match outcome {
        TxnOutcome::Processed(results) => (StatusCode::OK, Json(&*results)).into_response(),
        TxnOutcome::Accepted => StatusCode::ACCEPTED.into_response(),
        TxnOutcome::TimedOut => StatusCode::REQUEST_TIMEOUT.into_response(),
        TxnOutcome::Rejected(e) => e.into_response(),
    }
}

/// # `GET /_matrix/federation/v1/version`
///
/// Server implementation name and version.
pub async fn get_server_version_route() -> impl IntoResponse {
    Json(serde_json::json!({
        "server": {
            "name": "Nucleon",
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

/// Extract the origin server from an `X-Matrix` Authorization header.
fn parse_x_matrix_origin(headers: &HeaderMap) -> Result<OwnedServerName> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Unauthorized("Missing Authorization header".to_owned()))?;

    let params = header
        .strip_prefix("X-Matrix ")
        .ok_or_else(|| Error::Unauthorized("Authorization scheme is not X-Matrix".to_owned()))?;

    for param in params.split(',') {
        if let Some(value) = param.trim().strip_prefix("origin=") {
            let value = value.trim_matches('"');
            return ServerName::parse(value)
                .map_err(|e| Error::Unauthorized(format!("Invalid X-Matrix origin: {e}")));
        }
    }
    Err(Error::Unauthorized(
        "X-Matrix header carries no origin".to_owned(),
    ))
}
