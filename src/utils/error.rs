use axum::{response::IntoResponse, Json};
use thiserror::Error;
use std::io;

/// Nucleon global error type
#[derive(Debug, Error)]
pub enum Error {
    /// The request body was not valid JSON at all.
    #[error("Not JSON: {0}")]
    NotJson(String),

    /// The request body was JSON, but violated a protocol rule (canonical
    /// JSON, transaction size limits, malformed event structure).
    #[error("Bad JSON: {0}")]
    BadJson(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The roomserver refused the event during auth checks.
    #[error("Event not allowed: {0}")]
    EventNotAllowed(String),

    /// The originating request was cancelled before the work started.
    #[error("Request expired before processing started")]
    RequestExpired,

    /// An event took longer than the processing deadline.
    #[error("Event processing deadline exceeded")]
    ProcessingDeadlineExceeded,

    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    /// Internal RPC call failed in transit.
    #[error("RPC call {0} failed: {1}")]
    Rpc(&'static str, String),

    /// A downstream internal API answered with an error envelope.
    #[error("Bad server response: {0}")]
    BadServerResponse(String),

    /// An error relayed on behalf of a remote federation endpoint.
    #[error("Federation client error {code}: {err}")]
    FederationClient { code: u16, err: String },

    #[error("Bad configuration: {0}")]
    BadConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn bad_config(msg: &str) -> Self {
        Error::BadConfig(msg.to_owned())
    }

    /// Matrix error code for the client-facing JSON body.
    pub fn errcode(&self) -> &'static str {
        match self {
            Error::NotJson(_) => "M_NOT_JSON",
            Error::BadJson(_) => "M_BAD_JSON",
            Error::Unauthorized(_) => "M_UNAUTHORIZED",
            Error::Forbidden(_) | Error::EventNotAllowed(_) => "M_FORBIDDEN",
            _ => "M_UNKNOWN",
        }
    }

    fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotJson(_) | Error::BadJson(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) | Error::EventNotAllowed(_) => StatusCode::FORBIDDEN,
            Error::RequestExpired => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "errcode": self.errcode(),
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Nucleon global result type
pub type Result<T> = std::result::Result<T, Error>;
