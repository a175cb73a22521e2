// Nucleon Matrix Federation Server - Metrics Module
// Author: Nucleon Development Team
// Date: 2025-09-02
// Version: 0.3.0
// Purpose: Prometheus instruments for the federation ingress path

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramOpts,
    HistogramVec, IntCounter, IntCounterVec, Opts, TextEncoder,
};
use tracing::error;

/// Event was passed to the roomserver
pub const METRICS_OUTCOME_OK: &str = "ok";
/// Event failed to be processed
pub const METRICS_OUTCOME_FAIL: &str = "fail";
/// Event failed auth checks
pub const METRICS_OUTCOME_REJECTED: &str = "rejected";
/// Terminated the transaction
pub const METRICS_OUTCOME_FATAL: &str = "fatal";
/// No recovery work was needed for the event
pub const METRICS_WORK_DIRECT: &str = "direct";

/// Prometheus instruments for the federation transaction ingress.
#[derive(Debug)]
pub struct FederationMetrics {
    /// Inbound PDU count, labelled 'total', 'success' or 'expired'.
    pub recv_pdus: IntCounterVec,
    /// Inbound EDU count.
    pub recv_edus: IntCounter,
    /// Per-event processing latency in microseconds, labelled by the kind
    /// of work done and the outcome.
    pub process_event: HistogramVec,
}

impl FederationMetrics {
    fn register() -> prometheus::Result<Self> {
        let recv_pdus = register_int_counter_vec!(
            Opts::new(
                "recv_pdus",
                "Number of incoming PDUs from remote servers with labels for success"
            )
            .namespace("nucleon")
            .subsystem("federationapi"),
            &["status"]
        )?;

        let recv_edus = register_int_counter!(Opts::new(
            "recv_edus",
            "Number of incoming EDUs from remote servers"
        )
        .namespace("nucleon")
        .subsystem("federationapi"))?;

        let process_event = register_histogram_vec!(
            HistogramOpts::new(
                "process_event",
                "How long it takes to process an incoming event and what work had to be done for it"
            )
            .namespace("nucleon")
            .subsystem("federationapi")
            .buckets(vec![
                100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 25_000.0, 50_000.0,
                100_000.0, 250_000.0, 500_000.0, 1_000_000.0, 5_000_000.0,
            ]),
            &["work", "outcome"]
        )?;

        Ok(Self {
            recv_pdus,
            recv_edus,
            process_event,
        })
    }
}

/// Global instrument registry. Registration happens exactly once, on first
/// touch, in the default prometheus registry.
pub static METRICS: Lazy<FederationMetrics> =
    Lazy::new(|| FederationMetrics::register().expect("federation metrics registered once"));

/// Handler for the `/metrics` endpoint (standard Prometheus text format).
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(output) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("Content-Type", "text/plain")],
                format!("Error encoding metrics: {e}"),
            )
                .into_response()
        }
    }
}
