//! Prometheus metrics for SpanStore.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, status.
pub const HTTP_REQUESTS_TOTAL: &str = "spanstore_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "spanstore_http_request_duration_seconds";

/// Total gateway data operations (counter). Labels: operation, location.
pub const GATEWAY_OPERATIONS_TOTAL: &str = "spanstore_gateway_operations_total";

/// Total replication (backbeat) requests (counter). Labels: operation.
pub const REPLICATION_REQUESTS_TOTAL: &str = "spanstore_replication_requests_total";

/// Total bytes received in request bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "spanstore_bytes_received_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to
/// call multiple times (e.g. in tests). Returns the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once
/// after `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        GATEWAY_OPERATIONS_TOTAL,
        "Total gateway data operations by type and location"
    );
    describe_counter!(
        REPLICATION_REQUESTS_TOTAL,
        "Total replication surface requests by operation"
    );
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes received in request bodies");
}

/// Record one gateway data operation.
pub fn record_gateway_op(operation: &'static str, location: &str) {
    counter!(GATEWAY_OPERATIONS_TOTAL, "operation" => operation, "location" => location.to_string())
        .increment(1);
}

/// Record one replication surface request.
pub fn record_replication_op(operation: &'static str) {
    counter!(REPLICATION_REQUESTS_TOTAL, "operation" => operation).increment(1);
}

// -- Middleware and endpoint --------------------------------------------------

/// Tower middleware recording RED metrics for every request.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().as_str().to_string();
    let body_size = req
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();
    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method).record(elapsed);
    if body_size > 0 {
        counter!(BYTES_RECEIVED_TOTAL).increment(body_size);
    }

    response
}

/// `GET /metrics` -- Prometheus exposition endpoint.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let a = init_metrics() as *const PrometheusHandle;
        let b = init_metrics() as *const PrometheusHandle;
        assert_eq!(a, b);
    }

    #[test]
    fn test_record_ops_do_not_panic() {
        init_metrics();
        describe_metrics();
        record_gateway_op("put", "mem-a");
        record_replication_op("putobject");
    }
}
