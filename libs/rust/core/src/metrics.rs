//! Prometheus metric groups for the inference gateway.
//!
//! Families are registered in the default registry on first use so the
//! health server's `/metrics` route exposes them without extra wiring.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

pub struct GatewayMetrics {
    pub requests_total: IntCounterVec,
    pub request_latency_seconds: HistogramVec,
    pub activations_total: IntCounterVec,
    pub endpoint_in_flight: IntGaugeVec,
    pub drain_timeouts_total: IntCounterVec,
}

// Metric names and label sets are static; registration only fails on programmer error.
pub static GATEWAY_METRICS: Lazy<GatewayMetrics> = Lazy::new(|| GatewayMetrics {
    requests_total: register_int_counter_vec!(
        "gateway_requests_total",
        "Prediction requests by model and outcome",
        &["model", "outcome"]
    ).expect("gateway_requests_total"),
    request_latency_seconds: register_histogram_vec!(
        "gateway_request_latency_seconds",
        "Dispatch latency including adapter execution",
        &["model"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).expect("gateway_request_latency_seconds"),
    activations_total: register_int_counter_vec!(
        "gateway_activations_total",
        "Model version activations by outcome",
        &["model", "outcome"]
    ).expect("gateway_activations_total"),
    endpoint_in_flight: register_int_gauge_vec!(
        "gateway_endpoint_in_flight",
        "Predict calls currently executing per model",
        &["model"]
    ).expect("gateway_endpoint_in_flight"),
    drain_timeouts_total: register_int_counter_vec!(
        "gateway_drain_timeouts_total",
        "Endpoints force-terminated after the drain timeout elapsed",
        &["model"]
    ).expect("gateway_drain_timeouts_total"),
});
