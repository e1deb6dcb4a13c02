//! Metrics collection and exposition.
//!
//! # Metrics
//! - `account_http_requests_total` (counter): requests by method, route, status
//! - `account_http_request_duration_seconds` (histogram): latency
//! - `account_breaker_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `account_breaker_transitions_total` (counter): transitions by target state
//! - `account_config_refresh_total` (counter): refresh events by outcome
//! - `account_shutdown_steps_total` (counter): cleanup steps by outcome
//! - `account_spans_dropped_total` (counter): spans discarded on a full export queue

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus exporter with its own HTTP listener.
/// Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_request(method: &str, route: &str, status: u16, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];
    counter!("account_http_requests_total", &labels[..]).increment(1);
    histogram!("account_http_request_duration_seconds", &labels[..2])
        .record(start.elapsed().as_secs_f64());
}

/// Set the state gauge without counting a transition.
pub fn set_breaker_state(dependency: &str, state: CircuitState) {
    let level = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("account_breaker_state", "dependency" => dependency.to_string()).set(level);
}

pub fn record_breaker_transition(dependency: &str, state: CircuitState) {
    set_breaker_state(dependency, state);
    counter!(
        "account_breaker_transitions_total",
        "dependency" => dependency.to_string(),
        "state" => state.as_str()
    )
    .increment(1);
}

pub fn record_config_refresh(outcome: &'static str) {
    counter!("account_config_refresh_total", "outcome" => outcome).increment(1);
}

pub fn record_shutdown_step(step: &'static str, outcome: &'static str) {
    counter!("account_shutdown_steps_total", "step" => step, "outcome" => outcome).increment(1);
}

pub fn record_span_dropped() {
    counter!("account_spans_dropped_total").increment(1);
}
