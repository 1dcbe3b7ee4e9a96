//! Prometheus metrics for the realtime backbone
//!
//! Registered lazily in the default registry and rendered by `GET /metrics`.

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static::lazy_static! {
    /// Live transport connections held by the registry
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "realtime_connections_active",
        "Live WebSocket connections"
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Message send requests by outcome (new/duplicate)
    pub static ref MESSAGES_SENT: IntCounterVec = register_int_counter_vec!(
        "realtime_messages_sent_total",
        "Message send requests by outcome",
        &["outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Delivery record transitions by target state
    pub static ref DELIVERY_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "realtime_delivery_transitions_total",
        "Delivery record transitions by target state",
        &["state"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Pushed or queued messages still waiting for a device ack
    pub static ref QUEUED_DELIVERIES: IntGauge = register_int_gauge!(
        "realtime_queued_deliveries",
        "Message deliveries awaiting a device acknowledgement"
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Calls not yet ended
    pub static ref CALLS_ACTIVE: IntGauge = register_int_gauge!(
        "realtime_calls_active",
        "Call sessions not yet ended"
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Ended calls by end reason
    pub static ref CALLS_ENDED: IntCounterVec = register_int_counter_vec!(
        "realtime_calls_ended_total",
        "Ended calls by reason",
        &["reason"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Participants whose quality label dropped to poor
    pub static ref QUALITY_DEGRADED: IntCounter = register_int_counter!(
        "realtime_call_quality_degraded_total",
        "Transitions of a participant's quality label into poor"
    ).expect("Prometheus metrics registration should succeed at startup");
}

/// Render every registered metric in the text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
