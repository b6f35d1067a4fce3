use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, opts, register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

trait ResultExt<T> {
    fn or_exit(self, context: &str) -> T;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn or_exit(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                eprintln!("failed to initialize metric ({context}): {err}");
                std::process::exit(1);
            }
        }
    }
}

pub static CONNECTIONS_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        opts!(
            "tlslisten_connections_accepted_total",
            "Raw TCP connections accepted by listening sockets"
        ),
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static HANDSHAKES_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        opts!(
            "tlslisten_handshakes_completed_total",
            "TLS handshakes that completed and were handed to the consumer"
        ),
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static HANDSHAKE_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        opts!(
            "tlslisten_handshake_failures_total",
            "Failed TLS handshakes by error kind"
        ),
        &["reason"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static NUDGE_ATTEMPTS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        opts!(
            "tlslisten_nudge_attempts_total",
            "Zero-length writes issued to advance pending handshakes"
        ),
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static HANDSHAKE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram_with_registry!(
        HistogramOpts::new(
            "tlslisten_handshake_duration_seconds",
            "Time from accept to completed TLS handshake in seconds"
        ),
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static HANDSHAKES_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        opts!(
            "tlslisten_handshakes_in_flight",
            "Accepted connections whose handshake has not finished"
        ),
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static TLS_INFO: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!(
            "tlslisten_tls_info",
            "Negotiated TLS parameters (version, cipher) - value is always 1"
        ),
        &["version", "cipher"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static IDENTITY_REGENERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        opts!(
            "tlslisten_identity_generations_total",
            "Self-signed identities generated, by reason (missing, invalid)"
        ),
        &["name", "reason"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static IDENTITY_EXPIRY_DAYS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!(
            "tlslisten_identity_expiry_days",
            "Days until the server identity certificate expires (negative if expired)"
        ),
        &["name"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

/// Encode all metrics in the Prometheus text format
///
/// # Errors
///
/// Returns an error if the metrics cannot be encoded
pub fn encode_metrics() -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| format!("could not encode custom metrics: {e}"))?;
    Ok(buffer)
}
