use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, TextEncoder, opts, register_histogram, register_int_counter,
};

pub static TOKENS_ISSUED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_tokens_issued_total",
        "Total number of pre-auth tokens minted"
    ))
    .unwrap()
});

pub static VALIDATIONS_PASSED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_validations_passed_total",
        "Total number of post-auth tokens accepted"
    ))
    .unwrap()
});

pub static VALIDATIONS_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_validations_failed_total",
        "Total number of post-auth tokens rejected"
    ))
    .unwrap()
});

pub static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_events_published_total",
        "Total number of decision events published to the broker"
    ))
    .unwrap()
});

pub static PUBLISH_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_publish_failures_total",
        "Total number of event publishes that failed or timed out"
    ))
    .unwrap()
});

pub static EVENTS_CONSUMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_events_consumed_total",
        "Total number of events received and parsed by the consumer"
    ))
    .unwrap()
});

pub static MALFORMED_MESSAGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_malformed_messages_total",
        "Total number of broker messages dropped as unparseable"
    ))
    .unwrap()
});

pub static BATCHES_FLUSHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_batches_flushed_total",
        "Total number of event batches written to the graph store"
    ))
    .unwrap()
});

pub static FLUSH_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "naglfar_flush_failures_total",
        "Total number of failed batch writes (batch retained for retry)"
    ))
    .unwrap()
});

pub static FLUSH_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "naglfar_flush_duration_seconds",
        "Histogram of graph batch write durations"
    )
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
