//! Prometheus metrics for the provisioning pipeline

use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, TextEncoder,
};

static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "api_key_service_events_total",
            "Inbound events handled, by processing outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create api_key_service_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register api_key_service_events_total");
    counter
});

static STAGE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "api_key_service_stage_failures_total",
            "Pipeline failures by failing stage",
        ),
        &["stage"],
    )
    .expect("failed to create api_key_service_stage_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register api_key_service_stage_failures_total");
    counter
});

static ORPHANED_MAPPINGS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "api_key_service_orphaned_mappings_total",
            "Mappings published whose profile forward then failed",
        ),
        &["reason"],
    )
    .expect("failed to create api_key_service_orphaned_mappings_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register api_key_service_orphaned_mappings_total");
    counter
});

static QUEUE_DISPOSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "api_key_service_queue_dispositions_total",
            "Inbound deliveries acknowledged or requeued",
        ),
        &["disposition"],
    )
    .expect("failed to create api_key_service_queue_dispositions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register api_key_service_queue_dispositions_total");
    counter
});

static IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::with_opts(Opts::new(
        "api_key_service_in_flight_messages",
        "Deliveries currently being processed",
    ))
    .expect("failed to create api_key_service_in_flight_messages");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register api_key_service_in_flight_messages");
    gauge
});

static CREDENTIAL_GENERATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "api_key_service_credential_generation_seconds",
            "Time to generate and hash a credential",
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
    )
    .expect("failed to create api_key_service_credential_generation_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register api_key_service_credential_generation_seconds");
    histogram
});

static PROFILE_FORWARD_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "api_key_service_profile_forward_seconds",
            "Profile service request latency",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["result"],
    )
    .expect("failed to create api_key_service_profile_forward_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register api_key_service_profile_forward_seconds");
    histogram
});

pub fn record_event_outcome(outcome: &str) {
    EVENTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_stage_failure(stage: &str) {
    STAGE_FAILURES_TOTAL.with_label_values(&[stage]).inc();
}

pub fn record_orphaned_mapping(reason: &str) {
    ORPHANED_MAPPINGS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_disposition(disposition: &str) {
    QUEUE_DISPOSITIONS_TOTAL
        .with_label_values(&[disposition])
        .inc();
}

pub fn in_flight_inc() {
    IN_FLIGHT.inc();
}

pub fn in_flight_dec() {
    IN_FLIGHT.dec();
}

pub fn observe_credential_generation(elapsed: Duration) {
    CREDENTIAL_GENERATION_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn observe_profile_forward(result: &str, elapsed: Duration) {
    PROFILE_FORWARD_SECONDS
        .with_label_values(&[result])
        .observe(elapsed.as_secs_f64());
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
