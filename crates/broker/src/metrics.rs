use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static SESSIONS_OPENED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RECORD_BATCHES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RECORDS_REPLAYED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static REJECTED_FILTERS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static CATALOG_QUERIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "tributary_broker_http_requests_total",
                    "Broker HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create tributary_broker_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "tributary_broker_http_request_duration_seconds",
                    "Broker HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create tributary_broker_http_request_duration_seconds"),
        )
    })
}

fn sessions_opened_total() -> &'static IntCounterVec {
    SESSIONS_OPENED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "tributary_broker_sessions_opened_total",
                    "Contribution sessions opened, by commit mode.",
                ),
                &["mode"],
            )
            .expect("create tributary_broker_sessions_opened_total"),
        )
    })
}

fn record_batches_total() -> &'static IntCounterVec {
    RECORD_BATCHES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "tributary_broker_record_batches_total",
                    "Accepted record batches, by action.",
                ),
                &["action"],
            )
            .expect("create tributary_broker_record_batches_total"),
        )
    })
}

fn records_replayed_total() -> &'static IntCounter {
    RECORDS_REPLAYED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "tributary_broker_records_replayed_total",
                "Operation-log entries replayed into the catalog at close.",
            )
            .expect("create tributary_broker_records_replayed_total"),
        )
    })
}

fn rejected_filters_total() -> &'static IntCounter {
    REJECTED_FILTERS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "tributary_broker_rejected_filters_total",
                "Query filters rejected by the translator.",
            )
            .expect("create tributary_broker_rejected_filters_total"),
        )
    })
}

fn catalog_queries_total() -> &'static IntCounter {
    CATALOG_QUERIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "tributary_broker_catalog_queries_total",
                "Catalog queries executed.",
            )
            .expect("create tributary_broker_catalog_queries_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_session_opened(mode: &str) {
    sessions_opened_total().with_label_values(&[mode]).inc();
}

pub fn observe_record_batch(action: &str) {
    record_batches_total().with_label_values(&[action]).inc();
}

pub fn observe_records_replayed(count: u64) {
    records_replayed_total().inc_by(count);
}

pub fn inc_rejected_filter() {
    rejected_filters_total().inc();
}

pub fn inc_catalog_query() {
    catalog_queries_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
