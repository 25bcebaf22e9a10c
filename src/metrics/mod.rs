//! Prometheus collectors of the multi-version store.
//!
//! Collectors are process-wide; [`gather_metrics`] renders the crate registry in
//! the Prometheus text exposition format for the embedding server to expose.


use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;

lazy_static! {
    pub static ref KEYS_GAUGE: IntGauge =
        IntGauge::with_opts(Opts::new("mvcc_keys_total", "Total number of live keys."))
            .expect("metric can not be created");

    pub static ref WATCH_STREAM_GAUGE: IntGauge = IntGauge::with_opts(Opts::new(
        "mvcc_watch_stream_total",
        "Total number of open watch streams."
    ))
    .expect("metric can not be created");

    pub static ref WATCHER_GAUGE: IntGauge =
        IntGauge::with_opts(Opts::new("mvcc_watcher_total", "Total number of watchers."))
            .expect("metric can not be created");

    pub static ref SLOW_WATCHER_GAUGE: IntGauge = IntGauge::with_opts(Opts::new(
        "mvcc_slow_watcher_total",
        "Total number of unsynced slow watchers."
    ))
    .expect("metric can not be created");

    pub static ref PENDING_EVENTS_COUNTER: IntCounter = IntCounter::with_opts(Opts::new(
        "mvcc_pending_events_total",
        "Total number of pending events to be sent."
    ))
    .expect("metric can not be created");

    pub static ref RANGE_COUNTER: IntCounter =
        IntCounter::with_opts(Opts::new("mvcc_range_total", "Total number of ranges seen."))
            .expect("metric can not be created");

    pub static ref PUT_COUNTER: IntCounter =
        IntCounter::with_opts(Opts::new("mvcc_put_total", "Total number of puts seen."))
            .expect("metric can not be created");

    pub static ref DELETE_COUNTER: IntCounter = IntCounter::with_opts(Opts::new(
        "mvcc_delete_total",
        "Total number of deletes seen."
    ))
    .expect("metric can not be created");

    pub static ref COMPACTED_KEYS_COUNTER: IntCounter = IntCounter::with_opts(Opts::new(
        "mvcc_db_compaction_keys_total",
        "Total number of db keys compacted."
    ))
    .expect("metric can not be created");

    pub static ref BACKEND_COMMIT_COUNTER: IntCounter = IntCounter::with_opts(Opts::new(
        "mvcc_backend_commits_total",
        "Total number of backend buffer commits."
    ))
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();

    static ref DEFAULT_REGISTRATION: () = register_custom_metrics(&REGISTRY);
}

pub fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(KEYS_GAUGE.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_STREAM_GAUGE.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCHER_GAUGE.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SLOW_WATCHER_GAUGE.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PENDING_EVENTS_COUNTER.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(RANGE_COUNTER.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PUT_COUNTER.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(DELETE_COUNTER.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(COMPACTED_KEYS_COUNTER.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(BACKEND_COMMIT_COUNTER.clone()))
        .expect("collector can be registered");
}

/// Export the crate registry for Prometheus to scrape
pub fn gather_metrics() -> String {
    lazy_static::initialize(&DEFAULT_REGISTRATION);

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode custom metrics: {}", e);
    }
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            warn!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
