use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

lazy_static::lazy_static! {
    pub static ref PAGES_ALLOCATED_TOTAL: IntCounter = register_int_counter!(
        "ivfpage_pages_allocated_total", "Pages appended to the page store"
    ).unwrap();
    pub static ref ATOMIC_WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ivfpage_atomic_writes_total", "Atomic multi-page writes", &["outcome"]
    ).unwrap();
    pub static ref ROWS_INSERTED_TOTAL: IntCounter = register_int_counter!(
        "ivfpage_rows_inserted_total", "Rows appended to lists by the router"
    ).unwrap();
    pub static ref ROWS_SKIPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ivfpage_rows_skipped_total", "Rows not indexed", &["reason"]
    ).unwrap();
    pub static ref SCANS_TOTAL: IntCounter = register_int_counter!(
        "ivfpage_scans_total", "Scans started"
    ).unwrap();
    pub static ref LISTS_PROBED_TOTAL: IntCounter = register_int_counter!(
        "ivfpage_lists_probed_total", "Lists walked by scans"
    ).unwrap();
    pub static ref VACUUM_REMOVED_TOTAL: IntCounter = register_int_counter!(
        "ivfpage_vacuum_removed_total", "Entries removed by vacuum"
    ).unwrap();
    pub static ref BUILD_DURATION: HistogramVec = register_histogram_vec!(
        "ivfpage_build_duration_seconds", "Index build duration by phase",
        &["phase"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();
    pub static ref KMEANS_ITERATIONS: HistogramVec = register_histogram_vec!(
        "ivfpage_kmeans_iterations", "Lloyd iterations until convergence",
        &["outcome"],
        vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&PAGES_ALLOCATED_TOTAL);
    lazy_static::initialize(&ATOMIC_WRITES_TOTAL);
    lazy_static::initialize(&ROWS_INSERTED_TOTAL);
    lazy_static::initialize(&ROWS_SKIPPED_TOTAL);
    lazy_static::initialize(&SCANS_TOTAL);
    lazy_static::initialize(&LISTS_PROBED_TOTAL);
    lazy_static::initialize(&VACUUM_REMOVED_TOTAL);
    lazy_static::initialize(&BUILD_DURATION);
    lazy_static::initialize(&KMEANS_ITERATIONS);
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
