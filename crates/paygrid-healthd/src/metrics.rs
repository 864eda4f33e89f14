use prometheus::{
    register_histogram, register_int_counter_vec, Encoder, Histogram, IntCounterVec, TextEncoder,
};
use std::sync::LazyLock;

pub static PROBES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygrid_healthd_probes_total",
        "Facilitator probes by classified status",
        &["status"]
    )
    .unwrap()
});

pub static BATCH_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygrid_healthd_batches_total",
        "Poll batch runs by result",
        &["result"]
    )
    .unwrap()
});

pub static BATCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "paygrid_healthd_batch_duration_seconds",
        "Wall-clock duration of one poll batch",
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
