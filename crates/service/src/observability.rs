use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec, TextEncoder};

// Prometheus metrics (default registry)
pub static STORE_READS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lambda_persistence_store_reads_total",
        "Total row reads issued to the backing store"
    )
    .expect("register store_reads_total")
});

pub static STORE_WRITES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lambda_persistence_store_writes_total",
        "Total full-row writes issued to the backing store"
    )
    .expect("register store_writes_total")
});

pub static STORE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lambda_persistence_store_errors_total",
        "Total failed store calls by operation",
        &["operation"]
    )
    .expect("register store_errors_total")
});

pub static TABLES_CREATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lambda_persistence_tables_created_total",
        "Total tables auto-provisioned by this process"
    )
    .expect("register tables_created_total")
});

pub fn record_error(operation: &str) {
    STORE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

/// Render the default registry in the Prometheus text format.
pub fn encode_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("metrics encode error: {e}"))?;
    String::from_utf8(buffer).map_err(|e| format!("metrics encode error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_encoded_output() {
        STORE_WRITES_TOTAL.inc();
        record_error("put_row");
        let text = encode_metrics().unwrap();
        assert!(text.contains("lambda_persistence_store_writes_total"));
        assert!(text.contains("operation=\"put_row\""));
    }
}
