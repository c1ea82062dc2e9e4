use std::sync::LazyLock;

use prometheus::*;

static METRIC_COMPARE_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "featuredb_compare_count",
        "count of the vectors compared against a store",
        &["store", "result"]
    )
    .unwrap()
});

static METRIC_COMPARE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "featuredb_compare_duration",
        "duration of the per-vector linear scan in seconds",
        &["store"],
        exponential_buckets(0.00001, 4., 10).unwrap()
    )
    .unwrap()
});

static METRIC_SAVE_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "featuredb_save_count",
        "count of the save attempts grouped by outcome",
        &["store", "result"]
    )
    .unwrap()
});

static METRIC_STORE_SIZE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!("featuredb_store_size", "number of records in a store", &["store"])
        .unwrap()
});

static METRIC_GOSSIP_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "featuredb_gossip_message_count",
        "count of the gossip messages grouped by direction, op and outcome",
        &["direction", "op", "result"]
    )
    .unwrap()
});

/// 记录一次比对及其耗时
pub fn inc_compare(store: &str, matched: bool, duration: f32) {
    let result = if matched { "matched" } else { "missed" };
    METRIC_COMPARE_COUNT.with_label_values(&[store, result]).inc();
    METRIC_COMPARE_DURATION.with_label_values(&[store]).observe(duration as f64);
}

/// 记录一次保存，result 为 saved / capacity / burst / error 之一
pub fn inc_save(store: &str, result: &str) {
    METRIC_SAVE_COUNT.with_label_values(&[store, result]).inc();
}

pub fn set_store_size(store: &str, size: usize) {
    METRIC_STORE_SIZE.with_label_values(&[store]).set(size as i64);
}

/// 记录一条 gossip 消息，direction 为 in / out
pub fn inc_gossip(direction: &str, op: &str, result: &str) {
    METRIC_GOSSIP_COUNT.with_label_values(&[direction, op, result]).inc();
}

/// 以文本格式导出所有指标
pub fn gather_text() -> String {
    let mut buf = String::new();
    if let Err(e) = TextEncoder::new().encode_utf8(&prometheus::gather(), &mut buf) {
        log::error!("导出指标失败: {e}");
    }
    buf
}
