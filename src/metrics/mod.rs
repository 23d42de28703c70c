use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::task_local;

use crate::constants;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn requests_code_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("marquee_requests_code_total", "Total processed requests"),
            &["protocol", "code"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_lookups_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("marquee_segment_lookups_total", "Segment cache lookups"),
            &["result"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_admissions_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("marquee_segment_admissions_total", "Segment admission decisions"),
            &["result"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_evictions_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("marquee_segment_evictions_total", "Segments evicted for space").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_resident_bytes() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge =
            IntGauge::new("marquee_segment_resident_bytes", "Bytes held by the segment cache").unwrap();
        registry().register(Box::new(gauge.clone())).unwrap();
        gauge
    })
}

fn init_metrics() {
    let _ = cache_evictions_total();
    let _ = cache_resident_bytes();
    for code in ["200", "206", "304", "404", "416", "500"] {
        requests_code_total()
            .with_label_values(&["HTTP/1.1", code])
            .inc_by(0);
    }
    for result in ["hit", "miss"] {
        cache_lookups_total().with_label_values(&[result]).inc_by(0);
    }
}

pub fn record(status: StatusCode) {
    init_metrics();
    let code = status.as_u16().to_string();
    let protocol = current_protocol().unwrap_or_else(|| "HTTP/1.1".to_string());
    requests_code_total()
        .with_label_values(&[protocol.as_str(), code.as_str()])
        .inc();
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    cache_lookups_total().with_label_values(&[result]).inc();
}

pub fn record_admission(result: &str) {
    cache_admissions_total().with_label_values(&[result]).inc();
}

pub fn record_evictions(count: usize) {
    cache_evictions_total().inc_by(count as u64);
}

pub fn set_resident_bytes(bytes: u64) {
    cache_resident_bytes().set(i64::try_from(bytes).unwrap_or(i64::MAX));
}

pub fn render() -> String {
    init_metrics();
    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

task_local! {
    static REQUEST_PROTOCOL: String;
}

pub async fn with_request_context<F, T>(protocol: String, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    REQUEST_PROTOCOL.scope(protocol, fut).await
}

fn current_protocol() -> Option<String> {
    REQUEST_PROTOCOL.try_with(|protocol| protocol.clone()).ok()
}
