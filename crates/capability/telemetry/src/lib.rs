//! 追踪初始化、trace ID 生成与进程级计数器。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt};

/// 计数器快照（`GET /metrics` 的响应体）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub points_received: u64,
    pub points_published: u64,
    pub dropped_unknown: u64,
    pub dropped_unchanged: u64,
    pub dropped_conversion: u64,
    pub send_success: u64,
    pub send_failure: u64,
    pub script_failures: u64,
    pub online_edges: u64,
    pub offline_edges: u64,
}

/// 网关计数器。
#[derive(Default)]
pub struct TelemetryMetrics {
    points_received: AtomicU64,
    points_published: AtomicU64,
    dropped_unknown: AtomicU64,
    dropped_unchanged: AtomicU64,
    dropped_conversion: AtomicU64,
    send_success: AtomicU64,
    send_failure: AtomicU64,
    script_failures: AtomicU64,
    online_edges: AtomicU64,
    offline_edges: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            points_received: self.points_received.load(Ordering::Relaxed),
            points_published: self.points_published.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
            dropped_unchanged: self.dropped_unchanged.load(Ordering::Relaxed),
            dropped_conversion: self.dropped_conversion.load(Ordering::Relaxed),
            send_success: self.send_success.load(Ordering::Relaxed),
            send_failure: self.send_failure.load(Ordering::Relaxed),
            script_failures: self.script_failures.load(Ordering::Relaxed),
            online_edges: self.online_edges.load(Ordering::Relaxed),
            offline_edges: self.offline_edges.load(Ordering::Relaxed),
        }
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（`RUST_LOG` 未设置时为 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 上游未携带 `x-trace-id` 时为请求生成新的 trace_id。
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 记录流水线收到的点位数。
pub fn record_points_received(count: u64) {
    metrics()
        .points_received
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录上报的点位数。
pub fn record_points_published(count: u64) {
    metrics()
        .points_published
        .fetch_add(count, Ordering::Relaxed);
}

/// 点位未在注册表中声明。
pub fn record_dropped_unknown() {
    metrics().dropped_unknown.fetch_add(1, Ordering::Relaxed);
}

/// 值与影子相同。
pub fn record_dropped_unchanged() {
    metrics().dropped_unchanged.fetch_add(1, Ordering::Relaxed);
}

/// 值无法转换为点位类型。
pub fn record_dropped_conversion() {
    metrics()
        .dropped_conversion
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_send_success() {
    metrics().send_success.fetch_add(1, Ordering::Relaxed);
}

pub fn record_send_failure() {
    metrics().send_failure.fetch_add(1, Ordering::Relaxed);
}

/// 记录脚本调用失败次数。
pub fn record_script_failure() {
    metrics().script_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录一次上下线边沿。
pub fn record_online_edge(online: bool) {
    let counter = if online {
        &metrics().online_edges
    } else {
        &metrics().offline_edges
    };
    counter.fetch_add(1, Ordering::Relaxed);
}
