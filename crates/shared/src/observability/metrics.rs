//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集。
//! 不单独起端口，由服务在自己的路由上挂载 `/metrics`，调用 [`render`] 输出文本格式。

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 安装全局 recorder 并注册指标描述
///
/// 同一进程内重复调用时复用已安装的 recorder。
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle);

    register_common_metrics(&config.service_name);
    Ok(())
}

/// 注册指标描述，出现在 `/metrics` 的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    metrics::describe_counter!(
        "cart_operations_total",
        "Total number of cart store operations"
    );
    metrics::describe_counter!(
        "cart_version_conflicts_total",
        "Optimistic concurrency conflicts observed by the cart store"
    );

    metrics::describe_counter!(
        "consumer_messages_total",
        "Messages handled by the consumer group"
    );
    metrics::describe_counter!(
        "consumer_rebalances_total",
        "Consumer group sessions re-established after a rebalance"
    );
    metrics::describe_counter!(
        "consumer_dead_letters_total",
        "Messages written to the dead-letter topic"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 渲染当前指标快照，未初始化时返回 None
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录 HTTP 请求
#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录购物车存储操作结果
#[inline]
pub fn record_cart_operation(operation: &'static str, outcome: &'static str) {
    metrics::counter!(
        "cart_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

/// 记录一次乐观并发冲突
#[inline]
pub fn record_version_conflict(operation: &'static str) {
    metrics::counter!("cart_version_conflicts_total", "operation" => operation).increment(1);
}

/// 记录消费结果：success / dead_lettered / failed
#[inline]
pub fn record_consumed_message(topic: &str, outcome: &'static str) {
    metrics::counter!(
        "consumer_messages_total",
        "topic" => topic.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

#[inline]
pub fn record_rebalance() {
    metrics::counter!("consumer_rebalances_total").increment(1);
}

#[inline]
pub fn record_dead_letter(source_topic: &str) {
    metrics::counter!(
        "consumer_dead_letters_total",
        "topic" => source_topic.to_string()
    )
    .increment(1);
}
