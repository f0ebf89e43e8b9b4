//! 探针与指标端点

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use cart_shared::kafka::ConsumerState;
use cart_shared::observability::metrics;

use crate::state::AppState;

/// 存活探针：服务进程正常即返回 ok
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": state.service_name,
    }))
}

/// 就绪探针：检查 Redis 连接与消费者状态
///
/// 消费者已停止（致命错误）时视为未就绪。
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let redis_ok = state.store.health_check().await.is_ok();
    let consumer = state.consumer_state.as_ref().map(|rx| *rx.borrow());
    let consumer_ok = consumer != Some(ConsumerState::Stopped);
    let all_ok = redis_ok && consumer_ok;

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": if all_ok { "ok" } else { "degraded" },
        "service": state.service_name,
        "checks": {
            "redis": if redis_ok { "ok" } else { "fail" },
            "consumer": consumer.map_or_else(|| "disabled".to_string(), |s| s.to_string()),
        }
    });
    (status, Json(body))
}

/// Prometheus 文本格式指标
pub async fn metrics_handler() -> Response {
    match metrics::render() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
