//! 路由配置

use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};

use cart_shared::observability::middleware as obs_middleware;

use crate::handlers::{cart, health};
use crate::state::AppState;

/// 购物车 API 路由
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/cart", post(cart::create_cart))
        .route(
            "/cart/{cart_id}",
            get(cart::get_cart)
                .put(cart::update_cart)
                .delete(cart::delete_cart),
        )
        .route("/cart/{cart_id}/item", post(cart::add_item))
        .route(
            "/cart/{cart_id}/item/{item_id}",
            put(cart::update_item).delete(cart::delete_item),
        )
}

/// 完整应用路由
///
/// `base_path` 为反向代理挂载前缀，为空时挂在根路径。
pub fn build_router(state: AppState, base_path: &str) -> Router {
    let app = Router::new()
        .nest("/api/v1", cart_routes())
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state);

    match normalize_base_path(base_path) {
        Some(prefix) => Router::new().nest(&prefix, app),
        None => app,
    }
}

fn normalize_base_path(base_path: &str) -> Option<String> {
    let trimmed = base_path.trim().trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{trimmed}"))
    }
}
