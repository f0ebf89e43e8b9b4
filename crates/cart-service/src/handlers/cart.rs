//! 购物车 API 处理器
//!
//! 路径参数经 `ValidatedPath` 解码，cart_id 交给存储层校验；请求体经 `ValidatedJson` 解码校验。

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::info;
use uuid::Uuid;

use crate::dto::{CartRequest, LineItemRequest, UpdateItemRequest, ValidatedJson, ValidatedPath};
use crate::error::ApiResult;
use crate::models::Cart;
use crate::state::AppState;

/// 创建购物车，id 由服务端生成
///
/// POST /api/v1/cart
pub async fn create_cart(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CartRequest>,
) -> ApiResult<(StatusCode, Json<Cart>)> {
    let cart_id = Uuid::new_v4().to_string();
    let cart = state.store.update(req.into_cart(&cart_id)?).await?;

    info!(cart_id = %cart.id, items = cart.items.len(), "购物车已创建");
    Ok((StatusCode::CREATED, Json(cart)))
}

/// GET /api/v1/cart/{cart_id}
pub async fn get_cart(
    State(state): State<AppState>,
    ValidatedPath(cart_id): ValidatedPath<String>,
) -> ApiResult<Json<Cart>> {
    Ok(Json(state.store.get(&cart_id).await?))
}

/// 整车替换，不存在则创建
///
/// PUT /api/v1/cart/{cart_id}
pub async fn update_cart(
    State(state): State<AppState>,
    ValidatedPath(cart_id): ValidatedPath<String>,
    ValidatedJson(req): ValidatedJson<CartRequest>,
) -> ApiResult<Json<Cart>> {
    let cart = state.store.update(req.into_cart(&cart_id)?).await?;
    Ok(Json(cart))
}

/// DELETE /api/v1/cart/{cart_id}
pub async fn delete_cart(
    State(state): State<AppState>,
    ValidatedPath(cart_id): ValidatedPath<String>,
) -> ApiResult<StatusCode> {
    state.store.delete(&cart_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 添加商品，同一商品数量累加
///
/// POST /api/v1/cart/{cart_id}/item
pub async fn add_item(
    State(state): State<AppState>,
    ValidatedPath(cart_id): ValidatedPath<String>,
    ValidatedJson(req): ValidatedJson<LineItemRequest>,
) -> ApiResult<Json<Cart>> {
    let cart = state.store.add_item(&cart_id, req.into_line_item()?).await?;
    Ok(Json(cart))
}

/// PUT /api/v1/cart/{cart_id}/item/{item_id}
pub async fn update_item(
    State(state): State<AppState>,
    ValidatedPath((cart_id, item_id)): ValidatedPath<(String, i64)>,
    ValidatedJson(req): ValidatedJson<UpdateItemRequest>,
) -> ApiResult<Json<Cart>> {
    let cart = state
        .store
        .update_item(&cart_id, item_id, req.into_line_item(item_id)?)
        .await?;
    Ok(Json(cart))
}

/// 删除商品；购物车不存在时返回 204
///
/// DELETE /api/v1/cart/{cart_id}/item/{item_id}
pub async fn delete_item(
    State(state): State<AppState>,
    ValidatedPath((cart_id, item_id)): ValidatedPath<(String, i64)>,
) -> ApiResult<Response> {
    let response = match state.store.delete_item(&cart_id, item_id).await? {
        Some(cart) => Json(cart).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    };
    Ok(response)
}
