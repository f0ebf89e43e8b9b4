//! 请求 DTO 定义
//!
//! 请求体先由 serde 解码、再经 validator 校验，失败统一映射为 400。

use axum::Json;
use axum::extract::{FromRequest, FromRequestParts, Path, Request};
use axum::http::request::Parts;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use validator::Validate;

use cart_shared::error::CartError;

use crate::error::ApiError;
use crate::models::{Cart, LineItem};

/// 商品行请求
///
/// 数量按 i64 接收，负数能走到校验环节而不是解码失败。
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LineItemRequest {
    #[validate(range(min = 1, message = "itemId 必须为正整数"))]
    pub item_id: i64,
    #[serde(default)]
    #[validate(length(max = 200, message = "商品名称不能超过200个字符"))]
    pub product_name: String,
    #[serde(default)]
    #[validate(range(min = 0.0, message = "单价不能为负"))]
    pub unit_price: f64,
    #[validate(range(min = 1, max = 4294967295_i64, message = "quantity 必须大于 0"))]
    pub quantity: i64,
    pub image_url: Option<String>,
}

impl LineItemRequest {
    pub fn into_line_item(self) -> Result<LineItem, CartError> {
        Ok(LineItem {
            item_id: self.item_id,
            product_name: self.product_name,
            unit_price: self.unit_price,
            quantity: quantity_from(self.quantity)?,
            image_url: self.image_url,
        })
    }
}

/// 更新商品行请求，`itemId` 以路径为准
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItemRequest {
    #[serde(default)]
    #[validate(length(max = 200, message = "商品名称不能超过200个字符"))]
    pub product_name: String,
    #[serde(default)]
    #[validate(range(min = 0.0, message = "单价不能为负"))]
    pub unit_price: f64,
    #[validate(range(min = 1, max = 4294967295_i64, message = "quantity 必须大于 0"))]
    pub quantity: i64,
    pub image_url: Option<String>,
}

impl UpdateItemRequest {
    pub fn into_line_item(self, item_id: i64) -> Result<LineItem, CartError> {
        Ok(LineItem {
            item_id,
            product_name: self.product_name,
            unit_price: self.unit_price,
            quantity: quantity_from(self.quantity)?,
            image_url: self.image_url,
        })
    }
}

/// 创建 / 整车替换请求
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CartRequest {
    #[validate(length(min = 1, max = 64, message = "customerId 长度必须在1-64个字符之间"))]
    pub customer_id: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub items: Vec<LineItemRequest>,
}

impl CartRequest {
    pub fn into_cart(self, cart_id: &str) -> Result<Cart, CartError> {
        let mut cart = Cart::empty(cart_id);
        cart.customer_id = self.customer_id;
        cart.items = self
            .items
            .into_iter()
            .map(LineItemRequest::into_line_item)
            .collect::<Result<_, _>>()?;
        Ok(cart)
    }
}

fn quantity_from(quantity: i64) -> Result<u32, CartError> {
    u32::try_from(quantity)
        .ok()
        .filter(|q| *q > 0)
        .ok_or_else(|| CartError::InvalidRequest(format!("quantity 超出范围: {quantity}")))
}

/// 解码并校验的 JSON 请求体
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| CartError::InvalidRequest(rejection.body_text()))?;
        value.validate()?;
        Ok(Self(value))
    }
}

/// 解码路径参数，格式错误映射为 400 而非 axum 默认的纯文本响应
pub struct ValidatedPath<T>(pub T);

impl<T, S> FromRequestParts<S> for ValidatedPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| CartError::InvalidRequest(rejection.body_text()))?;
        Ok(Self(value))
    }
}
