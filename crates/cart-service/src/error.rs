//! HTTP 错误映射
//!
//! 将 `CartError` 映射为状态码与 `{"code","message"}` 响应体。
//! 系统级错误只返回通用提示，详细信息仅记录日志。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use cart_shared::error::CartError;

#[derive(Debug)]
pub struct ApiError(pub CartError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            CartError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CartError::NotFound { .. } => StatusCode::NOT_FOUND,
            CartError::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CartError> for ApiError {
    fn from(err: CartError) -> Self {
        Self(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self(CartError::InvalidRequest(errors.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "请求处理失败");
            "服务内部错误，请稍后重试".to_string()
        } else {
            self.0.to_string()
        };

        let body = json!({
            "code": self.0.code(),
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = vec![
            (CartError::InvalidRequest("q".into()), StatusCode::BAD_REQUEST),
            (CartError::cart_not_found("c-1"), StatusCode::NOT_FOUND),
            (CartError::item_not_found("c-1", 2), StatusCode::NOT_FOUND),
            (
                CartError::Conflict {
                    cart_id: "c-1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                CartError::Serialization("bad".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                CartError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).status_code(), expected);
        }
    }

    #[tokio::test]
    async fn test_server_error_hides_details() {
        let response = ApiError(CartError::Internal("redis password wrong".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "INTERNAL_ERROR");
        assert!(!json["message"].as_str().unwrap().contains("password"));
    }
}
