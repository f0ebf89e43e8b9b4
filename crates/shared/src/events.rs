//! 事件模型
//!
//! 订单服务在订单完成后发布 `OrderCompletedEvent`，购物车服务据此清空对应购物车。
//! 除字段存在性外不做 schema 版本管理，未知字段直接忽略。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CartError;

/// 订单完成事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCompletedEvent {
    pub order_id: String,
    /// 下单时所用的购物车
    pub cart_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrderCompletedEvent {
    pub fn new(order_id: impl Into<String>, cart_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            cart_id: cart_id.into(),
            customer_id: None,
            completed_at: Some(Utc::now()),
        }
    }

    /// 校验必填标识，空白 id 视为无效请求
    pub fn validate(&self) -> Result<(), CartError> {
        if self.order_id.trim().is_empty() {
            return Err(CartError::InvalidRequest("order_id 不能为空".to_string()));
        }
        if self.cart_id.trim().is_empty() {
            return Err(CartError::InvalidRequest("cart_id 不能为空".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_event() {
        let json = r#"{"order_id":"o-1","cart_id":"c-1","total":99.5}"#;
        let event: OrderCompletedEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.order_id, "o-1");
        assert_eq!(event.cart_id, "c-1");
        assert!(event.customer_id.is_none());
        assert!(event.completed_at.is_none());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_missing_cart_id_fails_to_decode() {
        let json = r#"{"order_id":"o-1"}"#;
        assert!(serde_json::from_str::<OrderCompletedEvent>(json).is_err());
    }

    #[test]
    fn test_blank_ids_rejected() {
        let event = OrderCompletedEvent::new("o-1", "  ");
        assert!(matches!(event.validate(), Err(CartError::InvalidRequest(_))));

        let event = OrderCompletedEvent::new("", "c-1");
        assert!(matches!(event.validate(), Err(CartError::InvalidRequest(_))));
    }
}
