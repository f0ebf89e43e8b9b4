//! 订单完成事件处理
//!
//! 消费 `OrderCompletedEvent`，清空下单所用的购物车。
//! 同一事件可能被重复投递：重复清空、购物车已删除都按成功处理。

use async_trait::async_trait;
use tracing::{info, warn};

use cart_shared::error::{CartError, Result};
use cart_shared::events::OrderCompletedEvent;
use cart_shared::kafka::{ConsumerMessage, MessageHandler};

use crate::store::{CartStore, ClearOutcome};

pub struct OrderCompletedHandler {
    store: CartStore,
}

impl OrderCompletedHandler {
    pub fn new(store: CartStore) -> Self {
        Self { store }
    }

    /// 处理已解码的事件，供消息处理与测试直接调用
    pub async fn handle_event(&self, event: &OrderCompletedEvent) -> Result<ClearOutcome> {
        event.validate()?;

        let outcome = match self.store.clear(&event.cart_id, &event.order_id).await {
            Ok(outcome) => outcome,
            // 瞬时故障交给重试，请求错误交给死信
            Err(e) if e.is_retryable() => return Err(e),
            Err(e @ CartError::InvalidRequest(_)) => return Err(e),
            Err(e) => return Err(CartError::Handler(format!("清空购物车失败: {e}"))),
        };

        match outcome {
            ClearOutcome::Cleared => info!(
                order_id = %event.order_id,
                cart_id = %event.cart_id,
                "订单完成，购物车已清空"
            ),
            ClearOutcome::AlreadyCleared => info!(
                order_id = %event.order_id,
                cart_id = %event.cart_id,
                "重复的订单完成事件，购物车已清空过"
            ),
            ClearOutcome::Absent => warn!(
                order_id = %event.order_id,
                cart_id = %event.cart_id,
                "订单对应的购物车不存在，忽略"
            ),
        }
        Ok(outcome)
    }
}

#[async_trait]
impl MessageHandler for OrderCompletedHandler {
    async fn handle(&self, message: &ConsumerMessage) -> Result<()> {
        let event: OrderCompletedEvent = message.deserialize_payload()?;
        self.handle_event(&event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::models::Cart;
    use crate::repository::MockCartRepository;

    fn handler_with(repo: MockCartRepository) -> OrderCompletedHandler {
        OrderCompletedHandler::new(CartStore::new(Arc::new(repo), 2))
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_is_handler_failure() {
        let mut repo = MockCartRepository::new();
        repo.expect_load()
            .returning(|_| Err(CartError::Serialization("expected value".to_string())));

        let err = handler_with(repo)
            .handle_event(&OrderCompletedEvent::new("o-1", "c-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::Handler(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_blank_cart_id_rejected_before_store() {
        let mut repo = MockCartRepository::new();
        repo.expect_load().never();

        let err = handler_with(repo)
            .handle_event(&OrderCompletedEvent::new("o-1", " "))
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_conflict_stays_retryable() {
        let mut repo = MockCartRepository::new();
        repo.expect_load().returning(|_| {
            let mut cart = Cart::empty("c-1");
            cart.version = 1;
            Ok(Some(cart))
        });
        repo.expect_compare_and_swap().returning(|_, _| Ok(false));

        let err = handler_with(repo)
            .handle_event(&OrderCompletedEvent::new("o-1", "c-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::Conflict { .. }));
    }
}
