//! 购物车存储
//!
//! 所有变更都是"读取 → 纯合并 → 按版本比较写入"，版本冲突时重读并重放命令，
//! 超过 `max_conflict_retries` 次仍冲突则返回 `Conflict`。
//! 不在进程内缓存购物车，每次操作都从后端重新读取。

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use cart_shared::error::{CartError, Result};
use cart_shared::observability::metrics;

use crate::aggregate::{self, CartCommand, Transition};
use crate::models::{Cart, LineItem};
use crate::repository::CartRepository;

/// 清空购物车的结果，三者对调用方都是成功
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared,
    /// 同一订单已清空过（重复投递）
    AlreadyCleared,
    /// 购物车不存在
    Absent,
}

#[derive(Clone)]
pub struct CartStore {
    repo: Arc<dyn CartRepository>,
    max_conflict_retries: u32,
}

impl CartStore {
    pub fn new(repo: Arc<dyn CartRepository>, max_conflict_retries: u32) -> Self {
        Self {
            repo,
            max_conflict_retries,
        }
    }

    /// 读取购物车快照，不存在返回 NotFound
    #[instrument(skip(self))]
    pub async fn get(&self, cart_id: &str) -> Result<Cart> {
        aggregate::validate_cart_id(cart_id)?;
        let result = self
            .repo
            .load(cart_id)
            .await
            .and_then(|cart| cart.ok_or_else(|| CartError::cart_not_found(cart_id)));
        record("get", &result);
        result
    }

    /// 整车替换，不存在则创建
    #[instrument(skip(self, cart), fields(cart_id = %cart.id))]
    pub async fn update(&self, cart: Cart) -> Result<Cart> {
        let cart_id = cart.id.clone();
        let written = self.mutate(&cart_id, CartCommand::Replace(cart)).await?;
        snapshot_of(written, &cart_id)
    }

    /// 删除购物车，幂等
    #[instrument(skip(self))]
    pub async fn delete(&self, cart_id: &str) -> Result<()> {
        aggregate::validate_cart_id(cart_id)?;
        let result = self.repo.remove(cart_id).await;
        record("delete", &result);
        if let Ok(removed) = &result {
            info!(cart_id, removed = *removed, "购物车已删除");
        }
        result.map(|_| ())
    }

    /// 添加商品，同 `item_id` 数量相加；购物车不存在则创建
    #[instrument(skip(self, item), fields(item_id = item.item_id, quantity = item.quantity))]
    pub async fn add_item(&self, cart_id: &str, item: LineItem) -> Result<Cart> {
        let written = self.mutate(cart_id, CartCommand::AddItem(item)).await?;
        snapshot_of(written, cart_id)
    }

    /// 整行替换已有商品，购物车或商品不存在返回 NotFound
    #[instrument(skip(self, item))]
    pub async fn update_item(&self, cart_id: &str, item_id: i64, item: LineItem) -> Result<Cart> {
        let written = self
            .mutate(cart_id, CartCommand::UpdateItem { item_id, item })
            .await?;
        snapshot_of(written, cart_id)
    }

    /// 删除商品，幂等；返回删除后的快照，购物车不存在时为 None
    #[instrument(skip(self))]
    pub async fn delete_item(&self, cart_id: &str, item_id: i64) -> Result<Option<Cart>> {
        match self
            .mutate(cart_id, CartCommand::DeleteItem { item_id })
            .await?
        {
            Transition::Write(cart) => Ok(Some(cart)),
            Transition::Noop(snapshot) => Ok(snapshot),
        }
    }

    /// 订单完成后清空购物车
    ///
    /// 重复投递同一订单、或购物车已不存在，都是成功的空操作。
    #[instrument(skip(self))]
    pub async fn clear(&self, cart_id: &str, order_id: &str) -> Result<ClearOutcome> {
        let transition = self
            .mutate(
                cart_id,
                CartCommand::Clear {
                    order_id: order_id.to_string(),
                },
            )
            .await?;

        let outcome = match transition {
            Transition::Write(_) => ClearOutcome::Cleared,
            Transition::Noop(Some(_)) => ClearOutcome::AlreadyCleared,
            Transition::Noop(None) => ClearOutcome::Absent,
        };
        Ok(outcome)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.repo.ping().await
    }

    async fn mutate(&self, cart_id: &str, command: CartCommand) -> Result<Transition> {
        let operation = command.name();
        let result = self.mutate_with_retry(cart_id, &command).await;
        record(operation, &result);
        result
    }

    async fn mutate_with_retry(&self, cart_id: &str, command: &CartCommand) -> Result<Transition> {
        aggregate::validate_cart_id(cart_id)?;
        let operation = command.name();
        let mut conflicts: u32 = 0;

        loop {
            let current = self.repo.load(cart_id).await?;
            let expected = current.as_ref().map_or(0, |c| c.version);

            let mut next = match aggregate::apply(current.as_ref(), cart_id, command)? {
                Transition::Write(next) => next,
                noop @ Transition::Noop(_) => {
                    debug!(cart_id, operation, "无需写入");
                    return Ok(noop);
                }
            };
            next.version = expected + 1;

            if self.repo.compare_and_swap(&next, expected).await? {
                debug!(cart_id, operation, version = next.version, "购物车已写入");
                return Ok(Transition::Write(next));
            }

            metrics::record_version_conflict(operation);
            conflicts += 1;
            if conflicts > self.max_conflict_retries {
                warn!(cart_id, operation, conflicts, "版本冲突重试耗尽");
                return Err(CartError::Conflict {
                    cart_id: cart_id.to_string(),
                });
            }
            debug!(cart_id, operation, expected, conflicts, "版本冲突，重读后重放");
            tokio::task::yield_now().await;
        }
    }
}

fn snapshot_of(transition: Transition, cart_id: &str) -> Result<Cart> {
    match transition {
        Transition::Write(cart) | Transition::Noop(Some(cart)) => Ok(cart),
        Transition::Noop(None) => Err(CartError::cart_not_found(cart_id)),
    }
}

fn record<T>(operation: &'static str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(CartError::NotFound { .. }) => "not_found",
        Err(CartError::InvalidRequest(_)) => "invalid",
        Err(CartError::Conflict { .. }) => "conflict",
        Err(_) => "error",
    };
    metrics::record_cart_operation(operation, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockCartRepository;

    fn stored(version: u64, items: &[(i64, u32)]) -> Cart {
        let mut cart = Cart::empty("c-1");
        cart.version = version;
        cart.items = items.iter().map(|&(id, q)| LineItem::new(id, q)).collect();
        cart
    }

    fn store_failure() -> CartError {
        CartError::Store(redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )))
    }

    #[tokio::test]
    async fn test_conflict_replays_against_fresh_snapshot() {
        let mut repo = MockCartRepository::new();
        let mut loads = 0;
        repo.expect_load().times(2).returning(move |_| {
            loads += 1;
            // 第二次读取时另一个写入者已把数量改成 4
            Ok(Some(if loads == 1 {
                stored(1, &[(10, 1)])
            } else {
                stored(2, &[(10, 4)])
            }))
        });
        repo.expect_compare_and_swap()
            .withf(|_, expected| *expected == 1)
            .times(1)
            .returning(|_, _| Ok(false));
        repo.expect_compare_and_swap()
            .withf(|cart, expected| *expected == 2 && cart.version == 3)
            .times(1)
            .returning(|_, _| Ok(true));

        let store = CartStore::new(Arc::new(repo), 3);
        let cart = store.add_item("c-1", LineItem::new(10, 2)).await.unwrap();
        assert_eq!(cart.item(10).unwrap().quantity, 6);
        assert_eq!(cart.version, 3);
    }

    #[tokio::test]
    async fn test_conflict_retries_exhausted() {
        let mut repo = MockCartRepository::new();
        repo.expect_load()
            .times(3)
            .returning(|_| Ok(Some(stored(1, &[]))));
        repo.expect_compare_and_swap()
            .times(3)
            .returning(|_, _| Ok(false));

        let store = CartStore::new(Arc::new(repo), 2);
        let err = store
            .add_item("c-1", LineItem::new(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::Conflict { ref cart_id } if cart_id == "c-1"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut repo = MockCartRepository::new();
        repo.expect_load().returning(|_| Err(store_failure()));
        repo.expect_compare_and_swap().never();

        let store = CartStore::new(Arc::new(repo), 2);
        let err = store.get("c-1").await.unwrap_err();
        assert_eq!(err.code(), "STORE_FAILURE");

        let err = store.clear("c-1", "o-1").await.unwrap_err();
        assert_eq!(err.code(), "STORE_FAILURE");
    }

    #[tokio::test]
    async fn test_invalid_request_never_touches_backend() {
        let mut repo = MockCartRepository::new();
        repo.expect_load().returning(|_| Ok(None));
        repo.expect_compare_and_swap().never();
        repo.expect_remove().never();

        let store = CartStore::new(Arc::new(repo), 2);
        let err = store
            .add_item("c-1", LineItem::new(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::InvalidRequest(_)));

        let err = store.delete("bad id").await.unwrap_err();
        assert!(matches!(err, CartError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_clear_absent_cart_skips_write() {
        let mut repo = MockCartRepository::new();
        repo.expect_load().times(1).returning(|_| Ok(None));
        repo.expect_compare_and_swap().never();

        let store = CartStore::new(Arc::new(repo), 2);
        assert_eq!(
            store.clear("c-1", "o-1").await.unwrap(),
            ClearOutcome::Absent
        );
    }
}
