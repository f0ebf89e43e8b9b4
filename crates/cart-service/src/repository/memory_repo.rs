//! 内存购物车仓储
//!
//! 与 Redis 仓储相同的版本比较语义，用于测试与本地运行。
//! DashMap 的 entry 在分片锁内完成比较与写入。

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use cart_shared::error::Result;

use super::traits::CartRepository;
use crate::models::Cart;

#[derive(Default)]
pub struct InMemoryCartRepository {
    carts: DashMap<String, Cart>,
}

impl InMemoryCartRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CartRepository for InMemoryCartRepository {
    async fn load(&self, cart_id: &str) -> Result<Option<Cart>> {
        Ok(self.carts.get(cart_id).map(|c| c.value().clone()))
    }

    async fn compare_and_swap(&self, cart: &Cart, expected_version: u64) -> Result<bool> {
        let swapped = match self.carts.entry(cart.id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().version == expected_version {
                    entry.insert(cart.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected_version == 0 {
                    entry.insert(cart.clone());
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }

    async fn remove(&self, cart_id: &str) -> Result<bool> {
        Ok(self.carts.remove(cart_id).is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
