//! 仓储 Trait 定义
//!
//! 存储层只提供按 key 的读取、带版本比较的写入和删除，
//! 合并逻辑与冲突重试都在 `CartStore` 中完成。

use async_trait::async_trait;

use cart_shared::error::Result;

use crate::models::Cart;

/// 购物车仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartRepository: Send + Sync {
    /// 读取当前快照，`version` 字段为持久化版本
    async fn load(&self, cart_id: &str) -> Result<Option<Cart>>;

    /// 仅当持久化版本等于 `expected_version` 时写入（0 表示当前不存在）
    ///
    /// 返回 false 表示版本冲突，调用方应重读后重放。
    async fn compare_and_swap(&self, cart: &Cart, expected_version: u64) -> Result<bool>;

    /// 删除购物车，返回是否确实删除了记录
    async fn remove(&self, cart_id: &str) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}
