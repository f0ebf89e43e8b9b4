//! 购物车聚合合并规则
//!
//! 纯函数：给定当前快照（可能不存在）和一条变更命令，计算结果快照。
//! 不做 I/O，不处理版本号，由 `CartStore` 负责读取、比较并交换。
//!
//! - `AddItem`：同 `item_id` 数量相加，否则追加
//! - `UpdateItem`：整行替换，不合并；购物车或商品行不存在时报 NotFound
//! - `DeleteItem`：幂等，目标不存在时为空操作
//! - `Clear`：清空商品行并记录订单号，同一订单重复清空为空操作
//! - 请求中的数量必须 ≥ 1，重复的 `item_id` 按数量相加归并

use chrono::Utc;

use cart_shared::error::{CartError, Result};

use crate::models::{Cart, LineItem};

/// 购物车 ID 最大长度
pub const MAX_CART_ID_LEN: usize = 128;

/// 购物车变更命令
#[derive(Debug, Clone, PartialEq)]
pub enum CartCommand {
    /// 整车替换（不存在则创建）
    Replace(Cart),
    AddItem(LineItem),
    UpdateItem { item_id: i64, item: LineItem },
    DeleteItem { item_id: i64 },
    /// 订单完成后清空
    Clear { order_id: String },
}

impl CartCommand {
    /// 用于日志与指标的操作名
    pub fn name(&self) -> &'static str {
        match self {
            Self::Replace(_) => "update",
            Self::AddItem(_) => "add_item",
            Self::UpdateItem { .. } => "update_item",
            Self::DeleteItem { .. } => "delete_item",
            Self::Clear { .. } => "clear",
        }
    }
}

/// 合并结果
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// 需要写回的新快照
    Write(Cart),
    /// 无需写入，附带当前快照（购物车不存在时为 None）
    Noop(Option<Cart>),
}

/// 将命令应用到当前快照
pub fn apply(existing: Option<&Cart>, cart_id: &str, command: &CartCommand) -> Result<Transition> {
    validate_cart_id(cart_id)?;

    match command {
        CartCommand::Replace(requested) => {
            let items = normalize_items(&requested.items)?;
            let mut cart = existing
                .cloned()
                .unwrap_or_else(|| Cart::empty(cart_id));
            cart.customer_id = requested.customer_id.clone();
            cart.items = items;
            cart.updated_at = Utc::now();
            Ok(Transition::Write(cart))
        }

        CartCommand::AddItem(item) => {
            validate_item(item)?;
            let mut cart = existing
                .cloned()
                .unwrap_or_else(|| Cart::empty(cart_id));
            merge_item(&mut cart.items, item)?;
            cart.updated_at = Utc::now();
            Ok(Transition::Write(cart))
        }

        CartCommand::UpdateItem { item_id, item } => {
            validate_item_id(*item_id)?;
            validate_quantity(item.quantity)?;
            let Some(current) = existing else {
                return Err(CartError::cart_not_found(cart_id));
            };
            let mut cart = current.clone();
            let Some(slot) = cart.items.iter_mut().find(|i| i.item_id == *item_id) else {
                return Err(CartError::item_not_found(cart_id, *item_id));
            };
            *slot = LineItem {
                item_id: *item_id,
                ..item.clone()
            };
            cart.updated_at = Utc::now();
            Ok(Transition::Write(cart))
        }

        CartCommand::DeleteItem { item_id } => {
            validate_item_id(*item_id)?;
            let Some(current) = existing else {
                return Ok(Transition::Noop(None));
            };
            if current.item(*item_id).is_none() {
                return Ok(Transition::Noop(Some(current.clone())));
            }
            let mut cart = current.clone();
            cart.items.retain(|i| i.item_id != *item_id);
            cart.updated_at = Utc::now();
            Ok(Transition::Write(cart))
        }

        CartCommand::Clear { order_id } => {
            if order_id.trim().is_empty() {
                return Err(CartError::InvalidRequest("order_id 不能为空".to_string()));
            }
            let Some(current) = existing else {
                return Ok(Transition::Noop(None));
            };
            if current.last_completed_order.as_deref() == Some(order_id.as_str()) {
                return Ok(Transition::Noop(Some(current.clone())));
            }
            let mut cart = current.clone();
            cart.items.clear();
            cart.last_completed_order = Some(order_id.clone());
            cart.updated_at = Utc::now();
            Ok(Transition::Write(cart))
        }
    }
}

/// 校验购物车 ID：非空、不含空白、长度受限
pub fn validate_cart_id(cart_id: &str) -> Result<()> {
    if cart_id.is_empty() {
        return Err(CartError::InvalidRequest("cart_id 不能为空".to_string()));
    }
    if cart_id.len() > MAX_CART_ID_LEN {
        return Err(CartError::InvalidRequest(format!(
            "cart_id 长度不能超过 {MAX_CART_ID_LEN}"
        )));
    }
    if cart_id.chars().any(char::is_whitespace) {
        return Err(CartError::InvalidRequest("cart_id 不能包含空白字符".to_string()));
    }
    Ok(())
}

fn validate_item_id(item_id: i64) -> Result<()> {
    if item_id < 1 {
        return Err(CartError::InvalidRequest(format!(
            "item_id 必须为正整数: {item_id}"
        )));
    }
    Ok(())
}

fn validate_quantity(quantity: u32) -> Result<()> {
    if quantity == 0 {
        return Err(CartError::InvalidRequest("quantity 必须大于 0".to_string()));
    }
    Ok(())
}

fn validate_item(item: &LineItem) -> Result<()> {
    validate_item_id(item.item_id)?;
    validate_quantity(item.quantity)
}

fn merge_item(items: &mut Vec<LineItem>, item: &LineItem) -> Result<()> {
    match items.iter_mut().find(|i| i.item_id == item.item_id) {
        Some(existing) => {
            existing.quantity = existing
                .quantity
                .checked_add(item.quantity)
                .ok_or_else(|| {
                    CartError::InvalidRequest(format!("item_id={} 数量溢出", item.item_id))
                })?;
        }
        None => items.push(item.clone()),
    }
    Ok(())
}

/// 校验并归并请求中的商品行，保持首次出现的顺序
fn normalize_items(items: &[LineItem]) -> Result<Vec<LineItem>> {
    let mut normalized = Vec::with_capacity(items.len());
    for item in items {
        validate_item(item)?;
        merge_item(&mut normalized, item)?;
    }
    Ok(normalized)
}
