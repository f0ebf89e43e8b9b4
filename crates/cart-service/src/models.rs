//! 购物车实体定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 购物车聚合
///
/// `id` 创建后不可变，是存储中唯一的寻址键。没有商品行的购物车是合法的空购物车，
/// 与已删除不同。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub items: Vec<LineItem>,
    /// 乐观并发版本号，每次成功写入递增，0 表示尚未持久化
    #[serde(default)]
    pub version: u64,
    /// 最近一次清空购物车的订单，用于订单完成事件去重
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_order: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            customer_id: None,
            items: Vec::new(),
            version: 0,
            last_completed_order: None,
            updated_at: Utc::now(),
        }
    }

    pub fn item(&self, item_id: i64) -> Option<&LineItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }
}

/// 购物车商品行
///
/// `item_id` 在购物车内唯一；名称、单价等属性对一致性引擎不透明。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub item_id: i64,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub unit_price: f64,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl LineItem {
    pub fn new(item_id: i64, quantity: u32) -> Self {
        Self {
            item_id,
            product_name: String::new(),
            unit_price: 0.0,
            quantity,
            image_url: None,
        }
    }
}
