//! HTTP 处理器

pub mod cart;
pub mod health;
