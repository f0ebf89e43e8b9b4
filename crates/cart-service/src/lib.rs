//! 购物车服务
//!
//! 提供购物车 REST 与 gRPC 接口，并消费订单完成事件清空对应购物车。
//! 所有写入都经乐观版本比较，HTTP 请求与事件消费可以并发修改同一购物车。

pub mod aggregate;
pub mod consumer;
pub mod dto;
pub mod error;
pub mod grpc;
pub mod handlers;
pub mod models;
pub mod order_completed;
pub mod repository;
pub mod routes;
pub mod state;
pub mod store;
