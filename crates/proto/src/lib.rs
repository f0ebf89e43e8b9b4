//! 购物车 gRPC 协议定义
//!
//! 由 `proto/cart.proto` 在构建时生成，同时包含服务端与客户端代码。

pub mod cart {
    tonic::include_proto!("cart");
}
