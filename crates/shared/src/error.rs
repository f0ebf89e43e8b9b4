//! 统一错误处理模块
//!
//! 定义购物车系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 同步 API 与异步事件链路共用同一套分类，由各自的边界层决定如何呈现。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum CartError {
    // ==================== 请求错误 ====================
    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    /// 乐观并发重试耗尽，调用方可稍后重试
    #[error("购物车并发修改冲突: cart_id={cart_id}")]
    Conflict { cart_id: String },

    // ==================== 存储错误 ====================
    #[error("Redis 错误: {0}")]
    Store(#[from] redis::RedisError),

    #[error("序列化错误: {0}")]
    Serialization(String),

    // ==================== 消息错误 ====================
    /// 消费组无法建立或维持分区认领，对消费循环是致命的
    #[error("消费者错误: {0}")]
    Consumer(String),

    /// 单条消息业务处理失败，不中断消费循环
    #[error("消息处理失败: {0}")]
    Handler(String),

    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, CartError>;

impl CartError {
    /// 购物车不存在
    pub fn cart_not_found(cart_id: &str) -> Self {
        Self::NotFound {
            entity: "Cart".to_string(),
            id: cart_id.to_string(),
        }
    }

    /// 购物车中的商品行不存在
    pub fn item_not_found(cart_id: &str, item_id: i64) -> Self {
        Self::NotFound {
            entity: "LineItem".to_string(),
            id: format!("{cart_id}/{item_id}"),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Conflict { .. } => "CONFLICT",
            Self::Store(_) => "STORE_FAILURE",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Consumer(_) => "CONSUMER_FAILURE",
            Self::Handler(_) => "HANDLER_FAILURE",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有基础设施瞬时故障和并发冲突值得重试；请求本身的问题重试多少次结果都一样。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Kafka(_) | Self::Conflict { .. })
    }

    /// 转换为 gRPC 状态码
    ///
    /// 与 HTTP 一致，系统级错误只返回通用提示。
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::{Code, Status};

        let (code, message) = match self {
            Self::NotFound { .. } => (Code::NotFound, self.to_string()),
            Self::InvalidRequest(_) => (Code::InvalidArgument, self.to_string()),
            Self::Conflict { .. } => (Code::Aborted, self.to_string()),
            _ => {
                tracing::error!(error = %self, code = self.code(), "gRPC 请求处理失败");
                (Code::Internal, "服务内部错误，请稍后重试".to_string())
            }
        };

        Status::new(code, message)
    }
}

impl From<CartError> for tonic::Status {
    fn from(err: CartError) -> Self {
        err.to_grpc_status()
    }
}

impl From<serde_json::Error> for CartError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
