//! 测试工具模块
//!
//! 提供不依赖 broker 的消费组实现和记录型替身，供各 crate 的集成测试复用。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::error::{CartError, Result};
use crate::kafka::{
    Acknowledger, ConsumerGroup, ConsumerMessage, DeadLetterSink, GroupSession, MessageHandler,
    PartitionClaim,
};

// ==================== 测试配置辅助 ====================

/// 创建测试用 Redis 配置，每次调用使用独立的 key 前缀互不干扰
pub fn test_redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379/1".to_string()),
        key_prefix: format!("cart-test:{}:", Uuid::new_v4()),
        max_conflict_retries: 5,
    }
}

/// 生成唯一的测试购物车 ID
pub fn test_cart_id() -> String {
    format!("test-cart-{}", Uuid::new_v4())
}

/// 构造测试消息
pub fn test_message(topic: &str, partition: i32, offset: i64, payload: &str) -> ConsumerMessage {
    ConsumerMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        payload: payload.as_bytes().to_vec(),
        timestamp: None,
        headers: HashMap::new(),
    }
}

// ==================== 内存消费组 ====================

struct ScriptedGeneration {
    claims: Vec<(i32, Vec<ConsumerMessage>)>,
    /// 为 true 时保持认领通道打开，直到关闭信号到来
    hold_open: bool,
}

/// 按脚本逐代返回分区认领的内存消费组
///
/// 每一代的消息预先写入认领通道；默认写完即关闭通道，模拟该代结束后发生再均衡。
/// 脚本耗尽后，默认阻塞等待关闭信号；`fail_when_exhausted` 时返回致命错误。
pub struct InMemoryConsumerGroup {
    topic: String,
    generations: VecDeque<ScriptedGeneration>,
    generation: u64,
    acknowledger: Arc<RecordingAcknowledger>,
    fail_when_exhausted: bool,
    held: Vec<mpsc::Sender<ConsumerMessage>>,
}

impl InMemoryConsumerGroup {
    pub fn new(topic: &str, acknowledger: Arc<RecordingAcknowledger>) -> Self {
        Self {
            topic: topic.to_string(),
            generations: VecDeque::new(),
            generation: 0,
            acknowledger,
            fail_when_exhausted: false,
            held: Vec::new(),
        }
    }

    /// 追加一代认领，消息消费完即视为认领被收回
    pub fn with_generation(mut self, claims: Vec<(i32, Vec<ConsumerMessage>)>) -> Self {
        self.generations.push_back(ScriptedGeneration {
            claims,
            hold_open: false,
        });
        self
    }

    /// 追加一代认领，消息消费完后认领仍保持，直到关闭
    pub fn with_open_generation(mut self, claims: Vec<(i32, Vec<ConsumerMessage>)>) -> Self {
        self.generations.push_back(ScriptedGeneration {
            claims,
            hold_open: true,
        });
        self
    }

    pub fn fail_when_exhausted(mut self) -> Self {
        self.fail_when_exhausted = true;
        self
    }
}

#[async_trait]
impl ConsumerGroup for InMemoryConsumerGroup {
    async fn join(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<GroupSession>> {
        if *shutdown.borrow() {
            return Ok(None);
        }

        let Some(scripted) = self.generations.pop_front() else {
            if self.fail_when_exhausted {
                return Err(CartError::Consumer("消费组不可用".to_string()));
            }
            loop {
                if *shutdown.borrow() {
                    return Ok(None);
                }
                if shutdown.changed().await.is_err() {
                    return Ok(None);
                }
            }
        };

        self.generation += 1;
        self.held.clear();

        let mut claims = Vec::with_capacity(scripted.claims.len());
        for (partition, messages) in scripted.claims {
            let (tx, rx) = mpsc::channel(messages.len().max(1));
            for message in messages {
                tx.try_send(message)
                    .map_err(|e| CartError::Internal(format!("预置测试消息失败: {e}")))?;
            }
            if scripted.hold_open {
                self.held.push(tx);
            }
            claims.push(PartitionClaim {
                topic: self.topic.clone(),
                partition,
                messages: rx,
            });
        }

        Ok(Some(GroupSession {
            generation: self.generation,
            claims,
            acknowledger: self.acknowledger.clone(),
            driver: None,
        }))
    }
}

// ==================== 记录型替身 ====================

/// 记录 ack / nack 的确认器
#[derive(Default)]
pub struct RecordingAcknowledger {
    acked: Mutex<Vec<(i32, i64)>>,
    nacked: Mutex<Vec<(i32, i64)>>,
}

impl RecordingAcknowledger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 已确认的 (partition, offset)，按确认顺序
    pub fn acked(&self) -> Vec<(i32, i64)> {
        self.acked.lock().clone()
    }

    pub fn nacked(&self) -> Vec<(i32, i64)> {
        self.nacked.lock().clone()
    }
}

impl Acknowledger for RecordingAcknowledger {
    fn ack(&self, message: &ConsumerMessage) -> Result<()> {
        self.acked.lock().push((message.partition, message.offset));
        Ok(())
    }

    fn nack(&self, message: &ConsumerMessage, _reason: &CartError) {
        self.nacked.lock().push((message.partition, message.offset));
    }
}

type FailureFn = Box<dyn Fn(&ConsumerMessage) -> Option<CartError> + Send + Sync>;

/// 记录每次调用的消息处理器，可按消息注入失败
pub struct RecordingHandler {
    calls: Mutex<Vec<(i32, i64)>>,
    failure: Option<FailureFn>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failure: None,
            delay: None,
        }
    }

    /// 返回 Some 的消息按给定错误失败
    pub fn failing_with<F>(mut self, failure: F) -> Self
    where
        F: Fn(&ConsumerMessage) -> Option<CartError> + Send + Sync + 'static,
    {
        self.failure = Some(Box::new(failure));
        self
    }

    /// 每条消息处理前等待，用于观察在途消息
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 每次调用的 (partition, offset)，重试会重复记录
    pub fn calls(&self) -> Vec<(i32, i64)> {
        self.calls.lock().clone()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &ConsumerMessage) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push((message.partition, message.offset));
        match self.failure.as_ref().and_then(|f| f(message)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// 死信记录
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub partition: i32,
    pub offset: i64,
    pub error_code: &'static str,
    pub attempts: u32,
}

/// 记录写入内容的死信出口
#[derive(Default)]
pub struct RecordingDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
    unavailable: bool,
}

impl RecordingDeadLetterSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 每次写入都失败的死信出口
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            unavailable: true,
        })
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn dead_letter(
        &self,
        message: &ConsumerMessage,
        error: &CartError,
        attempts: u32,
    ) -> Result<()> {
        if self.unavailable {
            return Err(CartError::Kafka("死信 topic 不可用".to_string()));
        }
        self.records.lock().push(DeadLetterRecord {
            partition: message.partition,
            offset: message.offset,
            error_code: error.code(),
            attempts,
        });
        Ok(())
    }
}
