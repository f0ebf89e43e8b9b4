//! 死信队列
//!
//! 消费链路上本地重试耗尽的消息写入死信 topic，附带原始坐标和失败原因，
//! 位点随后照常推进，分区不会被一条坏消息卡住。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::CartError;
use crate::kafka::{ConsumerMessage, DeadLetterSink, KafkaProducer};
use crate::observability::metrics;

// ---------------------------------------------------------------------------
// DeadLetterMessage — 死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 key，缺省时取日志坐标
    pub message_id: String,
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,
    /// 原始负载（按 UTF-8 有损解码）
    pub payload: String,
    pub error: String,
    pub error_code: String,
    /// 含首次执行在内的处理次数
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn from_failure(
        message: &ConsumerMessage,
        error: &CartError,
        attempts: u32,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message
                .key
                .clone()
                .unwrap_or_else(|| message.coordinates()),
            source_topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            error: error.to_string(),
            error_code: error.code().to_string(),
            attempts,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// DlqProducer — 将失败消息发送到死信队列
// ---------------------------------------------------------------------------

/// DLQ 生产者
pub struct DlqProducer {
    producer: KafkaProducer,
    topic: String,
    source_service: String,
}

impl DlqProducer {
    pub fn new(
        producer: KafkaProducer,
        topic: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            source_service: source_service.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for DlqProducer {
    async fn dead_letter(
        &self,
        message: &ConsumerMessage,
        error: &CartError,
        attempts: u32,
    ) -> Result<(), CartError> {
        let dlq_msg = DeadLetterMessage::from_failure(message, error, attempts, &self.source_service);

        match self
            .producer
            .send_json(&self.topic, &dlq_msg.message_id, &dlq_msg)
            .await
        {
            Ok(_) => {
                metrics::record_dead_letter(&message.topic);
                info!(
                    message_id = %dlq_msg.message_id,
                    source = %message.coordinates(),
                    dlq_topic = %self.topic,
                    attempts,
                    "消息已写入死信队列"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    message_id = %dlq_msg.message_id,
                    error = %e,
                    "写入死信队列失败"
                );
                Err(e)
            }
        }
    }
}
