//! 消费组状态机
//!
//! 与具体 Kafka 客户端无关的消费循环，显式建模为
//! `Idle → Joining → Claiming → Draining → (Joining | Stopped)`：
//!
//! - **Joining**：加入（或再均衡后重新加入）消费组，等待分区分配
//! - **Claiming**：每个分区认领一个处理任务，分区内严格按日志顺序逐条同步处理
//! - **Draining**：认领被收回（再均衡）或收到关闭信号，等待在途消息处理完毕
//! - **Stopped**：关闭信号已生效或发生致命错误
//!
//! 关闭信号只在两条消息之间、以及 Draining 与下一轮 Joining 之间生效，
//! 不会中断正在处理的消息。
//!
//! 确认语义：处理成功才 ack（存储位点，由自动提交定期提交）；可重试错误先做
//! 有限次本地退避重试，仍失败则写入死信队列后 ack；死信写入也失败时 nack，
//! 位点不存储，只记录日志。
//!
//! 每条消息在 `consume_message` span 内处理；消息头带 W3C traceparent 时
//! 该 span 挂到上游追踪之下。

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::trace::TraceContextExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::ConsumerMessage;
use crate::error::{CartError, Result};
use crate::observability::metrics;
use crate::observability::tracing::extract_from_headers;
use crate::retry::{RetryPolicy, retry_with_policy};

/// 消费循环所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Joining,
    Claiming,
    Draining,
    Stopped,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Joining => "JOINING",
            Self::Claiming => "CLAIMING",
            Self::Draining => "DRAINING",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

/// 单个分区的认领
///
/// 通道关闭表示认领被收回（再均衡）或会话结束。
pub struct PartitionClaim {
    pub topic: String,
    pub partition: i32,
    pub messages: mpsc::Receiver<ConsumerMessage>,
}

/// 消息确认
///
/// ack 之后该位点才会被提交；nack 只记录，不保证重新投递。
pub trait Acknowledger: Send + Sync {
    fn ack(&self, message: &ConsumerMessage) -> Result<()>;
    fn nack(&self, message: &ConsumerMessage, reason: &CartError);
}

/// 一轮消费组会话（一个再均衡代次）
pub struct GroupSession {
    pub generation: u64,
    pub claims: Vec<PartitionClaim>,
    pub acknowledger: Arc<dyn Acknowledger>,
    /// 会话驱动任务：拉取消息并按分区路由。
    /// 正常结束表示再均衡或关闭，返回错误表示致命故障。
    /// 为 None 时会话随所有认领通道关闭而结束。
    pub driver: Option<JoinHandle<Result<()>>>,
}

/// 消费组客户端抽象
#[async_trait]
pub trait ConsumerGroup: Send {
    /// 加入消费组并等待分区分配
    ///
    /// 等待期间收到关闭信号返回 `Ok(None)`；
    /// 无法建立认领（broker 不可达、订阅失败）返回错误，对消费循环是致命的。
    async fn join(&mut self, shutdown: &mut watch::Receiver<bool>)
    -> Result<Option<GroupSession>>;
}

/// 单条消息的业务处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ConsumerMessage) -> Result<()>;
}

/// 死信出口：本地重试耗尽的消息在此落地，避免静默丢失
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(
        &self,
        message: &ConsumerMessage,
        error: &CartError,
        attempts: u32,
    ) -> Result<()>;
}

/// 消费组外层恢复循环
pub struct GroupConsumer<G: ConsumerGroup> {
    group: G,
    handler: Arc<dyn MessageHandler>,
    retry_policy: RetryPolicy,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    state: watch::Sender<ConsumerState>,
}

impl<G: ConsumerGroup> GroupConsumer<G> {
    pub fn new(group: G, handler: Arc<dyn MessageHandler>) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            group,
            handler,
            retry_policy: RetryPolicy::default(),
            dead_letter: None,
            state,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// 订阅状态变化，用于就绪探针和测试观察
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConsumerState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "消费循环状态变更");
        }
    }

    /// 运行消费循环，直到收到关闭信号或发生致命错误
    ///
    /// 致命错误以 `CartError::Consumer` 返回，由宿主进程决定退出并交给外部监管重启，
    /// 循环内部不做重连。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let result = self.run_sessions(&mut shutdown).await;
        self.transition(ConsumerState::Stopped);

        match &result {
            Ok(()) => info!("消费循环已停止"),
            Err(e) => error!(error = %e, "消费循环因致命错误终止"),
        }
        result
    }

    async fn run_sessions(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            self.transition(ConsumerState::Joining);
            let session = match self.group.join(shutdown).await {
                Ok(Some(session)) => session,
                Ok(None) => return Ok(()),
                Err(CartError::Consumer(msg)) => return Err(CartError::Consumer(msg)),
                Err(e) => return Err(CartError::Consumer(e.to_string())),
            };

            let GroupSession {
                generation,
                claims,
                acknowledger,
                driver,
            } = session;

            if generation > 1 {
                metrics::record_rebalance();
            }
            info!(generation, claims = claims.len(), "已获得分区认领");
            self.transition(ConsumerState::Claiming);

            let workers: Vec<JoinHandle<()>> = claims
                .into_iter()
                .map(|claim| {
                    let worker = PartitionWorker {
                        handler: self.handler.clone(),
                        acknowledger: acknowledger.clone(),
                        dead_letter: self.dead_letter.clone(),
                        retry_policy: self.retry_policy.clone(),
                    };
                    tokio::spawn(worker.run(claim, shutdown.clone()))
                })
                .collect();

            let driver_result = match driver {
                Some(driver) => {
                    let result = driver.await;
                    self.transition(ConsumerState::Draining);
                    join_workers(workers).await;
                    result
                }
                None => {
                    join_workers(workers).await;
                    self.transition(ConsumerState::Draining);
                    Ok(Ok(()))
                }
            };

            match driver_result {
                Ok(Ok(())) => info!(generation, "会话结束，分区认领已排空"),
                Ok(Err(e)) => return Err(CartError::Consumer(e.to_string())),
                Err(join_err) => {
                    return Err(CartError::Consumer(format!(
                        "会话驱动任务异常退出: {join_err}"
                    )));
                }
            }
        }
    }
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            error!(error = %e, "分区处理任务异常退出");
        }
    }
}

/// 单分区处理任务：逐条同步分发，不在认领内部再派生并发
struct PartitionWorker {
    handler: Arc<dyn MessageHandler>,
    acknowledger: Arc<dyn Acknowledger>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    retry_policy: RetryPolicy,
}

impl PartitionWorker {
    async fn run(self, claim: PartitionClaim, mut shutdown: watch::Receiver<bool>) {
        let PartitionClaim {
            topic,
            partition,
            mut messages,
        } = claim;

        info!(%topic, partition, "开始处理分区认领");

        loop {
            if *shutdown.borrow() {
                info!(%topic, partition, "收到关闭信号，停止处理分区");
                break;
            }

            tokio::select! {
                // 偏向关闭信号，保证关闭后不再开始处理新消息
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!(%topic, partition, "关闭信号发送端已释放，停止处理分区");
                        break;
                    }
                }

                next = messages.recv() => {
                    let Some(message) = next else {
                        info!(%topic, partition, "分区认领已收回");
                        break;
                    };
                    self.dispatch(&message).await;
                }
            }
        }
    }

    async fn dispatch(&self, message: &ConsumerMessage) {
        let span = info_span!(
            "consume_message",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
        );
        if let Some(parent) = remote_parent(message) {
            let _ = span.set_parent(parent);
        }

        self.process(message).instrument(span).await;
    }

    async fn process(&self, message: &ConsumerMessage) {
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "分发消息"
        );

        let outcome = retry_with_policy(&self.retry_policy, "handle_message", || {
            self.handler.handle(message)
        })
        .await;

        let err = match outcome.result {
            Ok(()) => {
                metrics::record_consumed_message(&message.topic, "success");
                self.ack(message);
                return;
            }
            Err(err) => err,
        };

        error!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            attempts = outcome.attempts,
            error = %err,
            "消息处理失败"
        );

        let Some(sink) = &self.dead_letter else {
            metrics::record_consumed_message(&message.topic, "failed");
            self.acknowledger.nack(message, &err);
            return;
        };

        match sink.dead_letter(message, &err, outcome.attempts).await {
            Ok(()) => {
                metrics::record_consumed_message(&message.topic, "dead_lettered");
                self.ack(message);
            }
            Err(dlq_err) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %dlq_err,
                    "写入死信队列失败，消息可能丢失"
                );
                metrics::record_consumed_message(&message.topic, "failed");
                self.acknowledger.nack(message, &err);
            }
        }
    }

    fn ack(&self, message: &ConsumerMessage) {
        if let Err(e) = self.acknowledger.ack(message) {
            // 常见于再均衡后分区已被收回，新的持有者会重新投递
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "存储消费位点失败"
            );
        }
    }
}

/// 消息头中携带的上游追踪上下文，没有有效 traceparent 时返回 None
fn remote_parent(message: &ConsumerMessage) -> Option<opentelemetry::Context> {
    let context = extract_from_headers(&message.headers);
    context
        .span()
        .span_context()
        .is_valid()
        .then_some(context)
}
