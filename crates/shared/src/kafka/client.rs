//! 基于 rdkafka 的消费组实现
//!
//! librdkafka 负责组协调与分区分配，这里在其之上实现 `ConsumerGroup`：
//! 每次 `join` 读取当前分配，为每个分区建立认领通道，再派生一个驱动任务
//! 从 `StreamConsumer` 拉取消息并按分区路由。驱动任务定期比对分配，
//! 发现变化即结束会话，由外层循环排空后重新加入。
//!
//! 位点：`enable.auto.offset.store=false`，只有被 ack 的消息才会存储位点，
//! 自动提交定期把已存储的位点提交到 broker。
//!
//! 会话之间暂存的消息按到达顺序排队；新会话只投递仍属于自己分配的部分，
//! 其余丢弃且不确认，由新的分区持有者从已提交位点重新消费。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::ConsumerMessage;
use super::group::{Acknowledger, ConsumerGroup, GroupSession, PartitionClaim};
use crate::config::KafkaConfig;
use crate::error::{CartError, Result};

/// rdkafka 消费组
pub struct KafkaConsumerGroup {
    consumer: Arc<StreamConsumer>,
    topic: String,
    claim_buffer: usize,
    check_interval: Duration,
    generation: u64,
    subscribed: bool,
    /// 会话之间暂存的消息：上一轮拉到了不属于当前分配的消息，
    /// 或等待分配期间提前拉到的消息，留给下一轮会话首先投递
    carry_over: CarryOver,
}

impl KafkaConsumerGroup {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.commit.interval.ms",
                config.auto_commit_interval_ms.to_string(),
            )
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| CartError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            topic = %config.orders_topic,
            "Kafka 消费者已初始化"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.orders_topic.clone(),
            claim_buffer: config.claim_buffer.max(1),
            check_interval: Duration::from_millis(config.assignment_check_interval_ms.max(10)),
            generation: 0,
            subscribed: false,
            carry_over: CarryOver::default(),
        })
    }

    fn subscribe(&mut self) -> Result<()> {
        if self.subscribed {
            return Ok(());
        }
        self.consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| CartError::Consumer(format!("订阅 topic 失败: {e}")))?;
        self.subscribed = true;
        info!(topic = %self.topic, "已订阅 Kafka topic");
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn join(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<GroupSession>> {
        self.subscribe()?;

        // 分配只在轮询时推进，等待期间也必须持续 recv
        let assignment = loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            let assignment = current_assignment(&self.consumer, &self.topic)?;
            if !assignment.is_empty() {
                break assignment;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }

                received = recv_owned(&self.consumer) => {
                    match received {
                        Ok(message) => {
                            debug!(coordinates = %message.coordinates(), "等待分配期间收到消息，暂存");
                            self.carry_over.lock().push_back(message);
                        }
                        Err(e) => check_fatal(&e)?,
                    }
                }

                _ = tokio::time::sleep(self.check_interval) => {}
            }
        };

        self.generation += 1;

        let mut senders = HashMap::with_capacity(assignment.len());
        let mut claims = Vec::with_capacity(assignment.len());
        for &partition in &assignment {
            let (tx, rx) = mpsc::channel(self.claim_buffer);
            senders.insert(partition, tx);
            claims.push(PartitionClaim {
                topic: self.topic.clone(),
                partition,
                messages: rx,
            });
        }

        info!(
            generation = self.generation,
            partitions = ?assignment,
            "消费组会话已建立"
        );

        let carried: Vec<_> = self.carry_over.lock().drain(..).collect();
        let (pending, dropped) = split_pending(carried, &assignment);
        if dropped > 0 {
            info!(
                generation = self.generation,
                dropped,
                "暂存消息所属分区已不在分配中，丢弃且不确认"
            );
        }

        let driver = SessionDriver {
            consumer: self.consumer.clone(),
            topic: self.topic.clone(),
            assignment,
            router: PartitionRouter {
                senders,
                carry_over: self.carry_over.clone(),
            },
            check_interval: self.check_interval,
        };
        let handle = tokio::spawn(driver.run(pending, shutdown.clone()));

        Ok(Some(GroupSession {
            generation: self.generation,
            claims,
            acknowledger: Arc::new(OffsetAcknowledger {
                consumer: self.consumer.clone(),
            }),
            driver: Some(handle),
        }))
    }
}

type CarryOver = Arc<Mutex<VecDeque<ConsumerMessage>>>;

/// 按分配拆分暂存消息，返回仍可投递的消息（保持到达顺序）与丢弃条数
fn split_pending(
    carried: Vec<ConsumerMessage>,
    assignment: &BTreeSet<i32>,
) -> (Vec<ConsumerMessage>, usize) {
    let total = carried.len();
    let pending: Vec<_> = carried
        .into_iter()
        .filter(|message| assignment.contains(&message.partition))
        .collect();
    let dropped = total - pending.len();
    (pending, dropped)
}

/// 把消息按分区投递到认领通道
struct PartitionRouter {
    senders: HashMap<i32, mpsc::Sender<ConsumerMessage>>,
    carry_over: CarryOver,
}

impl PartitionRouter {
    /// 投递到对应分区的认领，返回 false 表示会话应结束
    ///
    /// 无法投递的消息进入暂存队列，留给下一轮会话。
    async fn route(&self, message: ConsumerMessage) -> bool {
        let Some(tx) = self.senders.get(&message.partition) else {
            info!(
                coordinates = %message.coordinates(),
                "收到不属于当前分配的消息，结束会话以重新加入"
            );
            self.carry_over.lock().push_back(message);
            return false;
        };

        if let Err(mpsc::error::SendError(message)) = tx.send(message).await {
            debug!(coordinates = %message.coordinates(), "分区认领已关闭，停止路由");
            self.carry_over.lock().push_back(message);
            return false;
        }
        true
    }

    /// 依次投递暂存消息，中途失败时剩余消息按原顺序放回暂存队列
    async fn route_pending(&self, pending: Vec<ConsumerMessage>) -> bool {
        let mut pending = pending.into_iter();
        while let Some(message) = pending.next() {
            if !self.route(message).await {
                self.carry_over.lock().extend(pending);
                return false;
            }
        }
        true
    }
}

/// 单轮会话的消息路由任务
struct SessionDriver {
    consumer: Arc<StreamConsumer>,
    topic: String,
    assignment: BTreeSet<i32>,
    router: PartitionRouter,
    check_interval: Duration,
}

impl SessionDriver {
    async fn run(
        self,
        pending: Vec<ConsumerMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if !self.router.route_pending(pending).await {
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }

                _ = ticker.tick() => {
                    let current = current_assignment(&self.consumer, &self.topic)?;
                    if assignment_changed(&self.assignment, &current) {
                        info!(
                            previous = ?self.assignment,
                            current = ?current,
                            "检测到分区再均衡，结束当前会话"
                        );
                        return Ok(());
                    }
                }

                received = recv_owned(&self.consumer) => {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => {
                            check_fatal(&e)?;
                            continue;
                        }
                    };
                    if !self.router.route(message).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn assignment_changed(previous: &BTreeSet<i32>, current: &BTreeSet<i32>) -> bool {
    previous != current
}

/// 确认某条消息后应存储的位点列表
///
/// `store_offsets` 按字面值存储，因此这里给出下一条待消费位点 `offset + 1`。
fn commit_position(message: &ConsumerMessage) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(
        &message.topic,
        message.partition,
        Offset::Offset(message.offset + 1),
    )?;
    Ok(list)
}

/// 通过存储位点确认消息，提交由自动提交完成
struct OffsetAcknowledger {
    consumer: Arc<StreamConsumer>,
}

impl Acknowledger for OffsetAcknowledger {
    fn ack(&self, message: &ConsumerMessage) -> Result<()> {
        let position = commit_position(message)
            .map_err(|e| CartError::Kafka(format!("构造位点失败: {e}")))?;
        self.consumer
            .store_offsets(&position)
            .map_err(|e| CartError::Kafka(format!("存储位点失败: {e}")))
    }

    fn nack(&self, message: &ConsumerMessage, reason: &CartError) {
        error!(
            coordinates = %message.coordinates(),
            error = %reason,
            "消息未确认，位点不推进"
        );
    }
}

/// 拉取一条消息并立即复制为自有数据，借用的消息不跨越 await
async fn recv_owned(consumer: &StreamConsumer) -> std::result::Result<ConsumerMessage, KafkaError> {
    consumer
        .recv()
        .await
        .map(|borrowed| ConsumerMessage::from_borrowed(&borrowed))
}

fn current_assignment(consumer: &StreamConsumer, topic: &str) -> Result<BTreeSet<i32>> {
    let list = consumer
        .assignment()
        .map_err(|e| CartError::Consumer(format!("读取分区分配失败: {e}")))?;
    Ok(partitions_for_topic(&list, topic))
}

fn partitions_for_topic(list: &TopicPartitionList, topic: &str) -> BTreeSet<i32> {
    list.elements_for_topic(topic)
        .iter()
        .map(|elem| elem.partition())
        .collect()
}

/// 致命错误终止会话，其余错误只记录
fn check_fatal(e: &KafkaError) -> Result<()> {
    if e.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) {
        return Err(CartError::Consumer(format!("Kafka 致命错误: {e}")));
    }
    warn!(error = %e, "接收 Kafka 消息出错");
    Ok(())
}
