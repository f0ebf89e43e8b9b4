//! 订单完成事件消费者装配
//!
//! 组合消费组（拉取与认领）、OrderCompletedHandler（业务处理）
//! 和 DlqProducer（死信投递），形成完整的消费管道。

use std::sync::Arc;

use tracing::info;

use cart_shared::config::AppConfig;
use cart_shared::dlq::DlqProducer;
use cart_shared::error::Result;
use cart_shared::kafka::{ConsumerGroup, GroupConsumer, KafkaConsumerGroup, KafkaProducer};
use cart_shared::retry::RetryPolicy;

use crate::order_completed::OrderCompletedHandler;
use crate::store::CartStore;

/// 在任意消费组实现上挂载订单完成处理器
pub fn order_completed_consumer<G: ConsumerGroup>(
    group: G,
    store: CartStore,
    retry_policy: RetryPolicy,
) -> GroupConsumer<G> {
    let handler = Arc::new(OrderCompletedHandler::new(store));
    GroupConsumer::new(group, handler).with_retry_policy(retry_policy)
}

/// 基于 Kafka 的生产装配：rdkafka 消费组 + 死信 topic
pub fn build_kafka_consumer(
    config: &AppConfig,
    store: CartStore,
) -> Result<GroupConsumer<KafkaConsumerGroup>> {
    let group = KafkaConsumerGroup::new(&config.kafka)?;
    let producer = KafkaProducer::new(&config.kafka)?;
    let dlq = Arc::new(DlqProducer::new(
        producer,
        config.kafka.dead_letter_topic.clone(),
        config.service_name.clone(),
    ));

    info!(
        topic = %config.kafka.orders_topic,
        group_id = %config.kafka.consumer_group,
        dead_letter_topic = %config.kafka.dead_letter_topic,
        max_retries = config.consumer.max_retries,
        "订单完成事件消费者已装配"
    );

    Ok(
        order_completed_consumer(group, store, RetryPolicy::from(&config.consumer))
            .with_dead_letter(dlq),
    )
}
