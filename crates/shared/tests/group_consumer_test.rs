//! 消费组状态机集成测试
//!
//! 使用内存消费组驱动 GroupConsumer，验证顺序、确认、重试、死信、再均衡与关闭语义。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use cart_shared::error::CartError;
use cart_shared::kafka::{ConsumerState, GroupConsumer};
use cart_shared::retry::RetryPolicy;
use cart_shared::test_utils::{
    InMemoryConsumerGroup, RecordingAcknowledger, RecordingDeadLetterSink, RecordingHandler,
    test_message,
};
use tokio::sync::watch;
use tokio_test::assert_ok;

const TOPIC: &str = "orders.completed";

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        multiplier: 2.0,
    }
}

fn store_failure() -> CartError {
    CartError::Store(redis::RedisError::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset",
    )))
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("等待条件超时");
}

#[tokio::test]
async fn test_messages_processed_in_order_and_acked() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack.clone()).with_generation(vec![
        (
            0,
            (0..3).map(|o| test_message(TOPIC, 0, o, "{}")).collect(),
        ),
        (1, vec![test_message(TOPIC, 1, 0, "{}")]),
    ]);
    let handler = Arc::new(RecordingHandler::new());

    let consumer = GroupConsumer::new(group, handler.clone()).with_retry_policy(fast_policy(0));
    let state = consumer.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| ack.acked().len() == 4).await;

    let partition0: Vec<i64> = handler
        .calls()
        .into_iter()
        .filter(|(p, _)| *p == 0)
        .map(|(_, o)| o)
        .collect();
    assert_eq!(partition0, vec![0, 1, 2]);
    assert!(ack.nacked().is_empty());

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());
    assert_eq!(*state.borrow(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_transient_failure_retried_then_acked() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack.clone())
        .with_generation(vec![(0, vec![test_message(TOPIC, 0, 5, "{}")])]);

    let failures = Arc::new(AtomicU32::new(0));
    let f = failures.clone();
    let handler = Arc::new(RecordingHandler::new().failing_with(move |_| {
        if f.fetch_add(1, Ordering::SeqCst) < 2 {
            Some(store_failure())
        } else {
            None
        }
    }));
    let dlq = RecordingDeadLetterSink::new();

    let consumer = GroupConsumer::new(group, handler.clone())
        .with_retry_policy(fast_policy(3))
        .with_dead_letter(dlq.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| ack.acked() == vec![(0, 5)]).await;
    assert_eq!(handler.calls().len(), 3);
    assert!(dlq.records().is_empty());

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());
}

#[tokio::test]
async fn test_invalid_message_dead_lettered_without_retry() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack.clone()).with_generation(vec![(
        0,
        vec![
            test_message(TOPIC, 0, 0, "not json"),
            test_message(TOPIC, 0, 1, "{}"),
        ],
    )]);
    let handler = Arc::new(RecordingHandler::new().failing_with(|msg| {
        (msg.offset == 0).then(|| CartError::InvalidRequest("负载反序列化失败".to_string()))
    }));
    let dlq = RecordingDeadLetterSink::new();

    let consumer = GroupConsumer::new(group, handler.clone())
        .with_retry_policy(fast_policy(3))
        .with_dead_letter(dlq.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| ack.acked().len() == 2).await;

    let records = dlq.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].offset, 0);
    assert_eq!(records[0].error_code, "INVALID_REQUEST");
    assert_eq!(records[0].attempts, 1);
    // 坏消息不阻塞分区
    assert_eq!(ack.acked(), vec![(0, 0), (0, 1)]);
    assert_eq!(handler.calls(), vec![(0, 0), (0, 1)]);

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());
}

#[tokio::test]
async fn test_exhausted_retries_reach_dead_letter() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack.clone())
        .with_generation(vec![(2, vec![test_message(TOPIC, 2, 9, "{}")])]);
    let handler = Arc::new(RecordingHandler::new().failing_with(|_| Some(store_failure())));
    let dlq = RecordingDeadLetterSink::new();

    let consumer = GroupConsumer::new(group, handler.clone())
        .with_retry_policy(fast_policy(2))
        .with_dead_letter(dlq.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| !ack.acked().is_empty()).await;

    let records = dlq.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_code, "STORE_FAILURE");
    assert_eq!(records[0].attempts, 3);
    assert_eq!(handler.calls().len(), 3);

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());
}

#[tokio::test]
async fn test_dead_letter_failure_leaves_offset_unacked() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack.clone())
        .with_generation(vec![(0, vec![test_message(TOPIC, 0, 3, "{}")])]);
    let handler = Arc::new(
        RecordingHandler::new()
            .failing_with(|_| Some(CartError::InvalidRequest("cart_id 不能为空".to_string()))),
    );

    let consumer = GroupConsumer::new(group, handler)
        .with_retry_policy(fast_policy(1))
        .with_dead_letter(RecordingDeadLetterSink::unavailable());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| !ack.nacked().is_empty()).await;
    assert_eq!(ack.nacked(), vec![(0, 3)]);
    assert!(ack.acked().is_empty());

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());
}

#[tokio::test]
async fn test_rejoins_after_rebalance() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack.clone())
        .with_generation(vec![
            (0, vec![test_message(TOPIC, 0, 0, "{}")]),
            (1, vec![test_message(TOPIC, 1, 0, "{}")]),
        ])
        .with_generation(vec![(1, vec![test_message(TOPIC, 1, 1, "{}")])]);
    let handler = Arc::new(RecordingHandler::new());

    let consumer = GroupConsumer::new(group, handler.clone()).with_retry_policy(fast_policy(0));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| ack.acked().len() == 3).await;

    let mut acked = ack.acked();
    acked.sort();
    assert_eq!(acked, vec![(0, 0), (1, 0), (1, 1)]);

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());
}

#[tokio::test]
async fn test_join_failure_is_fatal() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack).fail_when_exhausted();
    let handler = Arc::new(RecordingHandler::new());

    let consumer = GroupConsumer::new(group, handler);
    let state = consumer.state();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = consumer.run(shutdown_rx).await;
    assert!(matches!(result, Err(CartError::Consumer(_))));
    assert_eq!(*state.borrow(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_message() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack.clone()).with_open_generation(vec![(
        0,
        (0..10).map(|o| test_message(TOPIC, 0, o, "{}")).collect(),
    )]);
    let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(30)));

    let consumer = GroupConsumer::new(group, handler.clone()).with_retry_policy(fast_policy(0));
    let state = consumer.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| !handler.calls().is_empty()).await;
    assert_eq!(*state.borrow(), ConsumerState::Claiming);

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());

    let calls = handler.calls();
    assert!(calls.len() < 10, "关闭后不应继续处理新消息");
    // 已开始处理的消息都已完成并确认
    assert_eq!(ack.acked(), calls);
    assert_eq!(*state.borrow(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_while_waiting_for_assignment() {
    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack);
    let consumer = GroupConsumer::new(group, Arc::new(RecordingHandler::new()));
    let state = consumer.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    let mut watcher = state.clone();
    tokio::time::timeout(
        Duration::from_secs(5),
        watcher.wait_for(|s| *s == ConsumerState::Joining),
    )
    .await
    .unwrap()
    .unwrap();

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());
    assert_eq!(*state.borrow(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_message_with_trace_headers_is_processed() {
    let mut traced = test_message(TOPIC, 0, 0, "{}");
    traced.headers.insert(
        "traceparent".to_string(),
        "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
    );
    let mut malformed = test_message(TOPIC, 0, 1, "{}");
    malformed
        .headers
        .insert("traceparent".to_string(), "not-a-trace".to_string());

    let ack = RecordingAcknowledger::new();
    let group = InMemoryConsumerGroup::new(TOPIC, ack.clone())
        .with_generation(vec![(0, vec![traced, malformed])]);
    let handler = Arc::new(RecordingHandler::new());

    let consumer = GroupConsumer::new(group, handler.clone()).with_retry_policy(fast_policy(0));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| ack.acked().len() == 2).await;
    assert_eq!(handler.calls(), vec![(0, 0), (0, 1)]);

    shutdown_tx.send(true).unwrap();
    assert_ok!(task.await.unwrap());
}
