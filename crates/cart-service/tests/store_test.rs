//! CartStore 行为测试
//!
//! 使用内存仓储验证购物车操作的可观察性质与并发下的版本比较语义。

use std::sync::Arc;

use cart_service::models::{Cart, LineItem};
use cart_service::repository::InMemoryCartRepository;
use cart_service::store::{CartStore, ClearOutcome};
use cart_shared::error::CartError;
use cart_shared::test_utils::test_cart_id;
use tokio_test::{assert_err, assert_ok};

fn new_store() -> CartStore {
    CartStore::new(Arc::new(InMemoryCartRepository::new()), 16)
}

#[tokio::test]
async fn test_add_item_sums_same_item() {
    let store = new_store();
    let cart_id = test_cart_id();

    store.add_item(&cart_id, LineItem::new(10, 2)).await.unwrap();
    store.add_item(&cart_id, LineItem::new(10, 3)).await.unwrap();

    let cart = store.get(&cart_id).await.unwrap();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.item(10).unwrap().quantity, 5);
    assert_eq!(cart.version, 2);
}

#[tokio::test]
async fn test_add_item_total_independent_of_split() {
    let store = new_store();
    let split = test_cart_id();
    let single = test_cart_id();

    store.add_item(&split, LineItem::new(7, 4)).await.unwrap();
    store.add_item(&split, LineItem::new(7, 9)).await.unwrap();
    store.add_item(&single, LineItem::new(7, 13)).await.unwrap();

    let split = store.get(&split).await.unwrap();
    let single = store.get(&single).await.unwrap();
    assert_eq!(split.item(7).unwrap().quantity, single.item(7).unwrap().quantity);
}

#[tokio::test]
async fn test_update_missing_item_is_not_found() {
    let store = new_store();
    let cart_id = test_cart_id();
    store.add_item(&cart_id, LineItem::new(3, 1)).await.unwrap();

    let err = store
        .update_item(&cart_id, 10, LineItem::new(10, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CartError::NotFound { .. }));

    // 购物车不存在同样是 NotFound
    let err = store
        .update_item(&test_cart_id(), 10, LineItem::new(10, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CartError::NotFound { .. }));
}

#[tokio::test]
async fn test_deleted_item_never_returned() {
    let store = new_store();
    let cart_id = test_cart_id();
    store.add_item(&cart_id, LineItem::new(1, 1)).await.unwrap();
    store.add_item(&cart_id, LineItem::new(2, 1)).await.unwrap();

    let after = store.delete_item(&cart_id, 1).await.unwrap().unwrap();
    assert!(after.item(1).is_none());
    assert!(store.get(&cart_id).await.unwrap().item(1).is_none());

    // 删除不存在的商品是空操作
    let again = store.delete_item(&cart_id, 1).await.unwrap().unwrap();
    assert_eq!(again.version, after.version);
    assert!(store.delete_item(&test_cart_id(), 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let store = new_store();
    let cart_id = test_cart_id();
    store.add_item(&cart_id, LineItem::new(1, 1)).await.unwrap();

    assert_ok!(store.delete(&cart_id).await);
    assert_ok!(store.delete(&cart_id).await);
    let err = assert_err!(store.get(&cart_id).await);
    assert!(matches!(err, CartError::NotFound { .. }));
}

#[tokio::test]
async fn test_update_upserts_and_replaces() {
    let store = new_store();
    let cart_id = test_cart_id();

    let mut cart = Cart::empty(&cart_id);
    cart.customer_id = Some("u-1".into());
    cart.items = vec![LineItem::new(1, 2)];
    let created = store.update(cart.clone()).await.unwrap();
    assert_eq!(created.version, 1);

    cart.items = vec![LineItem::new(2, 1)];
    let replaced = store.update(cart).await.unwrap();
    assert_eq!(replaced.version, 2);
    assert!(replaced.item(1).is_none());
    assert_eq!(replaced.item(2).unwrap().quantity, 1);
}

#[tokio::test]
async fn test_clear_is_idempotent_per_order() {
    let store = new_store();
    let cart_id = test_cart_id();
    store.add_item(&cart_id, LineItem::new(10, 2)).await.unwrap();

    assert_eq!(
        store.clear(&cart_id, "o-1").await.unwrap(),
        ClearOutcome::Cleared
    );
    let first = store.get(&cart_id).await.unwrap();

    assert_eq!(
        store.clear(&cart_id, "o-1").await.unwrap(),
        ClearOutcome::AlreadyCleared
    );
    let second = store.get(&cart_id).await.unwrap();

    assert!(second.items.is_empty());
    assert_eq!(first, second);
    assert_eq!(second.last_completed_order.as_deref(), Some("o-1"));

    assert_eq!(
        store.clear(&test_cart_id(), "o-1").await.unwrap(),
        ClearOutcome::Absent
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_lose_no_update() {
    let store = new_store();
    let cart_id = test_cart_id();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let store = store.clone();
            let cart_id = cart_id.clone();
            tokio::spawn(async move { store.add_item(&cart_id, LineItem::new(10, 1)).await })
        })
        .collect();

    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => {}
            Err(CartError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let cart = store.get(&cart_id).await.unwrap();
    assert_eq!(cart.item(10).unwrap().quantity, 20 - conflicts);
    assert_eq!(cart.version, u64::from(20 - conflicts));
}

/// 并发的添加与订单清空：结果是两种串行顺序之一
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_and_clear_race_ends_in_serial_outcome() {
    for _ in 0..20 {
        let store = new_store();
        let cart_id = test_cart_id();
        store.add_item(&cart_id, LineItem::new(5, 2)).await.unwrap();

        let add = {
            let store = store.clone();
            let cart_id = cart_id.clone();
            tokio::spawn(async move { store.add_item(&cart_id, LineItem::new(10, 1)).await })
        };
        let clear = {
            let store = store.clone();
            let cart_id = cart_id.clone();
            tokio::spawn(async move { store.clear(&cart_id, "o-race").await })
        };
        add.await.unwrap().unwrap();
        assert_eq!(clear.await.unwrap().unwrap(), ClearOutcome::Cleared);

        let cart = store.get(&cart_id).await.unwrap();
        let add_then_clear = cart.items.is_empty();
        let clear_then_add = cart.items.len() == 1 && cart.item(10).map(|i| i.quantity) == Some(1);
        assert!(
            add_then_clear || clear_then_add,
            "unexpected items: {:?}",
            cart.items
        );
        assert_eq!(cart.version, 3);
    }
}
