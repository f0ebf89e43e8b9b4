//! 应用状态

use tokio::sync::watch;

use cart_shared::kafka::ConsumerState;

use crate::store::CartStore;

/// 路由共享状态，克隆成本低
#[derive(Clone)]
pub struct AppState {
    pub store: CartStore,
    pub service_name: String,
    /// 消费者未启用时为 None
    pub consumer_state: Option<watch::Receiver<ConsumerState>>,
}

impl AppState {
    pub fn new(store: CartStore, service_name: impl Into<String>) -> Self {
        Self {
            store,
            service_name: service_name.into(),
            consumer_state: None,
        }
    }

    pub fn with_consumer_state(mut self, state: watch::Receiver<ConsumerState>) -> Self {
        self.consumer_state = Some(state);
        self
    }
}
