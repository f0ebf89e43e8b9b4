//! Redis 购物车仓储
//!
//! 每个购物车一个 hash：`{key_prefix}{cart_id}` → `{version, data}`，
//! `data` 为购物车 JSON。版本比较与写入在同一个 Lua 脚本中原子完成。

use async_trait::async_trait;
use redis::Client;
use redis::aio::ConnectionManager;
use tracing::{debug, info, instrument};

use cart_shared::config::RedisConfig;
use cart_shared::error::{CartError, Result};

use super::traits::CartRepository;
use crate::models::Cart;

/// 版本匹配时写入：KEYS[1]=key, ARGV[1]=期望版本, ARGV[2]=新版本, ARGV[3]=数据
const COMPARE_AND_SWAP: &str = r#"
    local current = redis.call("HGET", KEYS[1], "version")
    if (current == false and ARGV[1] == "0") or current == ARGV[1] then
        redis.call("HSET", KEYS[1], "version", ARGV[2], "data", ARGV[3])
        return 1
    end
    return 0
"#;

pub struct RedisCartRepository {
    conn: ConnectionManager,
    key_prefix: String,
    cas_script: redis::Script,
}

impl RedisCartRepository {
    /// 建立连接；连接管理器断线后自动重连
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = client.get_connection_manager().await?;
        info!(key_prefix = %config.key_prefix, "Redis 购物车仓储已连接");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            cas_script: redis::Script::new(COMPARE_AND_SWAP),
        })
    }

    fn key(&self, cart_id: &str) -> String {
        format!("{}{}", self.key_prefix, cart_id)
    }
}

#[async_trait]
impl CartRepository for RedisCartRepository {
    #[instrument(skip(self))]
    async fn load(&self, cart_id: &str) -> Result<Option<Cart>> {
        let mut conn = self.conn.clone();
        let (version, data): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(self.key(cart_id))
            .arg("version")
            .arg("data")
            .query_async(&mut conn)
            .await?;

        let Some(data) = data else {
            return Ok(None);
        };

        let mut cart: Cart = serde_json::from_str(&data)?;
        cart.version = version.unwrap_or(cart.version);
        Ok(Some(cart))
    }

    #[instrument(skip(self, cart), fields(cart_id = %cart.id, version = cart.version))]
    async fn compare_and_swap(&self, cart: &Cart, expected_version: u64) -> Result<bool> {
        let data = serde_json::to_string(cart)?;
        let mut conn = self.conn.clone();

        let swapped: i32 = self
            .cas_script
            .key(self.key(&cart.id))
            .arg(expected_version)
            .arg(cart.version)
            .arg(data)
            .invoke_async(&mut conn)
            .await?;

        if swapped == 0 {
            debug!(expected_version, "版本不匹配，写入被拒绝");
        }
        Ok(swapped == 1)
    }

    #[instrument(skip(self))]
    async fn remove(&self, cart_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(cart_id))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(CartError::from)
    }
}
