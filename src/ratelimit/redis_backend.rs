use std::time::Duration;

use async_trait::async_trait;
use redis::{
    AsyncCommands,
    Script,
    aio::ConnectionManager,
};

use crate::{
    error::GatewayResult,
    ratelimit::CounterStore,
};

// INCR and EXPIRE run as one script so the window can never be created
// without its expiry, and no two gateways can observe the same count.
const INCR_WITH_EXPIRY_LUA: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Counter store shared by every gateway instance.
pub struct RedisCounterStore {
    manager: ConnectionManager,
    key_prefix: String,
    script: Script,
}

impl RedisCounterStore {
    pub async fn new(url: String, key_prefix: String) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            script: Script::new(INCR_WITH_EXPIRY_LUA),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> GatewayResult<u64> {
        let mut conn = self.manager.clone();
        let count: i64 = self
            .script
            .key(self.key(key))
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count(&self, key: &str) -> GatewayResult<u64> {
        let mut conn = self.manager.clone();
        let count: Option<u64> = conn.get(self.key(key)).await?;
        Ok(count.unwrap_or(0))
    }
}
