use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    error::GatewayResult,
    ratelimit::CounterStore,
};

/// Single-instance counter store. Each increment runs under the DashMap
/// shard lock for its key, so concurrent callers never read the same
/// pre-increment value.
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<DashMap<String, Counter>>,
}

struct Counter {
    count: u64,
    expires_at: Instant,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired counter. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.expires_at > now);
        before.saturating_sub(self.counters.len())
    }

    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, "purged expired rate-limit windows");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> GatewayResult<u64> {
        let now = Instant::now();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Counter {
                count: 0,
                expires_at: now + ttl,
            });

        if counter.expires_at <= now {
            counter.count = 0;
            counter.expires_at = now + ttl;
        }
        counter.count += 1;
        Ok(counter.count)
    }

    async fn count(&self, key: &str) -> GatewayResult<u64> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.count)
            .unwrap_or(0))
    }
}
