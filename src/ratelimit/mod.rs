//! Fixed-window admission control.
//!
//! Counters are keyed by `(subject, floor(now / window))` and live in a
//! [`CounterStore`] that increments and sets expiry in one atomic step.
//! Rejected requests keep their increment, so a client hammering the
//! gateway after being limited does not get its budget back early.
//!
//! A fixed window allows up to twice the limit across a window boundary.
//! That is a known property of the scheme, not a defect.

pub mod in_memory;
pub mod redis_backend;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use async_trait::async_trait;

use crate::{
    error::{GatewayError, GatewayResult},
    identity::Plan,
};

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` and returns the post-increment value. A missing key
    /// starts at zero and expires after `ttl`.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> GatewayResult<u64>;

    /// Current value of `key`, zero when absent or expired.
    async fn count(&self, key: &str) -> GatewayResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        count: u64,
        limit: u64,
        reset_after_secs: u64,
    },
    Rejected {
        count: u64,
        limit: u64,
        retry_after_secs: u64,
    },
}

#[derive(Debug, Clone)]
pub struct PlanLimits {
    limits: HashMap<Plan, u64>,
    most_restrictive: u64,
}

impl PlanLimits {
    pub fn new(limits: HashMap<Plan, u64>) -> Self {
        let most_restrictive = limits.values().copied().min().unwrap_or(0);
        Self {
            limits,
            most_restrictive,
        }
    }

    /// Plans without an entry (including [`Plan::Unknown`]) fall back to the
    /// smallest configured limit.
    pub fn limit_for(&self, plan: Plan) -> u64 {
        self.limits
            .get(&plan)
            .copied()
            .unwrap_or(self.most_restrictive)
    }
}

#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    window_secs: u64,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, window_secs: u64) -> Self {
        Self {
            store,
            window_secs: window_secs.max(1),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub async fn admit(&self, subject_id: &str, limit: u64) -> GatewayResult<Admission> {
        self.admit_at(subject_id, limit, unix_now()?).await
    }

    pub async fn admit_at(
        &self,
        subject_id: &str,
        limit: u64,
        now_secs: u64,
    ) -> GatewayResult<Admission> {
        let bucket = now_secs / self.window_secs;
        let key = window_key(subject_id, bucket);
        let ttl = Duration::from_secs(self.window_secs + 1);

        let count = self.store.incr_with_expiry(&key, ttl).await?;
        let window_end = (bucket + 1) * self.window_secs;
        let until_reset = window_end.saturating_sub(now_secs).max(1);

        if count > limit {
            Ok(Admission::Rejected {
                count,
                limit,
                retry_after_secs: until_reset,
            })
        } else {
            Ok(Admission::Admitted {
                count,
                limit,
                reset_after_secs: until_reset,
            })
        }
    }

    pub async fn window_count(&self, subject_id: &str, now_secs: u64) -> GatewayResult<u64> {
        let bucket = now_secs / self.window_secs;
        self.store.count(&window_key(subject_id, bucket)).await
    }
}

fn window_key(subject_id: &str, bucket: u64) -> String {
    format!("{subject_id}:{bucket}")
}

pub(crate) fn unix_now() -> GatewayResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| GatewayError::Internal(e.to_string()))
}
