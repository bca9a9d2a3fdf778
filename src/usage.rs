//! Usage metering for billing.
//!
//! The request path only ever calls [`UsageRecorder::record`], which is a
//! non-blocking `try_send` into a bounded queue. A single drain task owns
//! the sink. Sink failures are retried a few times and then logged and
//! dropped; they never reach the caller.

use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http::{Method, StatusCode};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    sync::{
        Mutex,
        mpsc::{self, Receiver, Sender, error::TrySendError},
    },
    task::JoinHandle,
};
use uuid::Uuid;

use crate::config::{UsageConfig, UsageSinkConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Error,
    /// The caller disconnected before the backend answered.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub subject_id: String,
    pub product: String,
    pub endpoint: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: UsageOutcome,
    /// Backend status, absent when the backend could not be reached.
    pub status: Option<u16>,
}

impl UsageEvent {
    pub fn new(
        subject_id: &str,
        product: &str,
        endpoint: &str,
        method: &Method,
        status: Option<StatusCode>,
    ) -> Self {
        let outcome = match status {
            Some(s) if !s.is_client_error() && !s.is_server_error() => UsageOutcome::Success,
            _ => UsageOutcome::Error,
        };

        Self {
            id: Uuid::new_v4(),
            subject_id: subject_id.to_string(),
            product: product.to_string(),
            endpoint: endpoint.to_string(),
            method: method.as_str().to_string(),
            timestamp: Utc::now(),
            outcome,
            status: status.map(|s| s.as_u16()),
        }
    }

    pub fn cancelled(mut self) -> Self {
        self.outcome = UsageOutcome::Cancelled;
        self.status = None;
        self
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn append(&self, event: &UsageEvent) -> anyhow::Result<()>;
}

/// Emits each event as a structured log record.
pub struct LogSink;

#[async_trait]
impl UsageSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn append(&self, event: &UsageEvent) -> anyhow::Result<()> {
        tracing::info!(
            target: "usage",
            event_id = %event.id,
            subject = %event.subject_id,
            product = %event.product,
            method = %event.method,
            endpoint = %event.endpoint,
            status = ?event.status,
            "usage recorded"
        );
        Ok(())
    }
}

/// Appends JSON lines to a local file.
pub struct JsonlFileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl UsageSink for JsonlFileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn append(&self, event: &UsageEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Appends to a Redis stream read by the billing aggregator.
pub struct RedisStreamSink {
    manager: ConnectionManager,
    stream_key: String,
}

impl RedisStreamSink {
    pub async fn new(url: &str, stream_key: String) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect usage sink to redis")?;
        Ok(Self {
            manager,
            stream_key,
        })
    }
}

#[async_trait]
impl UsageSink for RedisStreamSink {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn append(&self, event: &UsageEvent) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(event)?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("event_id")
            .arg(event.id.to_string())
            .arg("event")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

pub async fn sink_from_config(cfg: &UsageSinkConfig) -> anyhow::Result<Arc<dyn UsageSink>> {
    Ok(match cfg {
        UsageSinkConfig::Log => Arc::new(LogSink),
        UsageSinkConfig::File { path } => Arc::new(JsonlFileSink::new(path.clone())),
        UsageSinkConfig::Redis { url, stream_key } => {
            Arc::new(RedisStreamSink::new(url, stream_key.clone()).await?)
        }
    })
}

/// Distinct subjects remembered per product. Beyond this the count is a
/// lower bound and the snapshot says so.
const MAX_TRACKED_SUBJECTS: usize = 10_000;

#[derive(Debug, Default)]
struct ProductTotals {
    requests: u64,
    errors: u64,
    subjects: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductUsage {
    pub requests: u64,
    pub errors: u64,
    pub subjects: usize,
    pub subjects_capped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub enqueued: u64,
    pub appended: u64,
    pub dropped: u64,
    pub active_subjects: usize,
    pub products: BTreeMap<String, ProductUsage>,
}

/// In-process aggregate of everything the drain task has seen.
#[derive(Debug)]
pub struct UsageStats {
    enqueued: AtomicU64,
    appended: AtomicU64,
    dropped: AtomicU64,
    products: DashMap<String, ProductTotals>,
    subject_cap: usize,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self::with_subject_cap(MAX_TRACKED_SUBJECTS)
    }
}

impl UsageStats {
    fn with_subject_cap(subject_cap: usize) -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            appended: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            products: DashMap::new(),
            subject_cap,
        }
    }

    fn observe(&self, event: &UsageEvent) {
        let mut totals = self.products.entry(event.product.clone()).or_default();
        totals.requests += 1;
        if event.outcome == UsageOutcome::Error {
            totals.errors += 1;
        }
        if totals.subjects.len() < self.subject_cap && !totals.subjects.contains(&event.subject_id)
        {
            totals.subjects.insert(event.subject_id.clone());
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let mut subjects = HashSet::new();
        let mut products = BTreeMap::new();
        for entry in self.products.iter() {
            subjects.extend(entry.subjects.iter().cloned());
            products.insert(entry.key().clone(), ProductUsage {
                requests: entry.requests,
                errors: entry.errors,
                subjects: entry.subjects.len(),
                subjects_capped: entry.subjects.len() >= self.subject_cap,
            });
        }

        UsageSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            appended: self.appended.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            active_subjects: subjects.len(),
            products,
        }
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    sender: Sender<UsageEvent>,
    stats: Arc<UsageStats>,
}

/// Receiving half of the usage queue, consumed by [`UsageDrain::spawn`].
pub struct UsageDrain {
    receiver: Receiver<UsageEvent>,
    stats: Arc<UsageStats>,
}

impl UsageRecorder {
    pub fn new(capacity: usize) -> (Self, UsageDrain) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(UsageStats::default());
        (
            Self {
                sender,
                stats: stats.clone(),
            },
            UsageDrain { receiver, stats },
        )
    }

    pub async fn from_config(cfg: &UsageConfig) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let sink = sink_from_config(&cfg.sink).await?;
        let (recorder, drain) = Self::new(cfg.queue_capacity);
        Ok((recorder, drain.spawn(sink, cfg.max_attempts)))
    }

    /// Never blocks and never fails the caller.
    pub fn record(&self, event: UsageEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_id = %event.id,
                    subject = %event.subject_id,
                    product = %event.product,
                    "usage queue full; dropping event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event_id = %event.id, "usage queue closed; dropping event");
            }
        }
    }

    pub fn stats(&self) -> Arc<UsageStats> {
        self.stats.clone()
    }
}

impl UsageDrain {
    pub fn spawn(self, sink: Arc<dyn UsageSink>, max_attempts: u32) -> JoinHandle<()> {
        tokio::spawn(self.run(sink, max_attempts.max(1)))
    }

    async fn run(mut self, sink: Arc<dyn UsageSink>, max_attempts: u32) {
        tracing::info!(sink = sink.name(), "usage drain started");
        while let Some(event) = self.receiver.recv().await {
            self.stats.observe(&event);
            if append_with_retry(sink.as_ref(), &event, max_attempts).await {
                self.stats.appended.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::info!(sink = sink.name(), "usage queue closed, drain exiting");
    }
}

async fn append_with_retry(sink: &dyn UsageSink, event: &UsageEvent, max_attempts: u32) -> bool {
    let mut backoff = Duration::from_millis(50);
    for attempt in 1..=max_attempts {
        match sink.append(event).await {
            Ok(()) => return true,
            Err(err) if attempt < max_attempts => {
                tracing::warn!(
                    event_id = %event.id,
                    sink = sink.name(),
                    attempt,
                    error = %err,
                    "usage append failed; retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => {
                tracing::error!(
                    event_id = %event.id,
                    subject = %event.subject_id,
                    product = %event.product,
                    sink = sink.name(),
                    error = %err,
                    "usage append failed; dropping event"
                );
            }
        }
    }
    false
}
