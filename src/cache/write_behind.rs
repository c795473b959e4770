//! Write-Behind Queue
//!
//! Backing-store writes acknowledged before they are applied. Operations are
//! routed to one of a fixed set of workers by key hash, each worker owning a
//! bounded channel, so operations on one key are applied in submission order
//! while different keys proceed in parallel.
//!
//! Backpressure: a producer facing a full channel waits up to
//! `enqueue_timeout_ms` and then gets [`Error::WriteBehindSaturated`].
//! Operations still queued when the process dies are lost.
//!
//! Until a key's operations have been applied, [`WriteBehindQueue::pending`]
//! reports the latest one, so readers never load a record from the backing
//! store that a queued write has already replaced or deleted.

use crate::cache::events::{CacheEvent, EventBus};
use crate::cache::metrics::CacheMetrics;
use crate::cache::retry::{with_retry, RetryConfig};
use crate::cache::shard::hash_key;
use crate::domain::ports::SharedBackingStore;
use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Kind of deferred mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

/// A mutation waiting to be applied to the backing store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBehindOperation {
    pub op: WriteOp,
    /// Logical key
    pub key: String,
    /// Value to write; `None` for deletes
    pub payload: Option<Bytes>,
    pub enqueued_at: DateTime<Utc>,
}

impl WriteBehindOperation {
    pub fn upsert(op: WriteOp, key: impl Into<String>, payload: Bytes) -> Self {
        Self {
            op,
            key: key.into(),
            payload: Some(payload),
            enqueued_at: Utc::now(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: WriteOp::Delete,
            key: key.into(),
            payload: None,
            enqueued_at: Utc::now(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBehindConfig {
    /// Number of workers (and channels)
    pub workers: usize,
    /// Capacity of each worker's channel
    pub queue_capacity: usize,
    /// How long a producer may wait for room
    pub enqueue_timeout_ms: u64,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            enqueue_timeout_ms: 100,
        }
    }
}

/// Latest queued mutation of a key that the workers have not applied yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Upsert(Bytes),
    Delete,
}

#[derive(Debug)]
struct Queued {
    count: usize,
    latest: PendingWrite,
}

/// Per-key count of queued operations plus the most recent one
#[derive(Debug, Default)]
struct PendingWrites {
    keys: DashMap<String, Queued>,
}

impl PendingWrites {
    fn register(&self, operation: &WriteBehindOperation) {
        let latest = match &operation.payload {
            Some(payload) if operation.op != WriteOp::Delete => PendingWrite::Upsert(payload.clone()),
            _ => PendingWrite::Delete,
        };
        let mut queued = self
            .keys
            .entry(operation.key.clone())
            .or_insert_with(|| Queued {
                count: 0,
                latest: PendingWrite::Delete,
            });
        queued.count += 1;
        queued.latest = latest;
    }

    fn settle(&self, key: &str) {
        if let Some(mut queued) = self.keys.get_mut(key) {
            queued.count = queued.count.saturating_sub(1);
        }
        self.keys.remove_if(key, |_, queued| queued.count == 0);
    }

    fn latest(&self, key: &str) -> Option<PendingWrite> {
        self.keys.get(key).map(|queued| queued.latest.clone())
    }
}

enum Message {
    Apply(WriteBehindOperation),
    /// Answered once everything queued before it has been applied
    Barrier(oneshot::Sender<()>),
}

/// Bounded write-behind queue with a fixed worker pool
pub struct WriteBehindQueue {
    senders: RwLock<Option<Vec<mpsc::Sender<Message>>>>,
    pending: Arc<PendingWrites>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: WriteBehindConfig,
    metrics: Arc<CacheMetrics>,
}

impl WriteBehindQueue {
    /// Spawn the workers; must be called inside a tokio runtime
    pub fn start(
        config: WriteBehindConfig,
        store: SharedBackingStore,
        retry: RetryConfig,
        metrics: Arc<CacheMetrics>,
        events: EventBus,
    ) -> Self {
        let worker_count = config.workers.max(1);
        let pending = Arc::new(PendingWrites::default());
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(
                id,
                rx,
                Arc::clone(&store),
                Arc::clone(&pending),
                retry.clone(),
                Arc::clone(&metrics),
                events.clone(),
            )));
        }

        info!(
            workers = worker_count,
            queue_capacity = config.queue_capacity,
            "Write-behind workers started"
        );

        Self {
            senders: RwLock::new(Some(senders)),
            pending,
            workers: Mutex::new(workers),
            config,
            metrics,
        }
    }

    fn sender_for(&self, key: &str) -> Result<mpsc::Sender<Message>> {
        let guard = self.senders.read();
        let senders = guard.as_ref().ok_or(Error::WriteBehindClosed)?;
        let idx = (hash_key(key) % senders.len() as u64) as usize;
        Ok(senders[idx].clone())
    }

    /// Queue an operation, waiting for room up to the configured timeout
    pub async fn enqueue(&self, operation: WriteBehindOperation) -> Result<()> {
        let sender = self.sender_for(&operation.key)?;
        let key = operation.key.clone();
        let wait = Duration::from_millis(self.config.enqueue_timeout_ms);
        let wb = &self.metrics.write_behind;

        wb.depth.fetch_add(1, Ordering::AcqRel);
        self.pending.register(&operation);
        match sender.send_timeout(Message::Apply(operation), wait).await {
            Ok(()) => {
                wb.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.pending.settle(&key);
                wb.depth.fetch_sub(1, Ordering::AcqRel);
                wb.saturated.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, waited_ms = self.config.enqueue_timeout_ms, "Write-behind queue saturated");
                Err(Error::WriteBehindSaturated {
                    key,
                    waited_ms: self.config.enqueue_timeout_ms,
                })
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.pending.settle(&key);
                wb.depth.fetch_sub(1, Ordering::AcqRel);
                Err(Error::WriteBehindClosed)
            }
        }
    }

    /// Wait until everything enqueued before this call has been applied
    pub async fn flush(&self) -> Result<()> {
        let senders = self
            .senders
            .read()
            .as_ref()
            .cloned()
            .ok_or(Error::WriteBehindClosed)?;

        let mut acks = Vec::with_capacity(senders.len());
        for sender in senders {
            let (tx, rx) = oneshot::channel();
            sender
                .send(Message::Barrier(tx))
                .await
                .map_err(|_| Error::WriteBehindClosed)?;
            acks.push(rx);
        }
        for ack in acks {
            ack.await.map_err(|_| Error::WriteBehindClosed)?;
        }
        Ok(())
    }

    /// Stop accepting, apply what is queued and join the workers
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let Some(senders) = self.senders.write().take() else {
            return;
        };
        drop(senders);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Write-behind worker panicked");
            }
        }
        info!("Write-behind queue drained");
    }

    /// Latest queued operation on `key`, if any is still waiting
    pub fn pending(&self, key: &str) -> Option<PendingWrite> {
        self.pending.latest(key)
    }

    /// Operations queued or being applied
    pub fn depth(&self) -> u64 {
        self.metrics.write_behind.depth.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.senders.read().is_some()
    }

    pub fn config(&self) -> &WriteBehindConfig {
        &self.config
    }
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<Message>,
    store: SharedBackingStore,
    pending: Arc<PendingWrites>,
    retry: RetryConfig,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
) {
    debug!(worker = id, "Write-behind worker running");
    while let Some(message) = rx.recv().await {
        match message {
            Message::Apply(operation) => {
                apply(&operation, &store, &retry, &metrics, &events).await;
                pending.settle(&operation.key);
                metrics.write_behind.depth.fetch_sub(1, Ordering::AcqRel);
            }
            Message::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(worker = id, "Write-behind worker stopped");
}

async fn apply(
    operation: &WriteBehindOperation,
    store: &SharedBackingStore,
    retry: &RetryConfig,
    metrics: &CacheMetrics,
    events: &EventBus,
) {
    let key = operation.key.as_str();
    let result = match (&operation.op, &operation.payload) {
        (WriteOp::Delete, _) => with_retry(retry, "write_behind_remove", || store.remove(key)).await,
        (_, Some(payload)) => {
            with_retry(retry, "write_behind_store", || store.store(key, payload.clone())).await
        }
        (op, None) => Err(Error::Internal(format!("{:?} of {} has no payload", op, key))),
    };

    match result {
        Ok(()) => {
            metrics.write_behind.applied.fetch_add(1, Ordering::Relaxed);
            let lag_ms = (Utc::now() - operation.enqueued_at).num_milliseconds();
            debug!(key = %key, op = ?operation.op, lag_ms, "Write-behind applied");
        }
        Err(e) => {
            metrics.write_behind.failed.fetch_add(1, Ordering::Relaxed);
            error!(key = %key, op = ?operation.op, error = %e, "Write-behind operation lost");
            events.publish(CacheEvent::WriteBehindFailed {
                key: key.to_string(),
                error: e.to_string(),
            });
        }
    }
}
