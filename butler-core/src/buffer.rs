//! Durable Message Buffer (`spec.md` §4.7).
//!
//! Bounded in-memory queue (hot path) backed by a periodic database scanner
//! (cold path) for crash recovery. Bridges ingestion and the message
//! pipeline without ever blocking the ingest HTTP handler: a full queue is
//! not data loss, because the message is already durable in `message_inbox`
//! as `accepted` — the scanner will pick it up on its next sweep.
//!
//! Translates `original_source/src/butlers/core/buffer.py`'s
//! `asyncio.Queue` + worker-task + scanner-task triad onto
//! `tokio::sync::mpsc`'s bounded channel and `tokio::task::JoinHandle`s.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BufferConfig;
use crate::error::Result;
use crate::metrics::ButlerMetrics;
use crate::models::MessageRef;

/// What a buffer worker does with a dequeued [`MessageRef`]. Implemented by
/// the message pipeline (`spec.md` §4.8); kept as a trait so buffer tests
/// don't need a real pipeline.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message_ref: MessageRef) -> Result<()>;
}

/// Point-in-time counters for health reporting, mirroring the Python
/// original's `DurableBuffer.stats` property.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    pub queue_depth: i64,
    pub enqueue_hot_total: u64,
    pub enqueue_cold_total: u64,
    pub backpressure_total: u64,
    pub scanner_recovered_total: u64,
}

struct Counters {
    queue_depth: AtomicI64,
    enqueue_hot_total: std::sync::atomic::AtomicU64,
    enqueue_cold_total: std::sync::atomic::AtomicU64,
    backpressure_total: std::sync::atomic::AtomicU64,
    scanner_recovered_total: std::sync::atomic::AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            queue_depth: AtomicI64::new(0),
            enqueue_hot_total: std::sync::atomic::AtomicU64::new(0),
            enqueue_cold_total: std::sync::atomic::AtomicU64::new(0),
            backpressure_total: std::sync::atomic::AtomicU64::new(0),
            scanner_recovered_total: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

/// Bounded queue plus DB-backed recovery (`spec.md` §4.7).
pub struct DurableBuffer {
    config: BufferConfig,
    pool: Option<PgPool>,
    metrics: Arc<ButlerMetrics>,
    sender: mpsc::Sender<MessageRef>,
    receiver: std::sync::Mutex<Option<mpsc::Receiver<MessageRef>>>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    worker_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    scanner_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DurableBuffer {
    pub fn new(config: BufferConfig, pool: Option<PgPool>, metrics: Arc<ButlerMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        Self {
            config,
            pool,
            metrics,
            sender,
            receiver: std::sync::Mutex::new(Some(receiver)),
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
            worker_handles: std::sync::Mutex::new(Vec::new()),
            scanner_handle: std::sync::Mutex::new(None),
        }
    }

    /// Spawn worker tasks and, if a pool was supplied, the scanner task.
    pub fn start(&self, processor: Arc<dyn MessageProcessor>) {
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .expect("DurableBuffer::start called more than once");

        let shared_receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let mut handles = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            let receiver = shared_receiver.clone();
            let processor = processor.clone();
            let metrics = self.metrics.clone();
            let counters = self.counters.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, receiver, processor, metrics, counters, shutdown).await;
            }));
        }
        *self.worker_handles.lock().unwrap() = handles;

        if let Some(pool) = self.pool.clone() {
            let config = self.config.clone();
            let metrics = self.metrics.clone();
            let counters = self.counters.clone();
            let sender = self.sender.clone();
            let shutdown = self.shutdown.clone();
            let handle = tokio::spawn(async move {
                scanner_loop(config, pool, metrics, counters, sender, shutdown).await;
            });
            *self.scanner_handle.lock().unwrap() = Some(handle);
        }

        tracing::info!(
            workers = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            scanner_interval_s = self.config.scanner_interval_s,
            scanner_grace_s = self.config.scanner_grace_s,
            "DurableBuffer started"
        );
    }

    /// Hot path: `spec.md` §4.7 `enqueue(ref) -> bool`. Never blocks.
    pub fn enqueue(&self, message_ref: MessageRef) -> bool {
        match self.sender.try_send(message_ref) {
            Ok(()) => {
                self.counters.enqueue_hot_total.fetch_add(1, Ordering::Relaxed);
                self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
                self.metrics.buffer_enqueue_hot();
                self.metrics.buffer_queue_depth_inc();
                true
            }
            Err(_) => {
                self.counters.backpressure_total.fetch_add(1, Ordering::Relaxed);
                self.metrics.buffer_backpressure();
                tracing::warn!(
                    scanner_interval_s = self.config.scanner_interval_s,
                    "buffer full (backpressure); message will be recovered by scanner"
                );
                false
            }
        }
    }

    /// `spec.md` §4.7 shutdown: stop the scanner first, then drain the
    /// queue up to `drain_timeout_s`, then cancel the workers.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        if let Some(handle) = self.scanner_handle.lock().unwrap().take() {
            let _ = handle.await;
        }

        let deadline = Duration::from_secs(self.config.drain_timeout_s);
        let drained = tokio::time::timeout(deadline, async {
            while self.counters.queue_depth.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = self.counters.queue_depth.load(Ordering::Relaxed),
                "DurableBuffer drain timed out"
            );
        }

        let handles = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        tracing::info!(
            hot = self.counters.enqueue_hot_total.load(Ordering::Relaxed),
            cold = self.counters.enqueue_cold_total.load(Ordering::Relaxed),
            backpressure = self.counters.backpressure_total.load(Ordering::Relaxed),
            recovered = self.counters.scanner_recovered_total.load(Ordering::Relaxed),
            "DurableBuffer stopped"
        );
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            queue_depth: self.counters.queue_depth.load(Ordering::Relaxed),
            enqueue_hot_total: self.counters.enqueue_hot_total.load(Ordering::Relaxed),
            enqueue_cold_total: self.counters.enqueue_cold_total.load(Ordering::Relaxed),
            backpressure_total: self.counters.backpressure_total.load(Ordering::Relaxed),
            scanner_recovered_total: self.counters.scanner_recovered_total.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<MessageRef>>>,
    processor: Arc<dyn MessageProcessor>,
    metrics: Arc<ButlerMetrics>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
) {
    loop {
        let message_ref = {
            let mut guard = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                maybe_ref = guard.recv() => maybe_ref,
            }
        };

        let Some(message_ref) = message_ref else {
            break;
        };

        counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
        let process_latency_ms = (Utc::now() - message_ref.enqueued_at)
            .num_milliseconds()
            .max(0) as f64;
        metrics.record_buffer_process_latency(process_latency_ms);
        metrics.buffer_queue_depth_dec();

        let request_id = message_ref.request_id;
        if let Err(err) = processor.process(message_ref).await {
            tracing::error!(worker_id, %request_id, %err, "buffer worker: processing failed");
        }
    }
}

async fn scanner_loop(
    config: BufferConfig,
    pool: PgPool,
    metrics: Arc<ButlerMetrics>,
    counters: Arc<Counters>,
    sender: mpsc::Sender<MessageRef>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(config.scanner_interval_s)) => {}
        }
        if shutdown.is_cancelled() {
            break;
        }

        match run_scanner_sweep(&config, &pool, &metrics, &counters, &sender).await {
            Ok(recovered) if recovered > 0 => {
                tracing::info!(recovered, "buffer scanner sweep recovered messages");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(%err, "buffer scanner sweep failed"),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScannerRow {
    id: uuid::Uuid,
    received_at: chrono::DateTime<Utc>,
    request_context: serde_json::Value,
    raw_payload: Option<serde_json::Value>,
    normalized_text: String,
}

async fn run_scanner_sweep(
    config: &BufferConfig,
    pool: &PgPool,
    metrics: &ButlerMetrics,
    counters: &Counters,
    sender: &mpsc::Sender<MessageRef>,
) -> Result<u32> {
    let cutoff = Utc::now() - chrono::Duration::seconds(config.scanner_grace_s);
    let rows: Vec<ScannerRow> = sqlx::query_as(
        r#"
        SELECT id, received_at, request_context, raw_payload, normalized_text
        FROM message_inbox
        WHERE lifecycle_state = 'accepted' AND received_at < $1
        ORDER BY received_at ASC
        LIMIT $2
        "#,
    )
    .bind(cutoff)
    .bind(config.scanner_batch_size)
    .fetch_all(pool)
    .await?;

    let mut recovered = 0u32;
    for row in rows {
        if row.normalized_text.is_empty() {
            sqlx::query(
                r#"
                UPDATE message_inbox SET lifecycle_state = 'errored'
                WHERE id = $1 AND lifecycle_state = 'accepted'
                "#,
            )
            .bind(row.id)
            .execute(pool)
            .await?;
            continue;
        }

        let request_id = row
            .request_context
            .get("request_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(row.id);

        let source = row
            .raw_payload
            .as_ref()
            .and_then(|p| p.get("source"))
            .and_then(|s| s.get("channel"))
            .and_then(|c| c.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(crate::models::SourceChannel::System);
        let event = row
            .raw_payload
            .as_ref()
            .and_then(|p| p.get("event"))
            .map(|e| e.to_string())
            .unwrap_or_default();
        let sender_identity = row
            .raw_payload
            .as_ref()
            .and_then(|p| p.get("sender"))
            .and_then(|s| s.get("identity"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let message_ref = MessageRef {
            request_id,
            message_inbox_id: row.id,
            message_text: row.normalized_text,
            source,
            event,
            sender: sender_identity,
            enqueued_at: Utc::now(),
        };

        match sender.try_send(message_ref) {
            Ok(()) => {
                counters.enqueue_cold_total.fetch_add(1, Ordering::Relaxed);
                counters.scanner_recovered_total.fetch_add(1, Ordering::Relaxed);
                counters.queue_depth.fetch_add(1, Ordering::Relaxed);
                metrics.buffer_enqueue_cold();
                metrics.buffer_scanner_recovered();
                metrics.buffer_queue_depth_inc();
                recovered += 1;
            }
            Err(_) => break, // queue full; retry next sweep
        }
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingProcessor {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageProcessor for CountingProcessor {
        async fn process(&self, _message_ref: MessageRef) -> Result<()> {
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn sample_ref() -> MessageRef {
        MessageRef {
            request_id: uuid::Uuid::new_v4(),
            message_inbox_id: uuid::Uuid::new_v4(),
            message_text: "hello".to_string(),
            source: crate::models::SourceChannel::Api,
            event: "{}".to_string(),
            sender: "alice".to_string(),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_worker_processes_it() {
        let config = BufferConfig {
            queue_capacity: 4,
            worker_count: 1,
            ..BufferConfig::default()
        };
        let metrics = Arc::new(ButlerMetrics::new("switchboard"));
        let buffer = DurableBuffer::new(config, None, metrics);
        let count = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor { count: count.clone() });
        buffer.start(processor);

        assert!(buffer.enqueue(sample_ref()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(buffer.stats().enqueue_hot_total, 1);

        buffer.stop().await;
    }

    #[tokio::test]
    async fn full_queue_triggers_backpressure_not_panic() {
        let config = BufferConfig {
            queue_capacity: 1,
            worker_count: 0,
            drain_timeout_s: 1,
            ..BufferConfig::default()
        };
        let metrics = Arc::new(ButlerMetrics::new("switchboard"));
        let buffer = DurableBuffer::new(config, None, metrics);
        let count = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor { count });
        buffer.start(processor);

        assert!(buffer.enqueue(sample_ref()));
        assert!(!buffer.enqueue(sample_ref()));
        assert_eq!(buffer.stats().backpressure_total, 1);

        buffer.stop().await;
    }
}
