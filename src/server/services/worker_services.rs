use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::server::utils::decompress_utils::{decompress, BodyEncoding, DecodeOutcome};

pub type DynWorkerPoolService = Arc<dyn WorkerPoolServiceTrait + Send + Sync>;

#[derive(Serialize, Debug, Clone)]
pub struct WorkerStats {
    pub pool_size: usize,
    pub queue_capacity: usize,
    pub queue_depth: usize,
    pub queue_high_water: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub inline_decodes: u64,
    pub saturation_rejections: u64,
    pub shutting_down: bool,
}

#[async_trait]
pub trait WorkerPoolServiceTrait {
    /// Decompress a body, offloading to the pool when it is worth it. The
    /// pool is an optimization only: saturation, shutdown and worker death
    /// all degrade to an inline decode.
    async fn decompress(&self, data: Vec<u8>, declared: Option<BodyEncoding>) -> DecodeOutcome;

    fn stats(&self) -> WorkerStats;

    /// reject new submissions and wait for the queue to drain
    async fn shutdown(&self);
}

struct WorkerTask {
    data: Vec<u8>,
    declared: Option<BodyEncoding>,
    reply: oneshot::Sender<DecodeOutcome>,
}

pub struct WorkerPoolService {
    tx: mpsc::Sender<WorkerTask>,
    pool_size: usize,
    queue_capacity: usize,
    inline_threshold: usize,
    shutting_down: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    inline_decodes: AtomicU64,
    saturation_rejections: AtomicU64,
    queue_high_water: AtomicUsize,
}

impl WorkerPoolService {
    pub fn new(pool_size: usize, queue_capacity: usize, inline_threshold: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<WorkerTask>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        let pool = Arc::new(Self {
            tx,
            pool_size,
            queue_capacity,
            inline_threshold,
            shutting_down: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            inline_decodes: AtomicU64::new(0),
            saturation_rejections: AtomicU64::new(0),
            queue_high_water: AtomicUsize::new(0),
        });

        for worker_id in 0..pool_size {
            let rx = rx.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                loop {
                    // holding the lock only for the dequeue keeps workers parallel
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else {
                        debug!("decompression worker {} stopping", worker_id);
                        break;
                    };

                    let outcome = tokio::task::spawn_blocking(move || {
                        decompress(&task.data, task.declared)
                    })
                    .await;

                    match outcome {
                        Ok(outcome) => {
                            if outcome.decoded {
                                pool.completed.fetch_add(1, Ordering::Relaxed);
                            } else {
                                pool.failed.fetch_add(1, Ordering::Relaxed);
                            }
                            // receiver may have been cancelled, that's fine
                            let _ = task.reply.send(outcome);
                        }
                        Err(e) => {
                            error!("decompression task panicked: {}", e);
                            pool.failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }

        info!(
            "decompression pool up: {} workers, queue depth {}",
            pool_size, queue_capacity
        );
        pool
    }

    fn queue_depth(&self) -> usize {
        self.queue_capacity - self.tx.capacity()
    }

    fn note_queue_depth(&self) {
        let depth = self.queue_depth();
        self.queue_high_water.fetch_max(depth, Ordering::Relaxed);
    }

    async fn decode_inline(&self, data: Vec<u8>, declared: Option<BodyEncoding>) -> DecodeOutcome {
        self.inline_decodes.fetch_add(1, Ordering::Relaxed);
        // still off the event path, just not queued
        match tokio::task::spawn_blocking(move || decompress(&data, declared)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("inline decompression task panicked: {}", e);
                DecodeOutcome {
                    bytes: Vec::new(),
                    decoded: false,
                    encoding_used: None,
                }
            }
        }
    }
}

#[async_trait]
impl WorkerPoolServiceTrait for WorkerPoolService {
    async fn decompress(&self, data: Vec<u8>, declared: Option<BodyEncoding>) -> DecodeOutcome {
        if data.len() < self.inline_threshold || self.shutting_down.load(Ordering::Relaxed) {
            return self.decode_inline(data, declared).await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let task = WorkerTask {
            data,
            declared,
            reply: reply_tx,
        };

        match self.tx.try_send(task) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                self.note_queue_depth();
                match reply_rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        // worker died mid-task, decode ourselves
                        warn!("decompression worker dropped a task, decoding inline");
                        DecodeOutcome {
                            bytes: Vec::new(),
                            decoded: false,
                            encoding_used: None,
                        }
                    }
                }
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                // saturation fails fast and the caller degrades to inline
                self.saturation_rejections.fetch_add(1, Ordering::Relaxed);
                debug!("decompression queue full, decoding inline");
                self.decode_inline(task.data, task.declared).await
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                self.decode_inline(task.data, task.declared).await
            }
        }
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            pool_size: self.pool_size,
            queue_capacity: self.queue_capacity,
            queue_depth: self.queue_depth(),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            inline_decodes: self.inline_decodes.load(Ordering::Relaxed),
            saturation_rejections: self.saturation_rejections.load(Ordering::Relaxed),
            shutting_down: self.shutting_down.load(Ordering::Relaxed),
        }
    }

    async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        // drain: new submissions are rejected above, so depth only shrinks
        while self.queue_depth() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        info!("decompression pool drained");
    }
}
