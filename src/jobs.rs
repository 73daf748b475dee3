//! In-process job queue
//!
//! A single priority queue coordinates audit, research and write-behind
//! work. Processing is strictly serial: one worker pops in priority order,
//! dispatches to the handler registered for the job type, and re-enqueues
//! failures with linear backoff. Low-priority `write-batch` jobs pass
//! through a 300 ms staging buffer so bursts enter the queue together.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{MnemoError, Result};
use crate::types::MemoryAudit;

/// Staging window for write-behind batching
pub const BATCH_WINDOW_MS: u64 = 300;
/// Retries before a job counts as failed
pub const MAX_RETRIES: u32 = 3;
/// Completions kept for latency percentiles
const LATENCY_WINDOW: usize = 1000;

/// Job categories with fixed priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Audit,
    Research,
    WriteBatch,
}

impl JobType {
    pub fn priority(&self) -> u8 {
        match self {
            JobType::Audit => 10,
            JobType::Research => 5,
            JobType::WriteBatch => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Audit => "audit",
            JobType::Research => "research",
            JobType::WriteBatch => "write-batch",
        }
    }
}

/// A deferred durable write carried by a write-batch job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum WriteOp {
    RecordAudit { audit: MemoryAudit },
    QueueEmbedding { memory_id: String, content: String },
}

/// Tagged job payload, keyed by type on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    Audit {
        user_id: String,
        thread_id: String,
    },
    Research {
        user_id: String,
        thread_id: String,
        content: String,
    },
    WriteBatch {
        ops: Vec<WriteOp>,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Audit { .. } => JobType::Audit,
            JobPayload::Research { .. } => JobType::Research,
            JobPayload::WriteBatch { .. } => JobType::WriteBatch,
        }
    }
}

/// A queued unit of work
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub priority: u8,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    /// Monotonic sequence for FIFO order within a priority
    seq: u64,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, then oldest sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handler for one job type
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: JobPayload) -> Result<()>;
}

/// Queue counters over the most recent completions
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub queue_depth: usize,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Job>,
    staging: Vec<Job>,
    flush_scheduled: bool,
    seq: u64,
}

#[derive(Default)]
struct Stats {
    enqueued: u64,
    processed: u64,
    failed: u64,
    latencies_ms: VecDeque<u64>,
}

struct Inner {
    state: Mutex<QueueState>,
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
    stats: Mutex<Stats>,
    wake_tx: async_channel::Sender<()>,
    wake_rx: async_channel::Receiver<()>,
}

/// Cheap-clone handle to the shared queue
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = async_channel::bounded(1024);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                handlers: RwLock::new(HashMap::new()),
                stats: Mutex::new(Stats::default()),
                wake_tx,
                wake_rx,
            }),
        }
    }

    /// Register the handler for a job type
    pub fn register(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.inner.handlers.write().insert(job_type, handler);
    }

    /// Enqueue a job; non-blocking. Write-batch jobs land in the staging
    /// buffer and enter the queue when the window flushes.
    pub fn enqueue(&self, payload: JobPayload) -> String {
        let job_type = payload.job_type();
        let id = uuid::Uuid::new_v4().to_string();

        let mut schedule_flush = false;
        {
            let mut state = self.inner.state.lock();
            state.seq += 1;
            let job = Job {
                id: id.clone(),
                job_type,
                priority: job_type.priority(),
                payload,
                created_at: Utc::now(),
                attempts: 0,
                seq: state.seq,
            };

            if job_type == JobType::WriteBatch {
                state.staging.push(job);
                if !state.flush_scheduled {
                    state.flush_scheduled = true;
                    schedule_flush = true;
                }
            } else {
                state.heap.push(job);
            }
        }
        self.inner.stats.lock().enqueued += 1;

        if schedule_flush {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(BATCH_WINDOW_MS)).await;
                queue.flush_staging();
            });
        } else if job_type != JobType::WriteBatch {
            let _ = self.inner.wake_tx.try_send(());
        }
        id
    }

    /// Move staged write-batch jobs into the main queue in one go,
    /// preserving their order.
    pub fn flush_staging(&self) {
        let mut state = self.inner.state.lock();
        let staged = std::mem::take(&mut state.staging);
        state.flush_scheduled = false;
        for job in staged {
            state.heap.push(job);
        }
        drop(state);
        let _ = self.inner.wake_tx.try_send(());
    }

    /// Jobs waiting, including the staging buffer
    pub fn depth(&self) -> usize {
        let state = self.inner.state.lock();
        state.heap.len() + state.staging.len()
    }

    pub fn metrics(&self) -> JobMetrics {
        let stats = self.inner.stats.lock();
        let avg = if stats.latencies_ms.is_empty() {
            0.0
        } else {
            stats.latencies_ms.iter().sum::<u64>() as f64 / stats.latencies_ms.len() as f64
        };
        let p95 = if stats.latencies_ms.is_empty() {
            0
        } else {
            let mut sorted: Vec<u64> = stats.latencies_ms.iter().copied().collect();
            sorted.sort_unstable();
            let idx = ((sorted.len() as f64) * 0.95).ceil() as usize - 1;
            sorted[idx.min(sorted.len() - 1)]
        };
        JobMetrics {
            enqueued: stats.enqueued,
            processed: stats.processed,
            failed: stats.failed,
            queue_depth: self.depth(),
            avg_latency_ms: avg,
            p95_latency_ms: p95,
        }
    }

    fn pop(&self) -> Option<Job> {
        self.inner.state.lock().heap.pop()
    }

    fn record_completion(&self, job: &Job) {
        let mut stats = self.inner.stats.lock();
        stats.processed += 1;
        let latency = (Utc::now() - job.created_at).num_milliseconds().max(0) as u64;
        if stats.latencies_ms.len() >= LATENCY_WINDOW {
            stats.latencies_ms.pop_front();
        }
        stats.latencies_ms.push_back(latency);
    }

    /// Process one job if any is queued; used by tests and the worker loop.
    /// Returns false when the queue was empty.
    pub async fn process_next(&self) -> bool {
        let Some(mut job) = self.pop() else {
            return false;
        };

        let handler = self.inner.handlers.read().get(&job.job_type).cloned();
        let Some(handler) = handler else {
            tracing::warn!(job_type = job.job_type.as_str(), "No handler registered, dropping job");
            self.inner.stats.lock().failed += 1;
            return true;
        };

        match handler.handle(job.payload.clone()).await {
            Ok(()) => self.record_completion(&job),
            Err(e) => {
                job.attempts += 1;
                if job.attempts <= MAX_RETRIES {
                    tracing::warn!(
                        job_id = %job.id,
                        job_type = job.job_type.as_str(),
                        attempt = job.attempts,
                        error = %e,
                        "Job failed, retrying with backoff"
                    );
                    let queue = self.clone();
                    let backoff = Duration::from_millis(job.attempts as u64 * 1000);
                    tokio::spawn(async move {
                        tokio::time::sleep(backoff).await;
                        let mut state = queue.inner.state.lock();
                        state.seq += 1;
                        job.seq = state.seq;
                        state.heap.push(job);
                        drop(state);
                        let _ = queue.inner.wake_tx.try_send(());
                    });
                } else {
                    tracing::error!(
                        job_id = %job.id,
                        job_type = job.job_type.as_str(),
                        error = %e,
                        "Job failed permanently"
                    );
                    self.inner.stats.lock().failed += 1;
                }
            }
        }
        true
    }

    /// Serial worker loop. Exactly one instance runs per queue.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Job queue worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.process_next().await {
                continue;
            }
            tokio::select! {
                _ = self.inner.wake_rx.recv() => {}
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
        tracing::info!("Job queue worker stopped");
    }

    /// Drain the queue serially until empty (shutdown and tests).
    /// Re-flushes the staging buffer each round so write-behind ops
    /// enqueued by in-flight jobs are not stranded.
    pub async fn drain(&self) {
        loop {
            self.flush_staging();
            if !self.process_next().await {
                break;
            }
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
