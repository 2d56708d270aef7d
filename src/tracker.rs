//! Execution Tracker — authoritative in-memory source for per-adapter
//! statistics and per-execution audit records, plus asynchronous batched
//! persistence to an opaque sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock as SyncRwLock;
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::metrics_schema::{
    ActiveExecution, AdapterKind, AdapterStats, ExecutionId, ExecutionRecord, ExecutionStatus,
    TaskKind,
};

/// Opaque persistence sink. A write failure is logged but not retried
/// indefinitely — only a sink that signals "retriable" gets its batch
/// re-queued.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn write_batch(&self, records: &[ExecutionRecord]) -> SinkResult;
    async fn write_aggregate_snapshot(&self, stats: &HashMap<AdapterKind, AdapterStats>) {
        let _ = stats;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkResult {
    Ok,
    Retriable,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    Full,
    LowFrequency,
    HighFrequency,
    Adaptive,
}

impl SamplingStrategy {
    fn should_sample(&self, sampling_rate: f64, task_kind_count: u64) -> bool {
        match self {
            SamplingStrategy::Full | SamplingStrategy::LowFrequency => true,
            SamplingStrategy::HighFrequency => rand::thread_rng().gen_bool(sampling_rate.clamp(0.0, 1.0)),
            SamplingStrategy::Adaptive => task_kind_count < 100 || task_kind_count % 10 == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub sampling_strategy: SamplingStrategy,
    pub sampling_rate: f64,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub aggregate_interval: Duration,
    pub min_samples: u64,
    pub active_ttl: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sampling_strategy: SamplingStrategy::Full,
            sampling_rate: 1.0,
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            aggregate_interval: Duration::from_secs(60),
            min_samples: 10,
            active_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerHealth {
    pub status: &'static str,
    pub active_count: usize,
    pub pending_writes: usize,
    pub sampling_strategy: SamplingStrategy,
    pub last_aggregation_at: Option<chrono::DateTime<Utc>>,
}

struct TaskKindCounter {
    counts: DashMap<TaskKind, u64>,
}

impl TaskKindCounter {
    fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    fn bump(&self, task_kind: TaskKind) -> u64 {
        let mut entry = self.counts.entry(task_kind).or_insert(0);
        *entry += 1;
        *entry
    }

    fn get(&self, task_kind: TaskKind) -> u64 {
        self.counts.get(&task_kind).map(|v| *v).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct AtomicAdapterCounters {
    success: AtomicU64,
    failure: AtomicU64,
}

const RECENT_RING_CAPACITY: usize = 1000;

pub struct ExecutionTracker {
    config: TrackerConfig,
    active: DashMap<ExecutionId, ActiveExecution>,
    /// Pending-write queue: drained (and emptied) by `flush`.
    completed: Arc<Mutex<Vec<ExecutionRecord>>>,
    /// Bounded audit ring, independent of the flush cycle — feeds
    /// `recent_executions`/`recent_latencies` (statistical router median,
    /// percentile reporting) even immediately after a flush.
    recent: Arc<Mutex<std::collections::VecDeque<ExecutionRecord>>>,
    counters: DashMap<AdapterKind, AtomicAdapterCounters>,
    task_kind_counter: TaskKindCounter,
    last_aggregation_at: SyncRwLock<Option<chrono::DateTime<Utc>>>,
    sink: Option<Arc<dyn ExecutionSink>>,
    flush_lock: Mutex<()>,
    dropped_aggregate_writes: AtomicU64,
    shutdown: Arc<Notify>,
    shutdown_requested: Arc<std::sync::atomic::AtomicBool>,
    aggregation_task: SyncRwLock<Option<JoinHandle<()>>>,
}

impl ExecutionTracker {
    pub fn new(config: TrackerConfig, sink: Option<Arc<dyn ExecutionSink>>) -> Arc<Self> {
        let counters = DashMap::new();
        for adapter in AdapterKind::ALL {
            // pre-register so `adapter_stats_for` never sees an absent
            // entry for a known adapter, even before its first execution
            counters.insert(adapter, AtomicAdapterCounters::default());
        }
        Arc::new(Self {
            config,
            active: DashMap::new(),
            completed: Arc::new(Mutex::new(Vec::new())),
            recent: Arc::new(Mutex::new(std::collections::VecDeque::with_capacity(
                RECENT_RING_CAPACITY,
            ))),
            counters,
            task_kind_counter: TaskKindCounter::new(),
            last_aggregation_at: SyncRwLock::new(None),
            sink,
            flush_lock: Mutex::new(()),
            dropped_aggregate_writes: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
            shutdown_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            aggregation_task: SyncRwLock::new(None),
        })
    }

    pub fn record_start(&self, adapter: AdapterKind, task_kind: TaskKind, repos: Vec<String>) -> ExecutionId {
        let execution_id = ExecutionId::new();
        let count = self.task_kind_counter.bump(task_kind);

        if !self
            .config
            .sampling_strategy
            .should_sample(self.config.sampling_rate, count.saturating_sub(1))
        {
            return execution_id;
        }

        self.active.insert(
            execution_id.clone(),
            ActiveExecution {
                start_ts: Utc::now(),
                adapter,
                task_kind,
                repos,
            },
        );
        execution_id
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_end(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        latency_ms: Option<u64>,
        error_type: Option<String>,
        error_message: Option<String>,
        cost_usd: Option<rust_decimal::Decimal>,
    ) {
        let Some((_, active)) = self.active.remove(execution_id) else {
            // Unsampled or stale: not an error.
            return;
        };

        let end_ts = Utc::now();
        let latency_ms = latency_ms.unwrap_or_else(|| {
            (end_ts - active.start_ts).num_milliseconds().max(0) as u64
        });

        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            adapter: active.adapter,
            task_kind: active.task_kind,
            start_ts: active.start_ts,
            end_ts,
            status,
            latency_ms,
            error_type: if status.is_success() { None } else { error_type },
            error_message: if status.is_success() { None } else { error_message },
            cost_usd,
            repos: active.repos,
            metadata: HashMap::new(),
        };

        let counters = self
            .counters
            .entry(active.adapter)
            .or_insert_with(AtomicAdapterCounters::default);
        // Cancellation is cooperative and caller-initiated, not an adapter
        // fault — it doesn't count against the adapter's success rate.
        match status {
            ExecutionStatus::Success => {
                counters.success.fetch_add(1, Ordering::Relaxed);
            }
            ExecutionStatus::Cancelled => {}
            ExecutionStatus::Failure | ExecutionStatus::Timeout => {
                counters.failure.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(counters);

        {
            let mut ring = self.recent.lock().await;
            if ring.len() >= RECENT_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        let should_flush = {
            let mut buf = self.completed.lock().await;
            buf.push(record);
            let over_backpressure = buf.len() > self.config.batch_size * 10;
            if over_backpressure {
                self.dropped_aggregate_writes.fetch_add(1, Ordering::Relaxed);
            }
            buf.len() >= self.config.batch_size || over_backpressure
        };

        if should_flush {
            self.flush().await;
        }
    }

    pub fn adapter_stats_for(&self, adapter: AdapterKind) -> Option<AdapterStats> {
        let counters = self.counters.get(&adapter)?;
        let stats = AdapterStats {
            success_count: counters.success.load(Ordering::Relaxed),
            failure_count: counters.failure.load(Ordering::Relaxed),
        };
        if stats.total() < self.config.min_samples {
            return None;
        }
        Some(stats)
    }

    /// Raw stats regardless of `min_samples`, used internally by other
    /// components that apply their own thresholds (e.g. the statistical
    /// router's confidence tiers).
    pub fn raw_adapter_stats(&self, adapter: AdapterKind) -> AdapterStats {
        self.counters
            .get(&adapter)
            .map(|c| AdapterStats {
                success_count: c.success.load(Ordering::Relaxed),
                failure_count: c.failure.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn task_kind_execution_count(&self, task_kind: TaskKind) -> u64 {
        self.task_kind_counter.get(task_kind)
    }

    pub async fn recent_executions(&self, limit: usize) -> Vec<ExecutionRecord> {
        let ring = self.recent.lock().await;
        let start = ring.len().saturating_sub(limit);
        ring.iter().skip(start).cloned().collect()
    }

    /// Recent latencies for a specific `(adapter, task_kind)`, most recent
    /// last, capped at `limit` — used by the statistical router's median
    /// calculation.
    pub async fn recent_latencies(
        &self,
        adapter: AdapterKind,
        task_kind: TaskKind,
        limit: usize,
    ) -> Vec<u64> {
        let ring = self.recent.lock().await;
        ring.iter()
            .filter(|r| r.adapter == adapter && r.task_kind == task_kind)
            .rev()
            .take(limit)
            .map(|r| r.latency_ms)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub async fn health(&self) -> TrackerHealth {
        let pending = self.completed.lock().await.len();
        TrackerHealth {
            status: "ok",
            active_count: self.active.len(),
            pending_writes: pending,
            sampling_strategy: self.config.sampling_strategy,
            last_aggregation_at: *self.last_aggregation_at.read(),
        }
    }

    pub fn dropped_aggregate_writes(&self) -> u64 {
        self.dropped_aggregate_writes.load(Ordering::Relaxed)
    }

    /// Flushes the completed buffer to the sink, if any. Returns the
    /// number of records written. A single flusher runs at a time.
    pub async fn flush(&self) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;
        let records = {
            let mut buf = self.completed.lock().await;
            if buf.is_empty() {
                return FlushOutcome {
                    written: 0,
                    status: FlushStatus::NoRecords,
                };
            }
            std::mem::take(&mut *buf)
        };

        let Some(sink) = &self.sink else {
            return FlushOutcome {
                written: records.len(),
                status: FlushStatus::NoSink,
            };
        };

        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(200);
        loop {
            attempt += 1;
            match sink.write_batch(&records).await {
                SinkResult::Ok => {
                    return FlushOutcome {
                        written: records.len(),
                        status: FlushStatus::Written,
                    };
                }
                SinkResult::Retriable if attempt < 3 => {
                    tracing::warn!(attempt, "execution sink write failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                SinkResult::Retriable | SinkResult::Fatal => {
                    tracing::error!(attempt, "execution sink write dropped after retries");
                    return FlushOutcome {
                        written: 0,
                        status: FlushStatus::Dropped,
                    };
                }
            }
        }
    }

    /// Spawns the background aggregation loop. Returns a handle the caller
    /// can await on shutdown (also stored for `stop`).
    pub fn start_aggregation_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = this.config.aggregate_interval;
        let ttl = this.config.active_ttl;
        let shutdown = Arc::clone(&this.shutdown);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }

                let now = Utc::now();
                this.active.retain(|_, active| {
                    now.signed_duration_since(active.start_ts).to_std().unwrap_or_default() < ttl
                });

                *this.last_aggregation_at.write() = Some(now);

                if let Some(sink) = &this.sink {
                    let snapshot: HashMap<AdapterKind, AdapterStats> = AdapterKind::ALL
                        .into_iter()
                        .map(|a| (a, this.raw_adapter_stats(a)))
                        .collect();
                    sink.write_aggregate_snapshot(&snapshot).await;
                }
            }
        });
        *this.aggregation_task.write() = Some(handle);
    }

    /// Flushes the buffer and cancels the aggregation loop cleanly.
    pub async fn stop(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Some(handle) = self.aggregation_task.write().take() {
            let _ = handle.await;
        }
        self.flush().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Written,
    NoRecords,
    NoSink,
    Dropped,
}

#[derive(Debug, Clone, Copy)]
pub struct FlushOutcome {
    pub written: usize,
    pub status: FlushStatus,
}
