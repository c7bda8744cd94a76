//! Background job queue and worker pool.
//!
//! Jobs run in parallel across distinct coalescing keys and serialize within
//! a key. While an instance of a key is queued, later submissions merge into
//! it (the final kind wins). Cancellation is cooperative: pipelines poll the
//! context flag at file boundaries and between embedding batches.

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::CoreResult;
use crate::store::Store;
use crate::types::{now_ts, JobKind, JobSnapshot, JobState};

// ---------------------------------------------------------------------------
// Runner trait
// ---------------------------------------------------------------------------

/// Executes one job kind. Implemented by the indexing orchestrator; the
/// queue itself never inspects kind payloads.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, kind: &JobKind, ctx: &JobCtx) -> CoreResult<()>;
}

// ---------------------------------------------------------------------------
// Job context
// ---------------------------------------------------------------------------

/// Handle given to a running job for cancellation checks and progress.
pub struct JobCtx {
    pub id: String,
    cancel: Arc<AtomicBool>,
    registry: Arc<DashMap<String, JobRecord>>,
    last_progress: Mutex<Instant>,
}

impl JobCtx {
    /// Context for synchronous callers outside the queue (CLI, sync API
    /// paths): never cancelled, progress discarded.
    pub fn detached() -> JobCtx {
        JobCtx {
            id: String::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            registry: Arc::new(DashMap::new()),
            last_progress: Mutex::new(Instant::now()),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Update percent/message, throttled to at most once per second.
    /// Terminal-looking updates (100%) always go through.
    pub fn set_progress(&self, percent: u8, message: &str) {
        let now = Instant::now();
        {
            let mut last = self.last_progress.lock().unwrap();
            if percent < 100 && now.duration_since(*last) < Duration::from_secs(1) {
                return;
            }
            *last = now;
        }
        if let Some(mut record) = self.registry.get_mut(&self.id) {
            record.snapshot.percent = percent.min(100);
            record.snapshot.message = message.to_string();
        }
    }
}

// ---------------------------------------------------------------------------
// Queue internals
// ---------------------------------------------------------------------------

struct JobRecord {
    snapshot: JobSnapshot,
    kind: JobKind,
    cancel: Arc<AtomicBool>,
    coalesce_key: Option<String>,
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<String>,
    running_keys: HashSet<String>,
}

pub struct JobQueue {
    registry: Arc<DashMap<String, JobRecord>>,
    inner: Mutex<QueueInner>,
    cond: Condvar,
    shutdown: AtomicBool,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    store: Arc<Store>,
}

impl JobQueue {
    /// Build the queue and start `workers` worker threads.
    pub fn start(workers: usize, runner: Arc<dyn JobRunner>, store: Arc<Store>) -> Arc<JobQueue> {
        let queue = Arc::new(JobQueue {
            registry: Arc::new(DashMap::new()),
            inner: Mutex::new(QueueInner::default()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            store,
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let queue = Arc::clone(&queue);
            let runner = Arc::clone(&runner);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("corpora-worker-{worker_id}"))
                    .spawn(move || queue.worker_loop(runner.as_ref()))
                    .expect("failed to spawn worker thread"),
            );
        }
        *queue.workers.lock().unwrap() = handles;
        queue
    }

    /// Enqueue a job with no coalescing.
    pub fn submit(&self, kind: JobKind) -> String {
        self.enqueue(kind, None)
    }

    /// Enqueue under a coalescing key: if an instance of the key is already
    /// queued, the new kind replaces it (final event wins) and the existing
    /// job id is returned.
    pub fn submit_coalesced(&self, kind: JobKind, key: String) -> String {
        let mut inner = self.inner.lock().unwrap();
        for id in &inner.pending {
            if let Some(mut record) = self.registry.get_mut(id) {
                if record.coalesce_key.as_deref() == Some(key.as_str()) {
                    debug!(job = id.as_str(), key = key.as_str(), "Coalesced into queued job");
                    record.kind = kind;
                    return id.clone();
                }
            }
        }
        drop(inner);
        self.enqueue(kind, Some(key))
    }

    fn enqueue(&self, kind: JobKind, coalesce_key: Option<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let snapshot = JobSnapshot {
            id: id.clone(),
            kind: kind.label().to_string(),
            state: JobState::Queued,
            percent: 0,
            message: String::new(),
            error: None,
            created_at: now_ts(),
            started_at: None,
            completed_at: None,
        };
        let _ = self.store.flush_job(&snapshot, Some(&kind));
        self.registry.insert(
            id.clone(),
            JobRecord {
                snapshot,
                kind,
                cancel: Arc::new(AtomicBool::new(false)),
                coalesce_key,
            },
        );
        let mut inner = self.inner.lock().unwrap();
        inner.pending.push_back(id.clone());
        drop(inner);
        self.cond.notify_one();
        id
    }

    /// Latest snapshot for a job, falling back to the persisted table for
    /// jobs from earlier processes.
    pub fn status(&self, id: &str) -> Option<JobSnapshot> {
        if let Some(record) = self.registry.get(id) {
            return Some(record.snapshot.clone());
        }
        self.store
            .list_job_snapshots()
            .ok()?
            .into_iter()
            .find(|s| s.id == id)
    }

    pub fn list(&self, state: Option<JobState>) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .registry
            .iter()
            .map(|r| r.snapshot.clone())
            .filter(|s| state.map(|want| s.state == want).unwrap_or(true))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Queued jobs cancel immediately; running jobs get their flag set and
    /// finish cooperatively. Terminal jobs are untouched.
    pub fn cancel(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let was_pending = inner.pending.iter().position(|p| p == id);
        if let Some(pos) = was_pending {
            inner.pending.remove(pos);
        }
        drop(inner);

        let Some(mut record) = self.registry.get_mut(id) else {
            return;
        };
        if record.snapshot.state.is_terminal() {
            return;
        }
        if was_pending.is_some() {
            record.snapshot.state = JobState::Cancelled;
            record.snapshot.completed_at = Some(now_ts());
            let snap = record.snapshot.clone();
            drop(record);
            let _ = self.store.flush_job(&snap, None);
            info!(job = id, "Cancelled queued job");
        } else {
            record.cancel.store(true, Ordering::Relaxed);
            info!(job = id, "Cancellation requested");
        }
    }

    /// Outstanding (queued) depth, used for watcher backpressure.
    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Stop accepting work and join the workers.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.cond.notify_all();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    fn worker_loop(&self, runner: &dyn JobRunner) {
        loop {
            let job_id = {
                let mut inner = self.inner.lock().unwrap();
                loop {
                    if self.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    // First pending job whose key is not already running.
                    let next = inner.pending.iter().position(|id| {
                        self.registry
                            .get(id)
                            .and_then(|r| r.coalesce_key.clone())
                            .map(|key| !inner.running_keys.contains(&key))
                            .unwrap_or(true)
                    });
                    if let Some(pos) = next {
                        let id = inner.pending.remove(pos).unwrap();
                        if let Some(key) = self
                            .registry
                            .get(&id)
                            .and_then(|r| r.coalesce_key.clone())
                        {
                            inner.running_keys.insert(key);
                        }
                        break id;
                    }
                    inner = self
                        .cond
                        .wait_timeout(inner, Duration::from_millis(200))
                        .unwrap()
                        .0;
                }
            };

            self.run_one(runner, &job_id);

            let mut inner = self.inner.lock().unwrap();
            if let Some(key) = self
                .registry
                .get(&job_id)
                .and_then(|r| r.coalesce_key.clone())
            {
                inner.running_keys.remove(&key);
            }
            drop(inner);
            self.cond.notify_all();
        }
    }

    fn run_one(&self, runner: &dyn JobRunner, job_id: &str) {
        let (kind, cancel) = {
            let Some(mut record) = self.registry.get_mut(job_id) else {
                return;
            };
            if record.cancel.load(Ordering::Relaxed) {
                record.snapshot.state = JobState::Cancelled;
                record.snapshot.completed_at = Some(now_ts());
                let snap = record.snapshot.clone();
                drop(record);
                let _ = self.store.flush_job(&snap, None);
                return;
            }
            record.snapshot.state = JobState::Running;
            record.snapshot.started_at = Some(now_ts());
            let snap = record.snapshot.clone();
            let pair = (record.kind.clone(), Arc::clone(&record.cancel));
            drop(record);
            let _ = self.store.flush_job(&snap, None);
            pair
        };

        let ctx = JobCtx {
            id: job_id.to_string(),
            cancel: Arc::clone(&cancel),
            registry: Arc::clone(&self.registry),
            last_progress: Mutex::new(
                Instant::now()
                    .checked_sub(Duration::from_secs(2))
                    .unwrap_or_else(Instant::now),
            ),
        };

        let started = Instant::now();
        let result = runner.run(&kind, &ctx);

        let Some(mut record) = self.registry.get_mut(job_id) else {
            return;
        };
        let cancelled = cancel.load(Ordering::Relaxed);
        match (&result, cancelled) {
            (_, true) => {
                record.snapshot.state = JobState::Cancelled;
                record.snapshot.message = "cancelled".to_string();
            }
            (Ok(()), false) => {
                record.snapshot.state = JobState::Completed;
                record.snapshot.percent = 100;
            }
            (Err(e), false) => {
                warn!(job = job_id, error = %e, "Job failed");
                record.snapshot.state = JobState::Failed;
                record.snapshot.error = Some(e.to_string());
            }
        }
        record.snapshot.completed_at = Some(now_ts());
        let snap = record.snapshot.clone();
        drop(record);
        let _ = self.store.flush_job(&snap, None);
        debug!(
            job = job_id,
            state = snap.state.label(),
            time_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );
    }
}
