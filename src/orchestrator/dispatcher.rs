//! In-process job queue with per-workspace uniqueness and two weighted lanes.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::model::QueueConfig;
use crate::error::DispatchError;
use crate::workspace::WorkspaceAction;

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub workspace_id: u64,
    pub user_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Critical,
    Default,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: String,
    pub payload: JobPayload,
    pub lane: Lane,
    /// Number of earlier attempts that were nacked.
    pub retried: u32,
}

/// Handles every job of one kind. Returning an error nacks the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Which lane the scheduler serves first on a given tick.
///
/// Over every `critical + default` ticks the critical lane is preferred
/// `critical` times.
pub fn preferred_lane(tick: u32, critical_weight: u32, default_weight: u32) -> Lane {
    let period = critical_weight.saturating_add(default_weight);
    if period == 0 || tick % period < critical_weight {
        Lane::Critical
    } else {
        Lane::Default
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct UniqueLock {
    job_id: Uuid,
    action: WorkspaceAction,
    expires_at: Instant,
}

type LaneReceivers = (mpsc::UnboundedReceiver<Job>, mpsc::UnboundedReceiver<Job>);

struct Inner {
    config: QueueConfig,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    locks: DashMap<u64, UniqueLock>,
    critical_tx: mpsc::UnboundedSender<Job>,
    default_tx: mpsc::UnboundedSender<Job>,
    receivers: Mutex<Option<LaneReceivers>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Accepts lifecycle jobs and runs them on a bounded worker pool.
///
/// Enqueue takes the workspace's uniqueness lock, and a second enqueue is
/// refused while it is held. The lock lasts until the job is acked or
/// archived, or until `unique_ttl` passes, whichever comes first. A job
/// that outlives the TTL no longer blocks new jobs for its workspace.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(config: QueueConfig, cancel: CancellationToken) -> Self {
        let (critical_tx, critical_rx) = mpsc::unbounded_channel();
        let (default_tx, default_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                handlers: RwLock::new(HashMap::new()),
                locks: DashMap::new(),
                critical_tx,
                default_tx,
                receivers: Mutex::new(Some((critical_rx, default_rx))),
                cancel,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Register `handler` for jobs of `kind`, replacing any earlier one.
    pub fn register(&self, kind: &str, handler: Arc<dyn JobHandler>) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(kind.to_string(), handler);
    }

    /// Queue `action` on the default lane.
    pub fn enqueue(
        &self,
        action: WorkspaceAction,
        workspace_id: u64,
        user_id: u64,
    ) -> Result<Uuid, DispatchError> {
        self.enqueue_on(Lane::Default, action, workspace_id, user_id)
    }

    pub fn enqueue_on(
        &self,
        lane: Lane,
        action: WorkspaceAction,
        workspace_id: u64,
        user_id: u64,
    ) -> Result<Uuid, DispatchError> {
        if self.inner.cancel.is_cancelled() {
            return Err(DispatchError::Unavailable("dispatcher is shutting down".to_string()));
        }

        let job = Job {
            id: Uuid::new_v4(),
            kind: action.job_kind().to_string(),
            payload: JobPayload {
                workspace_id,
                user_id,
            },
            lane,
            retried: 0,
        };

        let lock = UniqueLock {
            job_id: job.id,
            action,
            expires_at: Instant::now() + self.inner.config.unique_ttl(),
        };
        match self.inner.locks.entry(workspace_id) {
            Entry::Occupied(held) if held.get().expires_at > Instant::now() => {
                return Err(DispatchError::Duplicate {
                    workspace_id,
                    action: held.get().action,
                });
            }
            Entry::Occupied(mut expired) => {
                expired.insert(lock);
            }
            Entry::Vacant(slot) => {
                slot.insert(lock);
            }
        }

        let tx = match lane {
            Lane::Critical => &self.inner.critical_tx,
            Lane::Default => &self.inner.default_tx,
        };
        let id = job.id;
        if tx.send(job).is_err() {
            self.inner.release(workspace_id, id);
            return Err(DispatchError::Unavailable("job queue closed".to_string()));
        }

        info!(workspace_id, user_id, job_id = %id, kind = action.job_kind(), ?lane, "job enqueued");
        Ok(id)
    }

    /// Whether a uniqueness lock is currently held for `workspace_id`.
    pub fn is_locked(&self, workspace_id: u64) -> bool {
        self.inner
            .locks
            .get(&workspace_id)
            .is_some_and(|lock| lock.expires_at > Instant::now())
    }

    /// Start the scheduler. Calling it more than once has no effect.
    pub fn start(&self) {
        let receivers = self
            .inner
            .receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some((critical, default)) = receivers else {
            debug!("dispatcher already started");
            return;
        };
        info!(
            concurrency = self.inner.config.concurrency,
            critical_weight = self.inner.config.critical_weight,
            default_weight = self.inner.config.default_weight,
            "dispatcher workers started"
        );
        let inner = self.inner.clone();
        self.inner.tracker.spawn(schedule(inner, critical, default));
    }

    /// Stop the workers, cancel in-flight jobs, and wait for them to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    fn handler(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(kind)
            .cloned()
    }

    /// Drop the workspace lock if `job_id` still owns it.
    fn release(&self, workspace_id: u64, job_id: Uuid) {
        self.locks
            .remove_if(&workspace_id, |_, lock| lock.job_id == job_id);
    }

    async fn process(&self, job: Job, cancel: CancellationToken) {
        let workspace_id = job.payload.workspace_id;
        let Some(handler) = self.handler(&job.kind) else {
            error!(job_id = %job.id, kind = %job.kind, "no handler registered, archiving job");
            self.release(workspace_id, job.id);
            return;
        };

        let mut attempt = 0u32;
        let run = || {
            let attempt_job = Job {
                retried: attempt,
                ..job.clone()
            };
            attempt += 1;
            let handler = handler.clone();
            let cancel = cancel.clone();
            async move { run_handler(handler, attempt_job, cancel).await }
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_delay())
            .with_max_delay(Duration::from_secs(60))
            .with_max_times(self.config.max_retry as usize);

        let result = run
            .retry(backoff)
            .when(|_| !cancel.is_cancelled())
            .notify(|err: &anyhow::Error, dur: Duration| {
                warn!(job_id = %job.id, kind = %job.kind, workspace_id, "job nacked: {:#}, retrying in {:?}", err, dur);
            })
            .await;

        match result {
            Ok(()) => debug!(job_id = %job.id, kind = %job.kind, workspace_id, "job acked"),
            Err(e) => warn!(
                job_id = %job.id,
                kind = %job.kind,
                workspace_id,
                "job archived after {} attempt(s): {:#}",
                attempt,
                e
            ),
        }
        self.release(workspace_id, job.id);
    }
}

/// Run one attempt, turning a handler panic into a nack.
async fn run_handler(
    handler: Arc<dyn JobHandler>,
    job: Job,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    match AssertUnwindSafe(handler.handle(&job, cancel)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                job_id = %job.id,
                kind = %job.kind,
                workspace_id = job.payload.workspace_id,
                "job handler panicked: {}\n{}",
                message,
                std::backtrace::Backtrace::force_capture()
            );
            Err(anyhow::anyhow!("handler panicked: {}", message))
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Feed jobs from both lanes to the worker pool, honouring lane weights and
/// the concurrency limit.
async fn schedule(
    inner: Arc<Inner>,
    mut critical: mpsc::UnboundedReceiver<Job>,
    mut default: mpsc::UnboundedReceiver<Job>,
) {
    let semaphore = Arc::new(Semaphore::new(inner.config.concurrency.max(1)));
    let cancel = inner.cancel.clone();
    let mut tick = 0u32;

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let lane = preferred_lane(tick, inner.config.critical_weight, inner.config.default_weight);
        tick = tick.wrapping_add(1);

        let queued = match lane {
            Lane::Critical => critical.try_recv().or_else(|_| default.try_recv()),
            Lane::Default => default.try_recv().or_else(|_| critical.try_recv()),
        };
        let job = match queued {
            Ok(job) => job,
            Err(_) => tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(job) = critical.recv() => job,
                Some(job) = default.recv() => job,
                else => break,
            },
        };

        let worker = inner.clone();
        let job_cancel = cancel.child_token();
        inner.tracker.spawn(async move {
            let _permit = permit;
            worker.process(job, job_cancel).await;
        });
    }
    debug!("dispatcher scheduler stopped");
}
