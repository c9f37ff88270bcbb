use crate::errors::{QueueError, Result};
use crate::hook::CompletionHook;
use crate::sentry_init;
use crate::store::{QueueStore, StoredEntry};
use crate::tasks::{HistoryLimits, RetentionSweeper, TaskHistory, TaskKind, TaskStatus};
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use backon::{ExponentialBuilder, Retryable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

/// Backoff applied to transient store and hook failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub retry: RetryPolicy,
    /// How long a tenant worker waits for new work before exiting
    pub idle_timeout: Duration,
    pub history_limits: HistoryLimits,
    /// How long shutdown waits for queued tasks to finish
    pub drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(300),
            history_limits: HistoryLimits::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Which entry a remove task targets.
#[derive(Debug, Clone, PartialEq)]
pub enum RemovalTarget {
    EntryId(String),
    /// Byte-exact snapshot match
    Content(Vec<u8>),
}

/// Work carried by one background task.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    Add {
        entry_id: String,
        payload: Vec<u8>,
        /// Skip the append when an identical payload is already queued
        unique: bool,
    },
    Remove { target: RemovalTarget, record_id: String },
    Get,
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Add { .. } => TaskKind::Add,
            TaskPayload::Remove { .. } => TaskKind::Remove,
            TaskPayload::Get => TaskKind::Get,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// New queue length after an add
    Length(u64),
    /// Queue contents after a get
    Entries(Vec<StoredEntry>),
    /// Whether a remove matched an entry
    Removed(bool),
    /// A unique add found an identical payload and appended nothing
    AlreadyQueued,
}

struct TenantTask {
    id: Uuid,
    tenant: String,
    payload: TaskPayload,
    reply: oneshot::Sender<Result<TaskOutcome>>,
}

/// A submitted task the caller can wait on.
pub struct PendingTask {
    id: Uuid,
    reply: oneshot::Receiver<Result<TaskOutcome>>,
    history: Arc<TaskHistory>,
}

impl PendingTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the task to finish, at most `budget`.
    ///
    /// Giving up does not cancel the task; it keeps retrying in the background.
    pub async fn wait(self, budget: Duration) -> Result<TaskOutcome> {
        match tokio::time::timeout(budget, self.reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueueError::QueueUnavailable(format!(
                "task {} was dropped before completing",
                self.id
            ))),
            Err(_) => {
                let status = self.history.get(self.id).await.map(|r| r.status);
                if status == Some(TaskStatus::Pending) {
                    Err(QueueError::QueueUnavailable(format!(
                        "task {} never started within {:?}",
                        self.id, budget
                    )))
                } else {
                    Err(QueueError::QueueTimeout(format!(
                        "task {} did not finish within {:?}",
                        self.id, budget
                    )))
                }
            }
        }
    }
}

struct RunnerInner {
    store: Arc<dyn QueueStore>,
    hook: Arc<dyn CompletionHook>,
    history: Arc<TaskHistory>,
    telemetry: Arc<TelemetryCollector>,
    config: RunnerConfig,
    /// One channel per tenant with a live worker
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<TenantTask>>>,
    /// Worker tasks awaited on shutdown; finished ones are pruned on spawn
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Runs queue operations on per-tenant workers.
///
/// Tasks for one tenant execute one at a time in submission order. Tasks for
/// different tenants run concurrently.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
    cancel: CancellationToken,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn QueueStore>,
        hook: Arc<dyn CompletionHook>,
        config: RunnerConfig,
        telemetry: Arc<TelemetryCollector>,
    ) -> Self {
        let history = Arc::new(TaskHistory::new(config.history_limits));
        Self {
            inner: Arc::new(RunnerInner {
                store,
                hook,
                history,
                telemetry,
                config,
                workers: Mutex::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn history(&self) -> Arc<TaskHistory> {
        self.inner.history.clone()
    }

    /// Hand a task to the tenant's worker, starting one if needed.
    pub async fn submit(&self, tenant: &str, payload: TaskPayload) -> Result<PendingTask> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::QueueUnavailable("task runner is shut down".to_string()));
        }

        let id = self.inner.history.submitted(payload.kind(), tenant).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        let task = TenantTask {
            id,
            tenant: tenant.to_string(),
            payload,
            reply: reply_tx,
        };

        let mut workers = self.inner.workers.lock().await;
        // Shutdown may have cleared the registry while this task was being recorded
        if self.cancel.is_cancelled() {
            return Err(QueueError::QueueUnavailable("task runner is shut down".to_string()));
        }

        let task = match workers.get(tenant) {
            Some(sender) => match sender.send(task) {
                Ok(()) => None,
                // Worker exited; start a fresh one below
                Err(mpsc::error::SendError(task)) => Some(task),
            },
            None => Some(task),
        };

        if let Some(task) = task {
            let (sender, receiver) = mpsc::unbounded_channel();
            // The receiver is alive, so this cannot fail
            let _ = sender.send(task);
            workers.insert(tenant.to_string(), sender);

            debug!("Starting worker for tenant {}", tenant);
            let span = info_span!("tenant_worker", tenant = %tenant);
            let handle = tokio::spawn(
                run_worker(self.inner.clone(), tenant.to_string(), receiver).instrument(span),
            );

            let mut handles = self.inner.handles.lock().await;
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }

        Ok(PendingTask {
            id,
            reply: reply_rx,
            history: self.inner.history.clone(),
        })
    }

    /// Number of tenants with a live worker.
    pub async fn active_workers(&self) -> usize {
        self.inner.workers.lock().await.len()
    }

    /// Start the periodic task history sweep. Stops on [`TaskRunner::shutdown`].
    pub fn start_retention_sweep(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        RetentionSweeper::new(self.inner.history.clone(), interval, max_age).start(self.cancel.clone())
    }

    /// Stop accepting tasks and wait for queued ones to finish.
    ///
    /// Workers drain their channels and exit. Waiting is bounded by
    /// `drain_timeout`; workers still busy after that are left running.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let count = {
            let mut workers = self.inner.workers.lock().await;
            let count = workers.len();
            // Dropping the senders lets each worker exit once its channel is empty
            workers.clear();
            count
        };

        let handles = std::mem::take(&mut *self.inner.handles.lock().await);
        debug!("Task runner shutting down, draining {} tenant workers", count);

        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Tenant worker ended abnormally: {}", e);
                }
            }
        };

        if tokio::time::timeout(self.inner.config.drain_timeout, drain).await.is_err() {
            warn!(
                "Task runner drain exceeded {:?}, abandoning remaining tasks",
                self.inner.config.drain_timeout
            );
        } else {
            debug!("Task runner shut down");
        }
    }
}

async fn run_worker(
    inner: Arc<RunnerInner>,
    tenant: String,
    mut receiver: mpsc::UnboundedReceiver<TenantTask>,
) {
    loop {
        let task = match tokio::time::timeout(inner.config.idle_timeout, receiver.recv()).await {
            Ok(Some(task)) => task,
            // Runner shut down and the queue is drained
            Ok(None) => break,
            Err(_) => {
                // Exit under the registry lock so no submit can slip in between
                // the last check and the removal
                let mut workers = inner.workers.lock().await;
                match receiver.try_recv() {
                    Ok(task) => {
                        drop(workers);
                        task
                    }
                    Err(_) => {
                        workers.remove(&tenant);
                        debug!("Tenant worker idle, exiting");
                        break;
                    }
                }
            }
        };

        inner.execute(task).await;
    }
}

impl RunnerInner {
    async fn execute(&self, task: TenantTask) {
        let TenantTask {
            id,
            tenant,
            payload,
            reply,
        } = task;
        let kind = payload.kind();

        self.history.started(id).await;
        debug!(task.id = %id, task.kind = kind.as_str(), "Running task");

        let retry_strategy = ExponentialBuilder::default()
            .with_min_delay(self.config.retry.min_delay)
            .with_max_delay(self.config.retry.max_delay)
            .with_max_times(self.config.retry.max_retries);

        let attempts = AtomicU32::new(0);
        let this = self;
        let tenant_ref = tenant.as_str();
        let payload_ref = &payload;
        let attempts_ref = &attempts;

        let result = (move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            let result = this.apply(tenant_ref, payload_ref).await;
            if let Err(e) = &result {
                if e.is_transient() {
                    this.history.retrying(id, attempt, &e.to_string()).await;
                }
            }
            result
        })
        .retry(retry_strategy)
        .when(|e: &QueueError| e.is_transient())
        .notify(|e: &QueueError, delay: Duration| {
            warn!(task.id = %id, "Task attempt failed, retrying in {:?}: {}", delay, e);
        })
        .await;

        let attempts = attempts.load(Ordering::SeqCst);

        match &result {
            Ok(_) => {
                self.history.completed(id, attempts).await;
                self.telemetry
                    .record_event(TelemetryEvent::TaskCompleted {
                        kind: kind.as_str().to_string(),
                        attempts,
                    })
                    .await;
            }
            Err(e) => {
                error!(task.id = %id, task.kind = kind.as_str(), "Task failed after {} attempts: {}", attempts, e);
                self.history.failed(id, attempts, &e.to_string()).await;
                sentry_init::capture_task_failure(kind.as_str(), &tenant, attempts, &e.to_string());
                self.telemetry
                    .record_event(TelemetryEvent::TaskFailed {
                        kind: kind.as_str().to_string(),
                        attempts,
                        error: e.to_string(),
                    })
                    .await;
            }
        }

        // The caller may have stopped waiting
        if reply.send(result).is_err() {
            debug!(task.id = %id, "Task finished after its caller gave up");
        }
    }

    async fn apply(&self, tenant: &str, payload: &TaskPayload) -> Result<TaskOutcome> {
        match payload {
            TaskPayload::Add {
                entry_id,
                payload,
                unique,
            } => {
                if *unique {
                    let entries = self.store.list_all(tenant).await?;
                    if entries.iter().any(|e| &e.payload == payload) {
                        return Ok(TaskOutcome::AlreadyQueued);
                    }
                }
                let len = self.store.append(tenant, entry_id, payload).await?;
                Ok(TaskOutcome::Length(len))
            }
            TaskPayload::Get => {
                let entries = self.store.list_all(tenant).await?;
                Ok(TaskOutcome::Entries(entries))
            }
            TaskPayload::Remove { target, record_id } => {
                // Flag first: a failure here leaves the job queued for the next acknowledgement
                self.hook.mark_printed(tenant, record_id).await?;

                let removed = match target {
                    RemovalTarget::EntryId(entry_id) => {
                        self.store.remove_by_entry_id(tenant, entry_id).await?
                    }
                    RemovalTarget::Content(bytes) => self.store.remove_first_match(tenant, bytes).await?,
                };

                if !removed {
                    debug!("No queue entry matched record {}", record_id);
                }
                Ok(TaskOutcome::Removed(removed))
            }
        }
    }
}
