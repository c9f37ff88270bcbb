use crate::errors::{QueueError, Result};
use crate::job::{KilnRequest, QueuedJob};
use crate::runner::{RemovalTarget, TaskOutcome, TaskPayload, TaskRunner};
use crate::tasks::{TaskCounts, TaskRecord};
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a removal finds its queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMatch {
    /// Match the entry id assigned at enqueue, falling back to content for jobs without one
    #[default]
    EntryId,
    /// Match the serialized record byte for byte
    Content,
}

/// Queue contents for one tenant plus runner bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub tenant: String,
    pub queue_length: usize,
    pub jobs: Vec<QueuedJob>,
    pub tasks: TaskCounts,
}

/// Synchronous-looking façade over the task runner.
///
/// Every call submits one task and waits for it, bounded by `wait_timeout`.
pub struct QueueManager {
    runner: TaskRunner,
    telemetry: Arc<TelemetryCollector>,
    wait_timeout: Duration,
    removal_match: RemovalMatch,
}

impl QueueManager {
    pub fn new(
        runner: TaskRunner,
        telemetry: Arc<TelemetryCollector>,
        wait_timeout: Duration,
        removal_match: RemovalMatch,
    ) -> Self {
        Self {
            runner,
            telemetry,
            wait_timeout,
            removal_match,
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    async fn run(&self, tenant: &str, payload: TaskPayload) -> Result<TaskOutcome> {
        let pending = self.runner.submit(tenant, payload).await?;
        pending.wait(self.wait_timeout).await
    }

    /// Append a job to the tenant queue. Returns the new queue length.
    pub async fn enqueue(&self, tenant: &str, record: &KilnRequest) -> Result<u64> {
        self.add(tenant, record, false).await
    }

    /// Like [`QueueManager::enqueue`], but fails with `Duplicate` when a
    /// byte-identical record is already queued. The check and the append run
    /// as one task, so concurrent identical intakes queue the record once.
    pub async fn enqueue_unique(&self, tenant: &str, record: &KilnRequest) -> Result<u64> {
        self.add(tenant, record, true).await
    }

    async fn add(&self, tenant: &str, record: &KilnRequest, unique: bool) -> Result<u64> {
        let payload = record.snapshot()?;
        let entry_id = uuid::Uuid::new_v4().to_string();

        debug!("Enqueueing kiln request {} as entry {}", record.id, entry_id);

        let task = TaskPayload::Add {
            entry_id,
            payload,
            unique,
        };

        match self.run(tenant, task).await? {
            TaskOutcome::Length(len) => {
                info!("Kiln request {} queued for {} (queue length {})", record.id, tenant, len);
                self.telemetry
                    .record_event(TelemetryEvent::JobEnqueued {
                        tenant: tenant.to_string(),
                        queue_length: len,
                    })
                    .await;
                Ok(len)
            }
            TaskOutcome::AlreadyQueued => {
                info!("Kiln request {} already queued for {}", record.id, tenant);
                Err(QueueError::Duplicate(record.id.clone()))
            }
            other => Err(unexpected_outcome("add", &other)),
        }
    }

    /// All queued jobs for the tenant, oldest first.
    pub async fn list_jobs(&self, tenant: &str) -> Result<Vec<QueuedJob>> {
        let entries = match self.run(tenant, TaskPayload::Get).await? {
            TaskOutcome::Entries(entries) => entries,
            other => return Err(unexpected_outcome("get", &other)),
        };

        // An entry that no longer decodes must not wedge the whole queue
        let jobs = entries
            .into_iter()
            .filter_map(|entry| match KilnRequest::from_snapshot(&entry.payload) {
                Ok(record) => Some(QueuedJob {
                    entry_id: Some(entry.entry_id),
                    record,
                }),
                Err(e) => {
                    warn!(
                        "Skipping undecodable entry {} in {} queue: {}",
                        entry.entry_id, tenant, e
                    );
                    None
                }
            })
            .collect();

        Ok(jobs)
    }

    /// Flag the permanent record as printed, then drop the job from the queue.
    ///
    /// Removing a job that is no longer queued is not an error.
    pub async fn remove_job(&self, tenant: &str, job: &QueuedJob, record_id: &str) -> Result<bool> {
        let target = match (self.removal_match, &job.entry_id) {
            (RemovalMatch::EntryId, Some(entry_id)) => RemovalTarget::EntryId(entry_id.clone()),
            _ => RemovalTarget::Content(job.record.snapshot()?),
        };

        let payload = TaskPayload::Remove {
            target,
            record_id: record_id.to_string(),
        };

        let removed = match self.run(tenant, payload).await? {
            TaskOutcome::Removed(removed) => removed,
            other => return Err(unexpected_outcome("remove", &other)),
        };

        if removed {
            info!("Kiln request {} removed from {} queue", record_id, tenant);
        } else {
            warn!("Kiln request {} was not in the {} queue", record_id, tenant);
        }

        self.telemetry
            .record_event(TelemetryEvent::JobRemoved {
                tenant: tenant.to_string(),
                record_id: record_id.to_string(),
                removed,
            })
            .await;

        Ok(removed)
    }

    /// Whether a byte-identical record is already queued for the tenant.
    pub async fn contains_duplicate(&self, tenant: &str, record: &KilnRequest) -> Result<bool> {
        let snapshot = record.snapshot()?;
        let entries = match self.run(tenant, TaskPayload::Get).await? {
            TaskOutcome::Entries(entries) => entries,
            other => return Err(unexpected_outcome("get", &other)),
        };
        Ok(entries.iter().any(|e| e.payload == snapshot))
    }

    pub async fn snapshot(&self, tenant: &str) -> Result<QueueSnapshot> {
        let jobs = self.list_jobs(tenant).await?;
        let tasks = self.runner.history().counts().await;

        Ok(QueueSnapshot {
            tenant: tenant.to_string(),
            queue_length: jobs.len(),
            jobs,
            tasks,
        })
    }

    /// Most recent background tasks, newest first.
    pub async fn task_history(&self, limit: usize) -> Vec<TaskRecord> {
        self.runner.history().recent(limit).await
    }
}

fn unexpected_outcome(kind: &str, outcome: &TaskOutcome) -> QueueError {
    QueueError::Other(anyhow::anyhow!(
        "unexpected outcome for {} task: {:?}",
        kind,
        outcome
    ))
}
