//! Bookkeeping for background tasks: per-task records, bounded history and the
//! periodic retention sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Add,
    Remove,
    Get,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Add => "add",
            TaskKind::Remove => "remove",
            TaskKind::Get => "get",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub kind: TaskKind,
    pub tenant: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// How many terminal records are kept regardless of age.
#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            keep_completed: 10,
            keep_failed: 50,
        }
    }
}

/// Task records in creation order.
pub struct TaskHistory {
    records: RwLock<Vec<TaskRecord>>,
    limits: HistoryLimits,
}

impl TaskHistory {
    pub fn new(limits: HistoryLimits) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            limits,
        }
    }

    /// Register a new pending task and return its id.
    pub async fn submitted(&self, kind: TaskKind, tenant: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut records = self.records.write().await;
        records.push(TaskRecord {
            id,
            kind,
            tenant: tenant.to_string(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        });
        id
    }

    pub async fn started(&self, id: Uuid) {
        self.update(id, |record| {
            record.status = TaskStatus::Active;
            record.started_at = Some(Utc::now());
        })
        .await;
    }

    /// Record one failed attempt that is about to be retried.
    pub async fn retrying(&self, id: Uuid, attempts: u32, error: &str) {
        self.update(id, |record| {
            record.attempts = attempts;
            record.last_error = Some(error.to_string());
        })
        .await;
    }

    pub async fn completed(&self, id: Uuid, attempts: u32) {
        self.update(id, |record| {
            record.status = TaskStatus::Completed;
            record.attempts = attempts;
            record.finished_at = Some(Utc::now());
        })
        .await;
        self.enforce_limits().await;
    }

    pub async fn failed(&self, id: Uuid, attempts: u32, error: &str) {
        self.update(id, |record| {
            record.status = TaskStatus::Failed;
            record.attempts = attempts;
            record.last_error = Some(error.to_string());
            record.finished_at = Some(Utc::now());
        })
        .await;
        self.enforce_limits().await;
    }

    async fn update<F>(&self, id: Uuid, apply: F)
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut records = self.records.write().await;
        // Recent tasks sit at the back
        if let Some(record) = records.iter_mut().rev().find(|r| r.id == id) {
            apply(record);
        }
    }

    /// Drop the oldest terminal records beyond the configured caps.
    async fn enforce_limits(&self) {
        let mut records = self.records.write().await;

        for (status, keep) in [
            (TaskStatus::Completed, self.limits.keep_completed),
            (TaskStatus::Failed, self.limits.keep_failed),
        ] {
            let count = records.iter().filter(|r| r.status == status).count();
            if count <= keep {
                continue;
            }

            let mut excess = count - keep;
            records.retain(|r| {
                if excess > 0 && r.status == status {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Delete terminal records that finished before `cutoff`. Returns how many were removed.
    pub async fn sweep_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| match (r.status.is_terminal(), r.finished_at) {
            (true, Some(finished)) => finished >= cutoff,
            _ => true,
        });
        before - records.len()
    }

    pub async fn get(&self, id: Uuid) -> Option<TaskRecord> {
        let records = self.records.read().await;
        records.iter().rev().find(|r| r.id == id).cloned()
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TaskRecord> {
        let records = self.records.read().await;
        records.iter().rev().take(limit).cloned().collect()
    }

    pub async fn counts(&self) -> TaskCounts {
        let records = self.records.read().await;
        let mut counts = TaskCounts::default();
        for record in records.iter() {
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Active => counts.active += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

impl Default for TaskHistory {
    fn default() -> Self {
        Self::new(HistoryLimits::default())
    }
}

/// Periodically prunes old task records. Never touches tenant queues.
pub struct RetentionSweeper {
    history: Arc<TaskHistory>,
    interval: Duration,
    max_age: Duration,
}

impl RetentionSweeper {
    pub fn new(history: Arc<TaskHistory>, interval: Duration, max_age: Duration) -> Self {
        Self {
            history,
            interval,
            max_age,
        }
    }

    /// Run one sweep now.
    pub async fn sweep(&self) -> usize {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::days(1));
        let cleaned = self.history.sweep_finished_before(Utc::now() - max_age).await;
        if cleaned > 0 {
            info!("Cleaned {} finished background tasks", cleaned);
        } else {
            debug!("Retention sweep found nothing to clean");
        }
        cleaned
    }

    /// Start the sweep loop. It stops when `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            "Starting task retention sweep (every {:?}, max age {:?})",
            self.interval, self.max_age
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Retention sweep stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}
