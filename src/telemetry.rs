use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Maximum number of events kept in memory
const EVENT_HISTORY_LIMIT: usize = 1000;

/// Telemetry event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Job appended to a tenant queue
    JobEnqueued { tenant: String, queue_length: u64 },
    /// Printer acknowledged a job and it left the queue
    JobRemoved {
        tenant: String,
        record_id: String,
        removed: bool,
    },
    /// Printer poll answered
    PollServed {
        tenant: String,
        connection_type: String,
        status: u16,
    },
    /// Background task finished
    TaskCompleted { kind: String, attempts: u32 },
    /// Background task exhausted its retries or hit a permanent error
    TaskFailed {
        kind: String,
        attempts: u32,
        error: String,
    },
}

/// Telemetry metrics for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    pub jobs_enqueued: u64,
    pub jobs_removed: u64,
    /// `GetRequest` polls that returned a ticket
    pub polls_with_job: u64,
    /// `GetRequest` polls against an empty queue
    pub polls_empty: u64,
    pub acknowledgements: u64,
    pub poll_errors: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Extra attempts spent on retries across all tasks
    pub task_retries: u64,
    pub last_update_ts: u64,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self {
            jobs_enqueued: 0,
            jobs_removed: 0,
            polls_with_job: 0,
            polls_empty: 0,
            acknowledgements: 0,
            poll_errors: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            task_retries: 0,
            last_update_ts: now_secs(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Telemetry collector for aggregating metrics
pub struct TelemetryCollector {
    metrics: Arc<RwLock<TelemetryMetrics>>,
    event_history: Arc<RwLock<Vec<(u64, TelemetryEvent)>>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(TelemetryMetrics::default())),
            event_history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Record telemetry event
    pub async fn record_event(&self, event: TelemetryEvent) {
        let timestamp = now_secs();

        let mut metrics = self.metrics.write().await;

        match &event {
            TelemetryEvent::JobEnqueued { tenant, queue_length } => {
                metrics.jobs_enqueued += 1;
                debug!("Job enqueued for {} (queue length {})", tenant, queue_length);
            }
            TelemetryEvent::JobRemoved { removed, .. } => {
                if *removed {
                    metrics.jobs_removed += 1;
                }
            }
            TelemetryEvent::PollServed {
                connection_type,
                status,
                ..
            } => match (connection_type.as_str(), *status) {
                ("GetRequest", 200) => metrics.polls_with_job += 1,
                ("GetRequest", 201) => metrics.polls_empty += 1,
                ("SetResponse", 200) => metrics.acknowledgements += 1,
                _ => metrics.poll_errors += 1,
            },
            TelemetryEvent::TaskCompleted { attempts, .. } => {
                metrics.tasks_completed += 1;
                metrics.task_retries += u64::from(attempts.saturating_sub(1));
            }
            TelemetryEvent::TaskFailed {
                kind,
                attempts,
                error,
            } => {
                metrics.tasks_failed += 1;
                metrics.task_retries += u64::from(attempts.saturating_sub(1));
                debug!("Task {} failed after {} attempts: {}", kind, attempts, error);
            }
        }

        metrics.last_update_ts = timestamp;
        drop(metrics);

        let mut history = self.event_history.write().await;
        history.push((timestamp, event));

        if history.len() > EVENT_HISTORY_LIMIT {
            history.remove(0);
        }
    }

    pub async fn get_metrics(&self) -> TelemetryMetrics {
        self.metrics.read().await.clone()
    }

    /// Get event history (last N events)
    pub async fn get_event_history(&self, limit: usize) -> Vec<(u64, TelemetryEvent)> {
        let history = self.event_history.read().await;
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub async fn get_metrics_json(&self) -> serde_json::Value {
        let metrics = self.get_metrics().await;
        serde_json::to_value(&metrics).unwrap_or_default()
    }

    /// Export metrics for external monitoring (Prometheus format)
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.get_metrics().await;

        format!(
            "# HELP kiln_queue_jobs_enqueued_total Jobs appended to tenant queues\n\
             # TYPE kiln_queue_jobs_enqueued_total counter\n\
             kiln_queue_jobs_enqueued_total {}\n\
             \n\
             # HELP kiln_queue_jobs_removed_total Jobs removed after printer acknowledgement\n\
             # TYPE kiln_queue_jobs_removed_total counter\n\
             kiln_queue_jobs_removed_total {}\n\
             \n\
             # HELP kiln_queue_polls_total Printer polls by outcome\n\
             # TYPE kiln_queue_polls_total counter\n\
             kiln_queue_polls_total{{outcome=\"job\"}} {}\n\
             kiln_queue_polls_total{{outcome=\"empty\"}} {}\n\
             kiln_queue_polls_total{{outcome=\"ack\"}} {}\n\
             kiln_queue_polls_total{{outcome=\"error\"}} {}\n\
             \n\
             # HELP kiln_queue_tasks_total Background tasks by final status\n\
             # TYPE kiln_queue_tasks_total counter\n\
             kiln_queue_tasks_total{{status=\"completed\"}} {}\n\
             kiln_queue_tasks_total{{status=\"failed\"}} {}\n\
             \n\
             # HELP kiln_queue_task_retries_total Retry attempts spent by background tasks\n\
             # TYPE kiln_queue_task_retries_total counter\n\
             kiln_queue_task_retries_total {}\n",
            metrics.jobs_enqueued,
            metrics.jobs_removed,
            metrics.polls_with_job,
            metrics.polls_empty,
            metrics.acknowledgements,
            metrics.poll_errors,
            metrics.tasks_completed,
            metrics.tasks_failed,
            metrics.task_retries,
        )
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic telemetry reporter (writes a summary line to the log)
pub struct TelemetryReporter {
    collector: Arc<TelemetryCollector>,
}

impl TelemetryReporter {
    pub fn new(collector: Arc<TelemetryCollector>) -> Self {
        Self { collector }
    }

    pub fn start_reporting(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let collector = self.collector.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;

                let metrics = collector.get_metrics().await;

                info!(
                    "Telemetry Report - Jobs: {} enqueued, {} removed | Polls: {} with job, {} empty, {} errors | Tasks: {} completed, {} failed, {} retries",
                    metrics.jobs_enqueued,
                    metrics.jobs_removed,
                    metrics.polls_with_job,
                    metrics.polls_empty,
                    metrics.poll_errors,
                    metrics.tasks_completed,
                    metrics.tasks_failed,
                    metrics.task_retries,
                );
            }
        })
    }
}
