use crate::epos::TicketOptions;
use crate::errors::{QueueError, Result};
use crate::queue::RemovalMatch;
use crate::runner::{RetryPolicy, RunnerConfig};
use crate::tasks::HistoryLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Path of an optional JSON config file
pub const CONFIG_PATH_ENV: &str = "KILN_QUEUE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: String,
    /// Queue database; defaults to the platform data directory
    pub database_path: Option<PathBuf>,
    /// Directory for daily rolling log files; stdout only when unset
    pub log_dir: Option<PathBuf>,
    pub supabase_url: String,
    pub service_role_key: String,

    pub task_wait_timeout_secs: u64,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: usize,
    pub worker_idle_secs: u64,
    pub keep_completed_tasks: usize,
    pub keep_failed_tasks: usize,
    pub sweep_interval_secs: u64,
    pub max_task_age_secs: u64,
    /// How long shutdown waits for queued tasks before closing the store
    pub shutdown_drain_secs: u64,

    pub removal_match: RemovalMatch,
    /// Refuse intake of a record that is already queued byte for byte
    pub reject_duplicates: bool,

    pub printer: PrinterConfig,
    pub telemetry_report_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    pub device_id: String,
    pub timeout_ms: u64,
    /// Photos wider than this are scaled down before printing
    pub image_width: u32,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            device_id: "local_printer".to_string(),
            timeout_ms: 10000,
            image_width: 400,
        }
    }
}

impl AppConfig {
    /// Defaults, then the JSON file named by `KILN_QUEUE_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QueueError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config = serde_json::from_str(&raw).map_err(|e| {
            QueueError::Config(format!("Invalid config {}: {}", path.display(), e))
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("KILN_QUEUE_LISTEN") {
            self.listen_addr = addr;
        }
        if let Ok(db) = std::env::var("KILN_QUEUE_DB") {
            self.database_path = Some(PathBuf::from(db));
        }
        if let Ok(url) = std::env::var("SUPABASE_URL") {
            self.supabase_url = url;
        }
        if let Ok(key) = std::env::var("SUPABASE_SERVICE_ROLE_KEY") {
            self.service_role_key = key;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.supabase_url.is_empty() {
            return Err(QueueError::Config("supabase_url is not set".to_string()));
        }
        if self.service_role_key.is_empty() {
            return Err(QueueError::Config("service_role_key is not set".to_string()));
        }
        if self.task_wait_timeout_secs == 0 {
            return Err(QueueError::Config(
                "task_wait_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }

        let data_dir = if cfg!(target_os = "macos") {
            dirs::home_dir()
                .map(|p| p.join("Library/Application Support/kiln-print-queue"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            dirs::data_dir()
                .map(|p| p.join("kiln-print-queue"))
                .unwrap_or_else(|| PathBuf::from("."))
        };

        data_dir.join("print-queue.db")
    }

    pub fn task_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.task_wait_timeout_secs)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            retry: RetryPolicy {
                min_delay: Duration::from_millis(self.retry_min_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                max_retries: self.retry_max_attempts,
            },
            idle_timeout: Duration::from_secs(self.worker_idle_secs),
            history_limits: HistoryLimits {
                keep_completed: self.keep_completed_tasks,
                keep_failed: self.keep_failed_tasks,
            },
            drain_timeout: Duration::from_secs(self.shutdown_drain_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_task_age(&self) -> Duration {
        Duration::from_secs(self.max_task_age_secs)
    }

    pub fn ticket_options(&self) -> TicketOptions {
        TicketOptions {
            device_id: self.printer.device_id.clone(),
            timeout_ms: self.printer.timeout_ms,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8043".to_string(),
            database_path: None,
            log_dir: None,
            supabase_url: String::new(),
            service_role_key: String::new(),
            task_wait_timeout_secs: 30,
            retry_min_delay_ms: 200,
            retry_max_delay_ms: 5000,
            retry_max_attempts: 5,
            worker_idle_secs: 300,
            keep_completed_tasks: 10,
            keep_failed_tasks: 50,
            sweep_interval_secs: 3600,
            max_task_age_secs: 24 * 3600,
            shutdown_drain_secs: 30,
            removal_match: RemovalMatch::EntryId,
            reject_duplicates: false,
            printer: PrinterConfig::default(),
            telemetry_report_secs: 300,
        }
    }
}
