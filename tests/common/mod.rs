// Common test utilities and fixtures

use async_trait::async_trait;
use kiln_print_queue::photo::{EncodedImage, PhotoRenderer};
use kiln_print_queue::tasks::HistoryLimits;
use kiln_print_queue::telemetry::TelemetryCollector;
use kiln_print_queue::{
    CompletionHook, KilnRequest, QueueError, QueueManager, QueueStore, RemovalMatch, Result,
    RetryPolicy, RunnerConfig, SqliteQueueStore, StoredEntry, TaskRunner,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[allow(dead_code)]
pub fn kiln_request(id: &str, account_id: &str, first_name: &str) -> KilnRequest {
    KilnRequest {
        id: id.to_string(),
        account_id: account_id.to_string(),
        first_name: first_name.to_string(),
        last_name: "Potter".to_string(),
        email: None,
        opt_in: Some(false),
        length: 4.0,
        width: 5.0,
        height: 6.5,
        quantity: 2,
        cost: serde_json::json!(12.5),
        firing_type: "Bisque".to_string(),
        non_member: Some(false),
        photo_url: None,
        printed: false,
        exported: false,
        created_at: "2024-10-03T17:45:12.123456+00:00".to_string(),
        updated_at: None,
        created_by: None,
        updated_by: None,
        extra: serde_json::Map::new(),
    }
}

/// SQLite store with failure injection and per-tenant concurrency tracking
#[allow(dead_code)]
pub struct TestStore {
    inner: SqliteQueueStore,
    append_failures: AtomicUsize,
    remove_failures: AtomicUsize,
    list_failures: AtomicUsize,
    permanent: AtomicBool,
    delay: Mutex<Duration>,
    in_flight: Mutex<HashMap<String, usize>>,
    total_in_flight: AtomicUsize,
    pub max_per_tenant: AtomicUsize,
    pub max_total: AtomicUsize,
    /// (tenant, operation) in the order operations started
    pub ops: Mutex<Vec<(String, &'static str)>>,
}

#[allow(dead_code)]
impl TestStore {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteQueueStore::open_in_memory().await.unwrap(),
            append_failures: AtomicUsize::new(0),
            remove_failures: AtomicUsize::new(0),
            list_failures: AtomicUsize::new(0),
            permanent: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            in_flight: Mutex::new(HashMap::new()),
            total_in_flight: AtomicUsize::new(0),
            max_per_tenant: AtomicUsize::new(0),
            max_total: AtomicUsize::new(0),
            ops: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_appends(&self, n: usize) {
        self.append_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, n: usize) {
        self.remove_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, n: usize) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    /// Injected failures become non-retryable database errors
    pub fn permanent_errors(&self) {
        self.permanent.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn op_log(&self) -> Vec<(String, &'static str)> {
        self.ops.lock().unwrap().clone()
    }

    fn take_failure(&self, counter: &AtomicUsize) -> Result<()> {
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !injected {
            return Ok(());
        }
        if self.permanent.load(Ordering::SeqCst) {
            Err(QueueError::Database("injected failure".to_string()))
        } else {
            Err(QueueError::StoreUnavailable("injected failure".to_string()))
        }
    }

    async fn enter(&self, tenant: &str, op: &'static str) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(tenant.to_string()).or_insert(0);
            *count += 1;
            self.max_per_tenant.fetch_max(*count, Ordering::SeqCst);
        }
        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);
        self.ops.lock().unwrap().push((tenant.to_string(), op));

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn exit(&self, tenant: &str) {
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(tenant) {
            *count -= 1;
        }
        self.total_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueStore for TestStore {
    async fn list_all(&self, tenant: &str) -> Result<Vec<StoredEntry>> {
        self.enter(tenant, "list").await;
        let result = match self.take_failure(&self.list_failures) {
            Ok(()) => self.inner.list_all(tenant).await,
            Err(e) => Err(e),
        };
        self.exit(tenant);
        result
    }

    async fn append(&self, tenant: &str, entry_id: &str, payload: &[u8]) -> Result<u64> {
        self.enter(tenant, "append").await;
        let result = match self.take_failure(&self.append_failures) {
            Ok(()) => self.inner.append(tenant, entry_id, payload).await,
            Err(e) => Err(e),
        };
        self.exit(tenant);
        result
    }

    async fn remove_first_match(&self, tenant: &str, payload: &[u8]) -> Result<bool> {
        self.enter(tenant, "remove").await;
        let result = match self.take_failure(&self.remove_failures) {
            Ok(()) => self.inner.remove_first_match(tenant, payload).await,
            Err(e) => Err(e),
        };
        self.exit(tenant);
        result
    }

    async fn remove_by_entry_id(&self, tenant: &str, entry_id: &str) -> Result<bool> {
        self.enter(tenant, "remove").await;
        let result = match self.take_failure(&self.remove_failures) {
            Ok(()) => self.inner.remove_by_entry_id(tenant, entry_id).await,
            Err(e) => Err(e),
        };
        self.exit(tenant);
        result
    }

    async fn len(&self, tenant: &str) -> Result<u64> {
        self.inner.len(tenant).await
    }
}

/// Completion hook that records flagged ids
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingHook {
    pub flagged: Mutex<Vec<(String, String)>>,
    pub calls: AtomicUsize,
    transient_failures: AtomicUsize,
    permanent: AtomicBool,
}

#[allow(dead_code)]
impl RecordingHook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_transiently(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_permanently(&self) {
        self.permanent.store(true, Ordering::SeqCst);
    }

    pub fn flagged_ids(&self) -> Vec<String> {
        self.flagged
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionHook for RecordingHook {
    async fn mark_printed(&self, tenant: &str, record_id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.permanent.load(Ordering::SeqCst) {
            return Err(QueueError::CompletionHook("row rejected".to_string()));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::HookUnavailable("supabase down".to_string()));
        }

        self.flagged
            .lock()
            .unwrap()
            .push((tenant.to_string(), record_id.to_string()));
        Ok(())
    }
}

/// Photo renderer returning a fixed image, or failing when `image` is None
#[allow(dead_code)]
pub struct StaticPhotos {
    pub image: Option<EncodedImage>,
}

#[async_trait]
impl PhotoRenderer for StaticPhotos {
    async fn render(&self, _url: &str) -> Result<EncodedImage> {
        self.image
            .clone()
            .ok_or_else(|| QueueError::Photo("not found".to_string()))
    }
}

/// Millisecond backoff so retry tests stay fast
#[allow(dead_code)]
pub fn fast_runner_config() -> RunnerConfig {
    RunnerConfig {
        retry: RetryPolicy {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_retries: 3,
        },
        idle_timeout: Duration::from_secs(5),
        history_limits: HistoryLimits::default(),
        drain_timeout: Duration::from_secs(5),
    }
}

/// Test configuration builder
#[allow(dead_code)]
pub struct TestManagerBuilder {
    config: RunnerConfig,
    wait_timeout: Duration,
    removal_match: RemovalMatch,
}

#[allow(dead_code)]
impl TestManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: fast_runner_config(),
            wait_timeout: Duration::from_secs(5),
            removal_match: RemovalMatch::EntryId,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_removal_match(mut self, removal_match: RemovalMatch) -> Self {
        self.removal_match = removal_match;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    pub fn build(
        self,
        store: Arc<dyn QueueStore>,
        hook: Arc<dyn CompletionHook>,
    ) -> (Arc<QueueManager>, Arc<TelemetryCollector>) {
        let telemetry = Arc::new(TelemetryCollector::new());
        let runner = TaskRunner::new(store, hook, self.config, telemetry.clone());
        let manager = Arc::new(QueueManager::new(
            runner,
            telemetry.clone(),
            self.wait_timeout,
            self.removal_match,
        ));
        (manager, telemetry)
    }
}

#[allow(dead_code)]
pub fn record_ids(jobs: &[kiln_print_queue::QueuedJob]) -> Vec<String> {
    jobs.iter().map(|j| j.record_id().to_string()).collect()
}
