//! Shared fixtures and fake collaborators for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tidescale_autoscale::{
    CapacityProvider, ManualClock, MetricsProvider, PolicyStore, ProviderClients, ProviderError,
    ProviderFactory, Reconciler, StoreError, SyncSettings, SyncerRegistry,
};
use tidescale_core::{
    AutoscalePolicy, AutoscaleStatus, ClusterRef, ControllerConfig, InstanceRef, PolicyRecord,
    ResourceId, SecretRef,
};
use tidescale_state::{SecretData, StateStore};

pub const NOW: u64 = 1_700_000_000;

pub fn cluster() -> ClusterRef {
    ClusterRef {
        project_id: "acme-prod".to_string(),
        instance_id: "orders-db".to_string(),
        cluster_id: "orders-db-c1".to_string(),
    }
}

pub fn policy() -> AutoscalePolicy {
    AutoscalePolicy {
        min_nodes: 1,
        max_nodes: 10,
        max_scale_down_nodes: None,
        target_utilization: 50,
        cluster_ref: cluster(),
        credentials_ref: SecretRef {
            name: "provider-creds".to_string(),
            namespace: None,
            key: "credentials.json".to_string(),
        },
    }
}

pub fn seed_policy(store: &StateStore, id: &ResourceId, policy: &AutoscalePolicy) -> PolicyRecord {
    store.put_policy(id, policy).unwrap()
}

pub fn seed_secret(store: &StateStore, namespace: &str) {
    let mut data = BTreeMap::new();
    data.insert("credentials.json".to_string(), b"{\"token\":\"t\"}".to_vec());
    store
        .put_secret(&SecretData {
            namespace: namespace.to_string(),
            name: "provider-creds".to_string(),
            data,
        })
        .unwrap();
}

/// Overwrite a record's status at its current version.
pub fn set_status(store: &StateStore, id: &ResourceId, status: AutoscaleStatus) {
    let record = store.get_policy(id).unwrap().unwrap();
    store.update_status(id, &status, record.version).unwrap();
}

pub fn status(store: &StateStore, id: &ResourceId) -> AutoscaleStatus {
    store.get_policy(id).unwrap().unwrap().status
}

/// Controller settings with intervals short enough for tests.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        sync_interval: Duration::from_millis(20),
        conflict_requeue: Duration::from_secs(1),
        provider_timeout: Duration::from_millis(500),
        resync_interval: Duration::from_millis(50),
        error_backoff_base: Duration::from_millis(20),
        error_backoff_max: Duration::from_millis(200),
        ..ControllerConfig::default()
    }
}

/// Settings where the sync loop never ticks during a test.
pub fn quiet_config() -> ControllerConfig {
    ControllerConfig {
        sync_interval: Duration::from_secs(3600),
        ..fast_config()
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Fakes ──────────────────────────────────────────────────────

/// Capacity provider over an in-memory cluster map.
#[derive(Default)]
pub struct FakeCapacity {
    pub nodes: Mutex<HashMap<String, u32>>,
    pub set_calls: Mutex<Vec<(String, u32)>>,
    pub fail_set: AtomicBool,
}

impl FakeCapacity {
    pub fn with_cluster(cluster_id: &str, nodes: u32) -> Self {
        let fake = Self::default();
        fake.nodes.lock().unwrap().insert(cluster_id.to_string(), nodes);
        fake
    }

    pub fn set_calls(&self) -> Vec<(String, u32)> {
        self.set_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapacityProvider for FakeCapacity {
    async fn list_cluster_node_counts(
        &self,
        _instance: &InstanceRef,
    ) -> Result<Vec<(String, u32)>, ProviderError> {
        let nodes = self.nodes.lock().unwrap();
        Ok(nodes.iter().map(|(id, n)| (id.clone(), *n)).collect())
    }

    async fn set_cluster_node_count(
        &self,
        _instance: &InstanceRef,
        cluster_id: &str,
        nodes: u32,
    ) -> Result<(), ProviderError> {
        self.set_calls
            .lock()
            .unwrap()
            .push((cluster_id.to_string(), nodes));
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(ProviderError::Backend("quota exceeded".to_string()));
        }
        self.nodes.lock().unwrap().insert(cluster_id.to_string(), nodes);
        Ok(())
    }
}

/// Metrics provider reporting a settable utilization.
#[derive(Default)]
pub struct FakeMetrics {
    pub utilization: AtomicU32,
    pub fail: AtomicBool,
    pub calls: AtomicU32,
}

impl FakeMetrics {
    pub fn reporting(utilization: u32) -> Self {
        Self {
            utilization: AtomicU32::new(utilization),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsProvider for FakeMetrics {
    async fn current_utilization(
        &self,
        project_id: &str,
        _window: Duration,
    ) -> Result<u32, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::NoData(project_id.to_string()));
        }
        Ok(self.utilization.load(Ordering::SeqCst))
    }
}

pub fn clients(capacity: &Arc<FakeCapacity>, metrics: &Arc<FakeMetrics>) -> ProviderClients {
    ProviderClients {
        capacity: capacity.clone(),
        metrics: metrics.clone(),
    }
}

/// Factory that hands out the same fake clients on every connect.
pub struct FakeFactory {
    pub capacity: Arc<FakeCapacity>,
    pub metrics: Arc<FakeMetrics>,
    pub connects: AtomicU32,
}

#[async_trait]
impl ProviderFactory for FakeFactory {
    async fn connect(
        &self,
        credentials: &[u8],
        _cluster: &ClusterRef,
    ) -> Result<ProviderClients, ProviderError> {
        assert!(!credentials.is_empty(), "connect called without credentials");
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(clients(&self.capacity, &self.metrics))
    }
}

/// Policy store wrapper that can inject conflicts and backend failures.
pub struct FlakyStore {
    pub inner: StateStore,
    conflicts: AtomicU32,
    broken: AtomicBool,
    panic_next_read: AtomicBool,
    write_failure: Mutex<Option<StoreError>>,
    pub writes: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: StateStore) -> Self {
        Self {
            inner,
            conflicts: AtomicU32::new(0),
            broken: AtomicBool::new(false),
            panic_next_read: AtomicBool::new(false),
            write_failure: Mutex::new(None),
            writes: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` status writes with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn break_backend(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Make the next `get` panic, as a buggy backend might.
    pub fn panic_on_next_read(&self) {
        self.panic_next_read.store(true, Ordering::SeqCst);
    }

    /// Fail every status write with `error`; reads still succeed.
    pub fn fail_writes_with(&self, error: StoreError) {
        *self.write_failure.lock().unwrap() = Some(error);
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyStore for FlakyStore {
    async fn get(&self, id: &ResourceId) -> Result<PolicyRecord, StoreError> {
        if self.panic_next_read.swap(false, Ordering::SeqCst) {
            panic!("corrupt record for {id}");
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk I/O error".to_string()));
        }
        PolicyStore::get(&self.inner, id).await
    }

    async fn update_status(
        &self,
        id: &ResourceId,
        status: &AutoscaleStatus,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk I/O error".to_string()));
        }
        if let Some(error) = self.write_failure.lock().unwrap().clone() {
            return Err(error);
        }
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict(format!("{id} modified concurrently")));
        }
        PolicyStore::update_status(&self.inner, id, status, expected_version).await
    }

    async fn list_ids(&self) -> Result<Vec<ResourceId>, StoreError> {
        PolicyStore::list_ids(&self.inner).await
    }
}

/// Everything a reconcile or sync test needs, wired together.
pub struct Harness {
    pub store: StateStore,
    pub flaky: Arc<FlakyStore>,
    pub clock: Arc<ManualClock>,
    pub capacity: Arc<FakeCapacity>,
    pub metrics: Arc<FakeMetrics>,
    pub factory: Arc<FakeFactory>,
    pub syncers: Arc<SyncerRegistry>,
    pub reconciler: Arc<Reconciler>,
    pub config: ControllerConfig,
}

impl Harness {
    pub fn new(config: ControllerConfig) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let clock = Arc::new(ManualClock::new(NOW));
        let capacity = Arc::new(FakeCapacity::with_cluster(&cluster().cluster_id, 2));
        let metrics = Arc::new(FakeMetrics::reporting(80));
        let factory = Arc::new(FakeFactory {
            capacity: capacity.clone(),
            metrics: metrics.clone(),
            connects: AtomicU32::new(0),
        });
        let syncers = Arc::new(SyncerRegistry::new(
            flaky.clone(),
            clock.clone(),
            SyncSettings::from_config(&config),
        ));
        let reconciler = Arc::new(Reconciler::new(
            flaky.clone(),
            Arc::new(store.clone()),
            factory.clone(),
            syncers.clone(),
            clock.clone(),
            config.clone(),
        ));

        Self {
            store,
            flaky,
            clock,
            capacity,
            metrics,
            factory,
            syncers,
            reconciler,
            config,
        }
    }

    pub fn clients(&self) -> ProviderClients {
        clients(&self.capacity, &self.metrics)
    }

    /// Store a policy and its credentials secret.
    pub fn seed(&self, id: &ResourceId, policy: &AutoscalePolicy) -> PolicyRecord {
        seed_secret(&self.store, &id.namespace);
        seed_policy(&self.store, id, policy)
    }
}
