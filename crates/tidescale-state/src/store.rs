//! StateStore — redb-backed state persistence for Tidescale.
//!
//! Provides typed operations over policy records, secrets, cluster
//! capacity, and utilization samples. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(POLICIES).map_err(map_err!(Storage))?;
        txn.open_table(SECRETS).map_err(map_err!(Storage))?;
        txn.open_table(CLUSTERS).map_err(map_err!(Storage))?;
        txn.open_table(UTILIZATION).map_err(map_err!(Storage))?;
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    // ── Policies ───────────────────────────────────────────────────

    /// Admit a policy: create it, or replace the spec of an existing record.
    ///
    /// An existing status is preserved. The version is bumped either way.
    pub fn put_policy(&self, id: &ResourceId, policy: &AutoscalePolicy) -> StateResult<PolicyRecord> {
        policy
            .validate()
            .map_err(|e| StateError::Invalid(format!("{id}: {e}")))?;

        let key = id.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let record;
        {
            let mut table = txn.open_table(POLICIES).map_err(map_err!(Storage))?;
            let existing = read_record(&table, &key)?;
            record = match existing {
                Some(mut current) => {
                    current.policy = policy.clone();
                    current.version += 1;
                    current
                }
                None => PolicyRecord {
                    id: id.clone(),
                    policy: policy.clone(),
                    status: AutoscaleStatus::default(),
                    version: 1,
                },
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Codec))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(%key, version = record.version, "policy stored");
        Ok(record)
    }

    /// Get a policy record by identity.
    pub fn get_policy(&self, id: &ResourceId) -> StateResult<Option<PolicyRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(POLICIES).map_err(map_err!(Storage))?;
        read_record(&table, &id.table_key())
    }

    /// List all policy records.
    pub fn list_policies(&self) -> StateResult<Vec<PolicyRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(POLICIES).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let record: PolicyRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete a policy record. Returns true if it existed.
    pub fn delete_policy(&self, id: &ResourceId) -> StateResult<bool> {
        let key = id.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let existed;
        {
            let mut table = txn.open_table(POLICIES).map_err(map_err!(Storage))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(%key, existed, "policy deleted");
        Ok(existed)
    }

    /// Replace a record's status if its version still equals `expected_version`.
    ///
    /// Returns the new version. Fails with `NotFound` if the record is gone
    /// and `Conflict` if another writer got there first.
    pub fn update_status(
        &self,
        id: &ResourceId,
        status: &AutoscaleStatus,
        expected_version: u64,
    ) -> StateResult<u64> {
        let key = id.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let version;
        {
            let mut table = txn.open_table(POLICIES).map_err(map_err!(Storage))?;
            let mut record =
                read_record(&table, &key)?.ok_or_else(|| StateError::NotFound(key.clone()))?;
            if record.version != expected_version {
                return Err(StateError::Conflict {
                    key,
                    expected: expected_version,
                    actual: record.version,
                });
            }
            record.status = status.clone();
            record.version += 1;
            version = record.version;
            let value = serde_json::to_vec(&record).map_err(map_err!(Codec))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(%key, version, "status updated");
        Ok(version)
    }

    // ── Secrets ────────────────────────────────────────────────────

    /// Insert or replace a secret.
    pub fn put_secret(&self, secret: &SecretData) -> StateResult<()> {
        let key = secret.table_key();
        let value = serde_json::to_vec(secret).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_err!(Storage))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(%key, keys = secret.data.len(), "secret stored");
        Ok(())
    }

    /// Get a secret by namespace and name.
    pub fn get_secret(&self, namespace: &str, name: &str) -> StateResult<Option<SecretData>> {
        let key = format!("{namespace}/{name}");
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(SECRETS).map_err(map_err!(Storage))?;
        match table.get(key.as_str()).map_err(map_err!(Storage))? {
            Some(guard) => {
                let secret: SecretData =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(secret))
            }
            None => Ok(None),
        }
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Record the serving node count of a cluster.
    pub fn set_cluster_nodes(&self, cluster: &ClusterRef, nodes: u32) -> StateResult<()> {
        let capacity = ClusterCapacity {
            project_id: cluster.project_id.clone(),
            instance_id: cluster.instance_id.clone(),
            cluster_id: cluster.cluster_id.clone(),
            nodes,
            updated_at: epoch_secs(),
        };
        let key = capacity.table_key();
        let value = serde_json::to_vec(&capacity).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Storage))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(%key, nodes, "cluster capacity stored");
        Ok(())
    }

    /// Get one cluster's capacity row.
    pub fn get_cluster(&self, cluster: &ClusterRef) -> StateResult<Option<ClusterCapacity>> {
        let key = cluster.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Storage))?;
        match table.get(key.as_str()).map_err(map_err!(Storage))? {
            Some(guard) => {
                let capacity: ClusterCapacity =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(capacity))
            }
            None => Ok(None),
        }
    }

    /// List every cluster of an instance.
    ///
    /// The key prefix narrows the scan; ids may themselves contain the
    /// separator, so matches are confirmed against the stored fields.
    pub fn list_clusters(&self, project_id: &str, instance_id: &str) -> StateResult<Vec<ClusterCapacity>> {
        let prefix = format!("{project_id}/{instance_id}/");
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            if key.value().starts_with(&prefix) {
                let capacity: ClusterCapacity =
                    serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
                if capacity.project_id == project_id && capacity.instance_id == instance_id {
                    results.push(capacity);
                }
            }
        }
        Ok(results)
    }

    // ── Utilization ────────────────────────────────────────────────

    /// Insert a utilization sample.
    pub fn record_utilization(&self, sample: &UtilizationSample) -> StateResult<()> {
        let key = sample.table_key();
        let value = serde_json::to_vec(sample).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(UTILIZATION).map_err(map_err!(Storage))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    /// Samples for a project taken at or after `since` (unix seconds), oldest first.
    pub fn utilization_since(&self, project_id: &str, since: u64) -> StateResult<Vec<UtilizationSample>> {
        let prefix = format!("{project_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(UTILIZATION).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            if key.value().starts_with(&prefix) {
                let sample: UtilizationSample =
                    serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
                if sample.project_id == project_id && sample.timestamp >= since {
                    results.push(sample);
                }
            }
        }
        Ok(results)
    }

    /// Drop samples older than `before` (unix seconds). Returns number deleted.
    pub fn prune_utilization(&self, before: u64) -> StateResult<usize> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Storage))?;
            let table = txn.open_table(UTILIZATION).map_err(map_err!(Storage))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Storage))? {
                let (key, value) = entry.map_err(map_err!(Storage))?;
                let sample: UtilizationSample =
                    serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
                if sample.timestamp < before {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let count = keys.len();
        {
            let mut table = txn.open_table(UTILIZATION).map_err(map_err!(Storage))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(count)
    }
}

fn read_record<T>(table: &T, key: &str) -> StateResult<Option<PolicyRecord>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Storage))? {
        Some(guard) => {
            let record: PolicyRecord =
                serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
