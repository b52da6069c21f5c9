//! Metadata store client: transactional CRUD over the managed-member
//! catalog (§4.4), plus the in-memory reference implementation used by the
//! rest of this crate's own tests (§4.4.1).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{ClusterControlError, Result};

/// Schema version the library was built against. Bump alongside any
/// structural catalog change.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaKind {
    Recovery,
    ReadReplica,
    ClusterSetAsync,
}

/// One row of the Instance table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRow {
    pub uuid: String,
    pub topology_id: String,
    pub address: String,
    pub label: String,
    pub role: String,
    pub server_id: u32,
    pub invalidated: bool,
    pub repl_user: Option<String>,
    pub repl_host: Option<String>,
}

/// One row of the Cluster-in-ClusterSet table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRow {
    pub cluster_id: String,
    pub clusterset_id: String,
    pub primary_flag: bool,
    pub invalidated: bool,
    pub repl_user: Option<String>,
    pub repl_host: Option<String>,
}

/// A single (apply, revert) pair accumulated by a mutating call. The write-
/// ahead builder design note (§9): callers accumulate these, apply them in a
/// transaction, and run the revert stack in reverse order on failure.
#[derive(Clone)]
pub enum UndoStep {
    RestoreInstance(InstanceRow),
    RemoveInstance { uuid: String, topology_id: String },
    RestoreCluster(ClusterRow),
    RestoreAttribute {
        scope_id: String,
        key: String,
        value: Option<String>,
    },
}

/// Accumulates undo steps for an in-flight operation. Passed by reference
/// into mutating metadata-store calls when undo recording is requested.
#[derive(Default, Clone)]
pub struct UndoHandle {
    steps: Arc<RwLock<Vec<UndoStep>>>,
}

impl UndoHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, step: UndoStep) {
        self.steps.write().await.push(step);
    }

    pub async fn is_empty(&self) -> bool {
        self.steps.read().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.steps.read().await.len()
    }

    /// Applies every recorded step in reverse order against `store`.
    pub async fn revert(&self, store: &dyn MetadataStore) -> Result<()> {
        let steps = std::mem::take(&mut *self.steps.write().await);
        for step in steps.into_iter().rev() {
            match step {
                UndoStep::RestoreInstance(row) => store.put_instance(row, None).await?,
                UndoStep::RemoveInstance { uuid, topology_id } => {
                    store.remove_instance(&uuid, &topology_id, None).await?
                }
                UndoStep::RestoreCluster(row) => store.put_cluster(row, None).await?,
                UndoStep::RestoreAttribute {
                    scope_id,
                    key,
                    value,
                } => {
                    store
                        .set_attribute(&scope_id, &key, value.as_deref(), None)
                        .await?
                }
            }
        }
        Ok(())
    }
}

/// An in-progress transaction handle; opaque to callers beyond passing it
/// back into `commit`/`rollback`.
pub struct Transaction {
    pub id: u64,
    pub undo: UndoHandle,
}

/// The transactional, entity-CRUD, and attribute-bag contract consumed by
/// the replication-account manager and the topology controller (§6.2).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn begin_tx(&self) -> Result<Transaction>;
    async fn commit(&self, tx: Transaction) -> Result<()>;
    async fn rollback(&self, tx: Transaction) -> Result<()>;

    async fn installed_version(&self) -> Result<u32>;
    async fn current_version(&self) -> u32 {
        CURRENT_SCHEMA_VERSION
    }

    /// Fails with `MetadataNeedsUpgrade` unless the installed schema matches.
    async fn check_schema(&self) -> Result<()> {
        let installed = self.installed_version().await?;
        let current = self.current_version().await;
        if installed != current {
            return Err(ClusterControlError::MetadataNeedsUpgrade {
                installed,
                required: current,
            });
        }
        Ok(())
    }

    async fn get_instance_by_uuid(&self, uuid: &str, topology_id: &str) -> Result<InstanceRow>;
    async fn get_all_instances(
        &self,
        topology_id: &str,
        include_invalidated: bool,
    ) -> Result<Vec<InstanceRow>>;
    async fn put_instance(&self, row: InstanceRow, undo: Option<&UndoHandle>) -> Result<()>;
    async fn remove_instance(
        &self,
        uuid: &str,
        topology_id: &str,
        undo: Option<&UndoHandle>,
    ) -> Result<()>;

    async fn update_instance_repl_account(
        &self,
        uuid: &str,
        topology_id: &str,
        user: &str,
        host: &str,
        undo: Option<&UndoHandle>,
    ) -> Result<()>;
    async fn get_instance_repl_account(
        &self,
        uuid: &str,
        topology_id: &str,
    ) -> Result<Option<(String, String)>>;
    async fn clear_instance_repl_account(
        &self,
        uuid: &str,
        topology_id: &str,
        undo: Option<&UndoHandle>,
    ) -> Result<()>;

    async fn get_cluster(&self, cluster_id: &str) -> Result<ClusterRow>;
    async fn get_all_clusters(&self, clusterset_id: &str) -> Result<Vec<ClusterRow>>;
    async fn put_cluster(&self, row: ClusterRow, undo: Option<&UndoHandle>) -> Result<()>;
    async fn get_cluster_repl_account(&self, cluster_id: &str) -> Result<Option<(String, String)>>;
    async fn update_cluster_repl_account(
        &self,
        cluster_id: &str,
        user: &str,
        host: &str,
        undo: Option<&UndoHandle>,
    ) -> Result<()>;

    async fn query_cluster_attribute(&self, scope_id: &str, key: &str) -> Result<Option<Value>>;
    async fn set_cluster_attribute(
        &self,
        scope_id: &str,
        key: &str,
        value: Option<&str>,
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        self.set_attribute(scope_id, key, value, undo).await
    }
    async fn set_attribute(
        &self,
        scope_id: &str,
        key: &str,
        value: Option<&str>,
        undo: Option<&UndoHandle>,
    ) -> Result<()>;

    /// Number of Instance (or, when `clusterset_scope`, Cluster) rows that
    /// reference `user` as their replication account.
    async fn count_recovery_account_uses(&self, user: &str, clusterset_scope: bool) -> Result<u32>;
}

/// Deserializes a stored attribute into `T`, using `serde_path_to_error` so a
/// malformed attribute (for example, one written by an older minor version)
/// names the exact field that failed to parse instead of a bare "invalid
/// type" message.
pub async fn get_typed_attribute<T: serde::de::DeserializeOwned>(
    store: &dyn MetadataStore,
    scope_id: &str,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = store.query_cluster_attribute(scope_id, key).await? else {
        return Ok(None);
    };
    let value = serde_path_to_error::deserialize(raw).map_err(|err| {
        ClusterControlError::MetadataError(format!(
            "attribute '{key}' at '{}' has an unexpected shape: {err}",
            err.path()
        ))
    })?;
    Ok(Some(value))
}

#[derive(Default)]
struct Inner {
    instances: HashMap<(String, String), InstanceRow>,
    clusters: HashMap<String, ClusterRow>,
    attributes: HashMap<(String, String), String>,
    next_tx: u64,
    installed_version: u32,
}

/// In-memory reference implementation of `MetadataStore` (§4.4.1), backing
/// both this crate's own tests and any integrator exploring the API without
/// a real metadata schema behind it.
pub struct InMemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                installed_version: CURRENT_SCHEMA_VERSION,
                ..Default::default()
            }),
        }
    }
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/upgrade-path helper: force the installed version stamp.
    pub async fn set_installed_version(&self, version: u32) {
        self.inner.write().await.installed_version = version;
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn begin_tx(&self) -> Result<Transaction> {
        let mut inner = self.inner.write().await;
        inner.next_tx += 1;
        Ok(Transaction {
            id: inner.next_tx,
            undo: UndoHandle::new(),
        })
    }

    async fn commit(&self, _tx: Transaction) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        tx.undo.revert(self).await
    }

    async fn installed_version(&self) -> Result<u32> {
        Ok(self.inner.read().await.installed_version)
    }

    async fn get_instance_by_uuid(&self, uuid: &str, topology_id: &str) -> Result<InstanceRow> {
        self.inner
            .read()
            .await
            .instances
            .get(&(topology_id.to_string(), uuid.to_string()))
            .cloned()
            .ok_or_else(|| {
                ClusterControlError::domain(
                    crate::error::DomainCode::MemberMetadataMissing,
                    format!("no metadata row for instance {uuid}"),
                )
            })
    }

    async fn get_all_instances(
        &self,
        topology_id: &str,
        include_invalidated: bool,
    ) -> Result<Vec<InstanceRow>> {
        Ok(self
            .inner
            .read()
            .await
            .instances
            .values()
            .filter(|row| row.topology_id == topology_id)
            .filter(|row| include_invalidated || !row.invalidated)
            .cloned()
            .collect())
    }

    async fn put_instance(&self, row: InstanceRow, undo: Option<&UndoHandle>) -> Result<()> {
        let key = (row.topology_id.clone(), row.uuid.clone());
        let mut inner = self.inner.write().await;
        let previous = inner.instances.get(&key).cloned();
        inner.instances.insert(key.clone(), row.clone());
        if let Some(undo) = undo {
            match previous {
                Some(prev) => undo.push(UndoStep::RestoreInstance(prev)).await,
                None => {
                    undo.push(UndoStep::RemoveInstance {
                        uuid: key.1,
                        topology_id: key.0,
                    })
                    .await
                }
            }
        }
        Ok(())
    }

    async fn remove_instance(
        &self,
        uuid: &str,
        topology_id: &str,
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        let key = (topology_id.to_string(), uuid.to_string());
        let mut inner = self.inner.write().await;
        if let Some(prev) = inner.instances.remove(&key) {
            if let Some(undo) = undo {
                undo.push(UndoStep::RestoreInstance(prev)).await;
            }
        }
        Ok(())
    }

    async fn update_instance_repl_account(
        &self,
        uuid: &str,
        topology_id: &str,
        user: &str,
        host: &str,
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        let key = (topology_id.to_string(), uuid.to_string());
        let mut inner = self.inner.write().await;
        let row = inner.instances.get_mut(&key).ok_or_else(|| {
            ClusterControlError::domain(
                crate::error::DomainCode::MemberMetadataMissing,
                format!("no metadata row for instance {uuid}"),
            )
        })?;
        let previous = row.clone();
        row.repl_user = Some(user.to_string());
        row.repl_host = Some(host.to_string());
        if let Some(undo) = undo {
            undo.push(UndoStep::RestoreInstance(previous)).await;
        }
        Ok(())
    }

    async fn get_instance_repl_account(
        &self,
        uuid: &str,
        topology_id: &str,
    ) -> Result<Option<(String, String)>> {
        let row = self.get_instance_by_uuid(uuid, topology_id).await?;
        Ok(row.repl_user.zip(row.repl_host))
    }

    async fn clear_instance_repl_account(
        &self,
        uuid: &str,
        topology_id: &str,
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        let key = (topology_id.to_string(), uuid.to_string());
        let mut inner = self.inner.write().await;
        let row = inner.instances.get_mut(&key).ok_or_else(|| {
            ClusterControlError::domain(
                crate::error::DomainCode::MemberMetadataMissing,
                format!("no metadata row for instance {uuid}"),
            )
        })?;
        let previous = row.clone();
        row.repl_user = None;
        row.repl_host = None;
        if let Some(undo) = undo {
            undo.push(UndoStep::RestoreInstance(previous)).await;
        }
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<ClusterRow> {
        self.inner
            .read()
            .await
            .clusters
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| {
                ClusterControlError::domain(
                    crate::error::DomainCode::MemberMetadataMissing,
                    format!("no metadata row for cluster {cluster_id}"),
                )
            })
    }

    async fn get_all_clusters(&self, clusterset_id: &str) -> Result<Vec<ClusterRow>> {
        Ok(self
            .inner
            .read()
            .await
            .clusters
            .values()
            .filter(|row| row.clusterset_id == clusterset_id)
            .cloned()
            .collect())
    }

    async fn put_cluster(&self, row: ClusterRow, undo: Option<&UndoHandle>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let previous = inner.clusters.get(&row.cluster_id).cloned();
        inner.clusters.insert(row.cluster_id.clone(), row.clone());
        if let (Some(undo), Some(prev)) = (undo, previous) {
            undo.push(UndoStep::RestoreCluster(prev)).await;
        }
        Ok(())
    }

    async fn get_cluster_repl_account(&self, cluster_id: &str) -> Result<Option<(String, String)>> {
        let row = self.get_cluster(cluster_id).await?;
        Ok(row.repl_user.zip(row.repl_host))
    }

    async fn update_cluster_repl_account(
        &self,
        cluster_id: &str,
        user: &str,
        host: &str,
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let row = inner.clusters.get_mut(cluster_id).ok_or_else(|| {
            ClusterControlError::domain(
                crate::error::DomainCode::MemberMetadataMissing,
                format!("no metadata row for cluster {cluster_id}"),
            )
        })?;
        let previous = row.clone();
        row.repl_user = Some(user.to_string());
        row.repl_host = Some(host.to_string());
        if let Some(undo) = undo {
            undo.push(UndoStep::RestoreCluster(previous)).await;
        }
        Ok(())
    }

    async fn query_cluster_attribute(&self, scope_id: &str, key: &str) -> Result<Option<Value>> {
        let raw = self
            .inner
            .read()
            .await
            .attributes
            .get(&(scope_id.to_string(), key.to_string()))
            .cloned();
        Ok(raw.map(Value::String))
    }

    async fn set_attribute(
        &self,
        scope_id: &str,
        key: &str,
        value: Option<&str>,
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        let map_key = (scope_id.to_string(), key.to_string());
        let mut inner = self.inner.write().await;
        let previous = inner.attributes.get(&map_key).cloned();
        match value {
            Some(v) => {
                inner.attributes.insert(map_key, v.to_string());
            }
            None => {
                inner.attributes.remove(&map_key);
            }
        }
        if let Some(undo) = undo {
            undo.push(UndoStep::RestoreAttribute {
                scope_id: scope_id.to_string(),
                key: key.to_string(),
                value: previous,
            })
            .await;
        }
        Ok(())
    }

    async fn count_recovery_account_uses(&self, user: &str, clusterset_scope: bool) -> Result<u32> {
        let inner = self.inner.read().await;
        if clusterset_scope {
            Ok(inner
                .clusters
                .values()
                .filter(|row| row.repl_user.as_deref() == Some(user))
                .count() as u32)
        } else {
            Ok(inner
                .instances
                .values()
                .filter(|row| row.repl_user.as_deref() == Some(user))
                .count() as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(uuid: &str, topology: &str, server_id: u32) -> InstanceRow {
        InstanceRow {
            uuid: uuid.to_string(),
            topology_id: topology.to_string(),
            address: format!("{uuid}:3306"),
            label: uuid.to_string(),
            role: "cluster-secondary".to_string(),
            server_id,
            invalidated: false,
            repl_user: None,
            repl_host: None,
        }
    }

    #[tokio::test]
    async fn schema_check_fails_on_mismatch() {
        let store = InMemoryMetadataStore::new();
        store.set_installed_version(0).await;
        let err = store.check_schema().await.unwrap_err();
        assert!(err.is_metadata_error());
    }

    #[tokio::test]
    async fn undo_restores_removed_instance() {
        let store = InMemoryMetadataStore::new();
        let undo = UndoHandle::new();
        let row = sample_row("u1", "t1", 101);
        store.put_instance(row.clone(), Some(&undo)).await.unwrap();
        store
            .remove_instance("u1", "t1", Some(&undo))
            .await
            .unwrap();
        assert!(store.get_instance_by_uuid("u1", "t1").await.is_err());
        undo.revert(&store).await.unwrap();
        let restored = store.get_instance_by_uuid("u1", "t1").await.unwrap();
        assert_eq!(restored, row);
    }

    #[tokio::test]
    async fn typed_attribute_round_trips() {
        let store = InMemoryMetadataStore::new();
        store
            .set_attribute("t1", "replicationAllowedHost", Some("10.0.0.%"), None)
            .await
            .unwrap();
        let value: Option<String> = get_typed_attribute(&store, "t1", "replicationAllowedHost")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("10.0.0.%"));
    }

    #[tokio::test]
    async fn typed_attribute_reports_path_on_mismatch() {
        let store = InMemoryMetadataStore::new();
        store
            .set_attribute("t1", "count", Some("not-a-number"), None)
            .await
            .unwrap();
        let err = get_typed_attribute::<u32>(&store, "t1", "count")
            .await
            .unwrap_err();
        assert!(err.is_metadata_error());
    }

    #[tokio::test]
    async fn count_recovery_account_uses_scopes_by_instance() {
        let store = InMemoryMetadataStore::new();
        let mut a = sample_row("a", "t1", 101);
        a.repl_user = Some("mysql_innodb_cluster_101".to_string());
        let mut b = sample_row("b", "t1", 102);
        b.repl_user = Some("mysql_innodb_cluster_101".to_string());
        store.put_instance(a, None).await.unwrap();
        store.put_instance(b, None).await.unwrap();
        let count = store
            .count_recovery_account_uses("mysql_innodb_cluster_101", false)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
