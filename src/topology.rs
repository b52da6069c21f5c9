//! Topology abstraction: the Cluster / ClusterSet / ReplicaSet variants and
//! the common surface the account manager, fan-out executor, and controller
//! dispatch against (§9 "Polymorphic topology handling").
//!
//! The source uses a tagged union over references to the three concrete
//! kinds; this crate keeps that shape as a plain enum rather than dynamic
//! dispatch, so the hot fan-out loop (§4.2) branches once at the top of each
//! operation instead of paying a vtable call per target.

use crate::error::Result;
use crate::lock::{LockGuard, LockMode, LockService};
use crate::metadata::{InstanceRow, MetadataStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ClusterPrimary,
    ClusterSecondary,
    ClusterReadReplica,
    ReplicaSetPrimary,
    ReplicaSetReplica,
    ClusterSetPrimaryOfCluster,
    ClusterSetReplicaOfCluster,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ClusterPrimary => "cluster-primary",
            Role::ClusterSecondary => "cluster-secondary",
            Role::ClusterReadReplica => "cluster-read-replica",
            Role::ReplicaSetPrimary => "replicaset-primary",
            Role::ReplicaSetReplica => "replicaset-replica",
            Role::ClusterSetPrimaryOfCluster => "clusterset-primary-of-cluster",
            Role::ClusterSetReplicaOfCluster => "clusterset-replica-of-cluster",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            Role::ClusterPrimary | Role::ReplicaSetPrimary | Role::ClusterSetPrimaryOfCluster
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    Cluster,
    ClusterSet,
    ReplicaSet,
}

/// Validates a topology/member name per §3.1: 1-63 chars, first char
/// alphanumeric or `_`, thereafter alphanumeric/`_`/`.`/`-`.
pub fn validate_topology_name(name: &str) -> Result<()> {
    use crate::error::ClusterControlError;
    if name.is_empty() || name.len() > 63 {
        return Err(ClusterControlError::ArgumentError(format!(
            "'{name}' is not a valid topology name: must be 1-63 characters"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return Err(ClusterControlError::ArgumentError(format!(
            "'{name}' is not a valid topology name: must start with a letter, digit, or underscore"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(ClusterControlError::ArgumentError(format!(
            "'{name}' is not a valid topology name: contains forbidden characters"
        )));
    }
    Ok(())
}

/// A topology reference: id, kind, human name, whether the Cluster (if that
/// is the kind) is running multi-primary, and the metadata/lock services it
/// is bound to.
#[derive(Clone)]
pub struct Topology {
    pub id: String,
    pub kind: TopologyKind,
    pub name: String,
    pub multi_primary: bool,
    pub metadata: std::sync::Arc<dyn MetadataStore>,
    pub locks: LockService,
}

impl Topology {
    /// Every reachable member, fanned out across constituent Clusters when
    /// this is a ClusterSet (§4.2.1): a ClusterSet's own id only tags the
    /// ClusterSet row itself in the metadata catalog, never the instances
    /// that belong to one of its member Clusters.
    pub async fn members(&self, include_invalidated: bool) -> Result<Vec<InstanceRow>> {
        match self.kind {
            TopologyKind::ClusterSet => {
                let mut out = Vec::new();
                for cluster in self.metadata.get_all_clusters(&self.id).await? {
                    if cluster.invalidated && !include_invalidated {
                        continue;
                    }
                    out.extend(
                        self.metadata
                            .get_all_instances(&cluster.cluster_id, include_invalidated)
                            .await?,
                    );
                }
                Ok(out)
            }
            TopologyKind::Cluster | TopologyKind::ReplicaSet => {
                self.metadata
                    .get_all_instances(&self.id, include_invalidated)
                    .await
            }
        }
    }

    pub async fn primary(&self) -> Result<Option<InstanceRow>> {
        Ok(self
            .members(false)
            .await?
            .into_iter()
            .find(|row| row.role.ends_with("primary") || row.role.contains("primary-of-cluster")))
    }

    pub async fn lock(&self, mode: LockMode, holder: u64) -> Result<LockGuard> {
        self.locks.acquire(&self.id, mode, holder, None).await
    }
}
