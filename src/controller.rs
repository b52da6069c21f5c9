//! Topology controller: the user-visible operations layered over the
//! replication-account manager (§4.1) and fan-out executor (§4.2).
//!
//! Every operation follows prepare / commit / finalize (§4.3): validate and
//! lock, mutate metadata + runtime under a recorded undo list, then unlock
//! and report.

use typed_builder::TypedBuilder;

use crate::account::{AccountFamily, AuthenticationKind, CreateAccountRequest, ReplicationAccountManager};
use crate::error::{ClusterControlError, DomainCode, Result};
use crate::lock::LockMode;
use crate::metadata::{InstanceRow, UndoHandle};
use crate::session::Session;
use crate::topology::{Role, Topology, TopologyKind};

pub const MIN_SUPPORTED_VERSION: &str = "8.0.27";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMethod {
    Auto,
    Clone,
    Incremental,
}

#[derive(TypedBuilder)]
pub struct AddInstanceOptions {
    #[builder(default = RecoveryMethod::Auto)]
    pub recovery_method: RecoveryMethod,
    #[builder(default = false)]
    pub dry_run: bool,
    #[builder(default, setter(into, strip_option))]
    pub cert_subject: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub replication_allowed_host: Option<String>,
}

#[derive(TypedBuilder)]
pub struct RemoveInstanceOptions {
    #[builder(default = false)]
    pub force: bool,
    #[builder(default = false)]
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct RemoveOutcome {
    pub warnings: Vec<String>,
}

#[derive(TypedBuilder)]
pub struct SwitchoverOptions {
    #[builder(default, setter(into))]
    pub invalidate_replica_clusters: Vec<String>,
    #[builder(default = false)]
    pub dry_run: bool,
}

#[derive(TypedBuilder)]
pub struct DissolveOptions {
    #[builder(default = false)]
    pub force: bool,
    #[builder(default = false)]
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct DissolveOutcome {
    pub warnings: Vec<String>,
}

/// Composes the metadata store, lock service, instance pool, and
/// replication-account manager to expose §6.3's command surface.
pub struct TopologyController {
    pub topology: Topology,
    pub accounts: ReplicationAccountManager,
}

impl TopologyController {
    pub fn new(topology: Topology) -> Self {
        let accounts = ReplicationAccountManager::new(topology.clone());
        Self { topology, accounts }
    }

    /// §4.3.1 Add-member (Cluster).
    pub async fn add_instance(
        &self,
        holder: u64,
        primary: &dyn Session,
        target_session: &dyn Session,
        target_uuid: &str,
        server_id: u32,
        address: &str,
        label: &str,
        options: AddInstanceOptions,
    ) -> Result<()> {
        let _lock = self.topology.lock(LockMode::Exclusive, holder).await?;

        let version = target_session.server_version().await?;
        if version_is_older(&version, MIN_SUPPORTED_VERSION) {
            return Err(ClusterControlError::domain(
                DomainCode::BadArgInstanceUnreachable,
                format!("instance version {version} is below the required minimum {MIN_SUPPORTED_VERSION}"),
            ));
        }

        for existing in self.topology.members(false).await? {
            if existing.server_id == server_id {
                return Err(ClusterControlError::ArgumentError(format!(
                    "server-id {server_id} is already used within this topology"
                )));
            }
        }

        let undo = UndoHandle::new();
        let family = AccountFamily::GroupReplicationRecovery;
        let request = CreateAccountRequest::builder()
            .owner_uuid(target_uuid.to_string())
            .server_id(server_id)
            .family(family)
            .auth_kind(AuthenticationKind::Password)
            .dry_run(options.dry_run)
            .build();

        let account = match self
            .accounts
            .create_account_for_member(
                primary,
                request,
                options.replication_allowed_host.as_deref(),
                Some(&undo),
            )
            .await
        {
            Ok(account) => account,
            Err(err) => {
                undo.revert(&*self.topology.metadata).await?;
                return Err(err);
            }
        };

        let row = InstanceRow {
            uuid: target_uuid.to_string(),
            topology_id: self.topology.id.clone(),
            address: address.to_string(),
            label: label.to_string(),
            role: Role::ClusterSecondary.as_str().to_string(),
            server_id,
            invalidated: false,
            repl_user: Some(account.user.clone()),
            repl_host: Some(account.host.clone()),
        };

        if let Err(err) = self.topology.metadata.put_instance(row, Some(&undo)).await {
            undo.revert(&*self.topology.metadata).await?;
            return Err(err);
        }

        Ok(())
    }

    /// §4.3.2 Remove-member (Cluster). `supports_undo = false`: a partial
    /// failure is not automatically reverted.
    pub async fn remove_instance(
        &self,
        holder: u64,
        primary: &dyn Session,
        address: &str,
        options: RemoveInstanceOptions,
    ) -> Result<RemoveOutcome> {
        let _lock = self.topology.lock(LockMode::Exclusive, holder).await?;
        let mut outcome = RemoveOutcome::default();

        let members = self.topology.members(false).await?;
        if members.len() <= 1 {
            return Err(ClusterControlError::ArgumentError(
                "cannot remove the last member of a topology; use dissolve instead".to_string(),
            ));
        }
        let row = members
            .into_iter()
            .find(|m| m.address == address)
            .ok_or_else(|| {
                ClusterControlError::domain(
                    DomainCode::BadArgInstanceNotManaged,
                    format!("'{address}' is not a managed member of this topology"),
                )
            })?;

        if !options.dry_run {
            self.topology
                .metadata
                .remove_instance(&row.uuid, &self.topology.id, None)
                .await?;
        }

        if let Some(family) = family_for(self.topology.kind) {
            if let Err(err) = self
                .accounts
                .drop_account_for_removed_member(
                    None,
                    primary,
                    &row.uuid,
                    row.server_id,
                    family,
                    options.dry_run,
                    None,
                )
                .await
            {
                if options.force {
                    outcome
                        .warnings
                        .push(format!("failed to drop replication account for {address}: {err}"));
                } else {
                    return Err(err);
                }
            }
        }

        Ok(outcome)
    }

    /// §4.3.6 rejoinInstance: re-establish a stopped/misconfigured channel.
    /// Reuses the existing recovery account when the metadata row still
    /// records one; only falls back to the add-member account-creation path
    /// (scoped to this one target via `only_on_target`, so a stale metadata
    /// row elsewhere in the topology can't fail the rejoin with
    /// `AccountExists`) when the stored account is missing.
    pub async fn rejoin_instance(
        &self,
        holder: u64,
        primary: &dyn Session,
        target_session: &dyn Session,
        address: &str,
    ) -> Result<()> {
        let _lock = self.topology.lock(LockMode::Shared, holder).await?;
        let row = self
            .topology
            .members(true)
            .await?
            .into_iter()
            .find(|m| m.address == address)
            .ok_or_else(|| {
                ClusterControlError::domain(
                    DomainCode::BadArgInstanceNotManaged,
                    format!("'{address}' is not a managed member of this topology"),
                )
            })?;
        target_session.server_version().await?;

        let mut updated = row.clone();
        if row.repl_user.is_none() {
            let family = family_for(self.topology.kind).ok_or_else(|| {
                ClusterControlError::LogicError("no recovery-account family for this topology kind".into())
            })?;
            let request = CreateAccountRequest::builder()
                .owner_uuid(row.uuid.clone())
                .server_id(row.server_id)
                .family(family)
                .auth_kind(AuthenticationKind::Password)
                .only_on_target(true)
                .build();
            let account = self
                .accounts
                .create_account_for_member(primary, request, None, None)
                .await?;
            updated.repl_user = Some(account.user);
            updated.repl_host = Some(account.host);
        }
        updated.invalidated = false;
        self.topology.metadata.put_instance(updated, None).await?;
        Ok(())
    }

    /// §4.3.6 setPrimaryInstance: single-primary-mode promotion within one
    /// Cluster.
    pub async fn set_primary_instance(&self, holder: u64, new_primary_address: &str) -> Result<()> {
        if self.topology.multi_primary {
            return Err(ClusterControlError::ArgumentError(
                "setPrimaryInstance requires single-primary mode".to_string(),
            ));
        }
        let _lock = self.topology.lock(LockMode::Exclusive, holder).await?;
        let mut members = self.topology.members(false).await?;
        let new_primary_idx = members
            .iter()
            .position(|m| m.address == new_primary_address)
            .ok_or_else(|| {
                ClusterControlError::domain(
                    DomainCode::BadArgInstanceNotManaged,
                    format!("'{new_primary_address}' is not a managed member"),
                )
            })?;
        for (idx, member) in members.iter_mut().enumerate() {
            member.role = if idx == new_primary_idx {
                Role::ClusterPrimary.as_str().to_string()
            } else {
                Role::ClusterSecondary.as_str().to_string()
            };
        }
        for member in members {
            self.topology.metadata.put_instance(member, None).await?;
        }
        Ok(())
    }

    /// §4.3.6 forcePrimaryInstance: the failover counterpart of
    /// setPrimaryInstance, invoked when the current primary is unreachable.
    /// There is nothing live to demote gracefully, so the old primary row is
    /// marked `invalidated` instead of being relabeled a healthy secondary.
    pub async fn force_primary_instance(&self, holder: u64, new_primary_address: &str) -> Result<()> {
        if self.topology.multi_primary {
            return Err(ClusterControlError::ArgumentError(
                "forcePrimaryInstance requires single-primary mode".to_string(),
            ));
        }
        let _lock = self.topology.lock(LockMode::Exclusive, holder).await?;
        let mut members = self.topology.members(true).await?;
        let new_primary_idx = members
            .iter()
            .position(|m| m.address == new_primary_address && !m.invalidated)
            .ok_or_else(|| {
                ClusterControlError::domain(
                    DomainCode::BadArgInstanceNotManaged,
                    format!("'{new_primary_address}' is not a managed, reachable member"),
                )
            })?;
        for (idx, member) in members.iter_mut().enumerate() {
            if idx == new_primary_idx {
                member.role = Role::ClusterPrimary.as_str().to_string();
            } else if member.role.ends_with("primary") {
                member.invalidated = true;
            } else {
                member.role = Role::ClusterSecondary.as_str().to_string();
            }
        }
        for member in members {
            self.topology.metadata.put_instance(member, None).await?;
        }
        Ok(())
    }

    /// §4.3.3 Switchover (ClusterSet).
    pub async fn switchover(&self, holder: u64, new_primary_cluster_id: &str, options: SwitchoverOptions) -> Result<()> {
        let _lock = self.topology.lock(LockMode::Exclusive, holder).await?;
        let new_primary = self.topology.metadata.get_cluster(new_primary_cluster_id).await?;
        if new_primary.invalidated {
            return Err(ClusterControlError::ArgumentError(format!(
                "'{new_primary_cluster_id}' is invalidated and cannot become primary"
            )));
        }
        if options.dry_run {
            return Ok(());
        }
        self.promote_cluster(new_primary_cluster_id).await
    }

    /// Sets `primary_flag` on `new_primary_cluster_id` and clears it on every
    /// other Cluster in the same ClusterSet, so exactly one Cluster is ever
    /// primary at a time.
    async fn promote_cluster(&self, new_primary_cluster_id: &str) -> Result<()> {
        for mut row in self.topology.metadata.get_all_clusters(&self.topology.id).await? {
            let should_be_primary = row.cluster_id == new_primary_cluster_id;
            if row.primary_flag != should_be_primary {
                row.primary_flag = should_be_primary;
                self.topology.metadata.put_cluster(row, None).await?;
            }
        }
        Ok(())
    }

    /// §4.3.4 Failover (ClusterSet): like switchover, but the old primary is
    /// assumed gone and is marked invalidated instead of removed.
    pub async fn failover(
        &self,
        holder: u64,
        old_primary_cluster_id: &str,
        new_primary_cluster_id: &str,
        options: SwitchoverOptions,
    ) -> Result<()> {
        let _lock = self.topology.lock(LockMode::Exclusive, holder).await?;
        let mut new_primary = self.topology.metadata.get_cluster(new_primary_cluster_id).await?;
        if new_primary.invalidated
            && !options
                .invalidate_replica_clusters
                .iter()
                .any(|c| c == new_primary_cluster_id)
        {
            return Err(ClusterControlError::ArgumentError(format!(
                "'{new_primary_cluster_id}' is unreachable and was not named in invalidateReplicaClusters"
            )));
        }
        if options.dry_run {
            return Ok(());
        }
        let mut old_primary = self.topology.metadata.get_cluster(old_primary_cluster_id).await?;
        old_primary.invalidated = true;
        old_primary.primary_flag = false;
        self.topology.metadata.put_cluster(old_primary, None).await?;
        new_primary.primary_flag = true;
        self.topology.metadata.put_cluster(new_primary, None).await?;
        Ok(())
    }

    /// §4.3.6 forcePrimaryCluster: the failover counterpart of switchover,
    /// invoked when the current primary Cluster is unreachable. Mirrors
    /// §4.3.4's failover semantics exactly (skips synchronizing with the old
    /// primary, marks its row invalidated instead of removing it): the two
    /// verbs name the same operation from the admin surface and the
    /// unreachable-primary trigger respectively.
    pub async fn force_primary_cluster(
        &self,
        holder: u64,
        old_primary_cluster_id: &str,
        new_primary_cluster_id: &str,
        options: SwitchoverOptions,
    ) -> Result<()> {
        self.failover(holder, old_primary_cluster_id, new_primary_cluster_id, options)
            .await
    }

    /// §4.3.5 Dissolve: best-effort per member, always advances. Idempotent
    /// against a partially-dissolved state (open question, decided in
    /// DESIGN.md): a member already missing its row/account counts as
    /// already-done, not a fresh failure.
    pub async fn dissolve(&self, holder: u64, primary: &dyn Session, options: DissolveOptions) -> Result<DissolveOutcome> {
        let _lock = self.topology.lock(LockMode::Exclusive, holder).await?;
        let mut outcome = DissolveOutcome::default();
        let members = self.topology.members(true).await?;

        for member in &members {
            if let Some(family) = family_for(self.topology.kind) {
                if let Err(err) = self
                    .accounts
                    .drop_account_for_removed_member(
                        None,
                        primary,
                        &member.uuid,
                        member.server_id,
                        family,
                        options.dry_run,
                        None,
                    )
                    .await
                {
                    outcome
                        .warnings
                        .push(format!("failed to drop account for {}: {err}", member.address));
                }
            }
            if !options.dry_run {
                if let Err(err) = self
                    .topology
                    .metadata
                    .remove_instance(&member.uuid, &self.topology.id, None)
                    .await
                {
                    outcome
                        .warnings
                        .push(format!("failed to erase metadata for {}: {err}", member.address));
                }
            }
        }
        Ok(outcome)
    }
}

/// Parses the leading numeric run of each dot-separated component of a
/// MySQL-style version string (`8.0.34`, `8.0.34-log`, `8.4.2-enterprise`
/// all parse to at least `(8, 0 or 4, ...)`), ignoring anything after the
/// first non-digit in a component.
fn parse_version(raw: &str) -> Vec<u32> {
    raw.split('.')
        .map(|part| part.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .map(|digits| digits.parse().unwrap_or(0))
        .collect()
}

fn version_is_older(candidate: &str, minimum: &str) -> bool {
    parse_version(candidate) < parse_version(minimum)
}

fn family_for(kind: TopologyKind) -> Option<AccountFamily> {
    match kind {
        TopologyKind::Cluster => Some(AccountFamily::GroupReplicationRecovery),
        TopologyKind::ClusterSet => Some(AccountFamily::ClusterSetAsync),
        TopologyKind::ReplicaSet => Some(AccountFamily::ReplicaSetAsync),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockService;
    use crate::metadata::{ClusterRow, InMemoryMetadataStore};
    use crate::session::QueryResult;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FakeSession {
        version: String,
    }

    #[async_trait]
    impl Session for FakeSession {
        fn connection_id(&self) -> u64 {
            1
        }
        fn address(&self) -> &str {
            "primary:3306"
        }
        async fn server_version(&self) -> Result<String> {
            Ok(self.version.clone())
        }
        async fn query(&self, _statement: &str) -> Result<Vec<QueryResult>> {
            Ok(vec![])
        }
        async fn set_session_variable(&self, _name: &str, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn kill_connection(&self, _connection_id: u64) -> Result<()> {
            Ok(())
        }
    }

    fn topology(kind: TopologyKind) -> Topology {
        Topology {
            id: "t1".to_string(),
            kind,
            name: "mytopo".to_string(),
            multi_primary: false,
            metadata: Arc::new(InMemoryMetadataStore::new()),
            locks: LockService::new(),
        }
    }

    #[tokio::test]
    async fn add_instance_rejects_duplicate_server_id() {
        let topo = topology(TopologyKind::Cluster);
        topo.metadata
            .put_instance(
                InstanceRow {
                    uuid: "existing".into(),
                    topology_id: topo.id.clone(),
                    address: "a:3306".into(),
                    label: "a".into(),
                    role: "cluster-primary".into(),
                    server_id: 101,
                    invalidated: false,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        let controller = TopologyController::new(topo);
        let session = FakeSession {
            version: "8.0.34".into(),
        };
        let err = controller
            .add_instance(
                1,
                &session,
                &session,
                "new",
                101,
                "b:3306",
                "b",
                AddInstanceOptions::builder().build(),
            )
            .await
            .unwrap_err();
        assert!(err.is_argument_error());
    }

    #[tokio::test]
    async fn remove_instance_refuses_last_member() {
        let topo = topology(TopologyKind::Cluster);
        topo.metadata
            .put_instance(
                InstanceRow {
                    uuid: "only".into(),
                    topology_id: topo.id.clone(),
                    address: "a:3306".into(),
                    label: "a".into(),
                    role: "cluster-primary".into(),
                    server_id: 101,
                    invalidated: false,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        let controller = TopologyController::new(topo);
        let session = FakeSession {
            version: "8.0.34".into(),
        };
        let err = controller
            .remove_instance(1, &session, "a:3306", RemoveInstanceOptions::builder().build())
            .await
            .unwrap_err();
        assert!(err.is_argument_error());
    }

    #[tokio::test]
    async fn dissolve_is_idempotent_on_retry() {
        let topo = topology(TopologyKind::ReplicaSet);
        topo.metadata
            .put_instance(
                InstanceRow {
                    uuid: "a".into(),
                    topology_id: topo.id.clone(),
                    address: "a:3306".into(),
                    label: "a".into(),
                    role: "replicaset-primary".into(),
                    server_id: 1,
                    invalidated: false,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        let controller = TopologyController::new(topo);
        let session = FakeSession {
            version: "8.0.34".into(),
        };
        let first = controller
            .dissolve(1, &session, DissolveOptions::builder().build())
            .await
            .unwrap();
        assert!(first.warnings.is_empty());
        let second = controller
            .dissolve(1, &session, DissolveOptions::builder().build())
            .await
            .unwrap();
        assert!(second.warnings.is_empty());
    }

    #[test]
    fn version_is_older_compares_numerically_not_lexicographically() {
        // A naive string comparison would get both of these backwards:
        // "8.0.9" < "8.0.27" lexicographically (it isn't, numerically), and
        // "10.0.0" < "8.0.27" lexicographically (it definitely isn't).
        assert!(version_is_older("8.0.9", "8.0.27"));
        assert!(!version_is_older("10.0.0", "8.0.27"));
        assert!(!version_is_older("8.0.27", "8.0.27"));
        assert!(!version_is_older("8.0.34-enterprise-commercial", "8.0.27"));
    }

    #[tokio::test]
    async fn switchover_rejects_invalidated_target() {
        let topo = topology(TopologyKind::ClusterSet);
        topo.metadata
            .put_cluster(
                ClusterRow {
                    cluster_id: "beta".into(),
                    clusterset_id: topo.id.clone(),
                    primary_flag: false,
                    invalidated: true,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        let controller = TopologyController::new(topo);
        let err = controller
            .switchover(1, "beta", SwitchoverOptions::builder().build())
            .await
            .unwrap_err();
        assert!(err.is_argument_error());
    }

    #[tokio::test]
    async fn force_primary_cluster_invalidates_the_unreachable_primary() {
        let topo = topology(TopologyKind::ClusterSet);
        topo.metadata
            .put_cluster(
                ClusterRow {
                    cluster_id: "alpha".into(),
                    clusterset_id: topo.id.clone(),
                    primary_flag: true,
                    invalidated: false,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        topo.metadata
            .put_cluster(
                ClusterRow {
                    cluster_id: "beta".into(),
                    clusterset_id: topo.id.clone(),
                    primary_flag: false,
                    invalidated: false,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        let controller = TopologyController::new(topo);
        controller
            .force_primary_cluster(1, "alpha", "beta", SwitchoverOptions::builder().build())
            .await
            .unwrap();

        let beta = controller.topology.metadata.get_cluster("beta").await.unwrap();
        assert!(beta.primary_flag);
        let alpha = controller.topology.metadata.get_cluster("alpha").await.unwrap();
        assert!(alpha.invalidated);
        assert!(!alpha.primary_flag);
    }

    #[tokio::test]
    async fn force_primary_instance_invalidates_the_unreachable_old_primary() {
        let topo = topology(TopologyKind::Cluster);
        topo.metadata
            .put_instance(
                InstanceRow {
                    uuid: "a".into(),
                    topology_id: topo.id.clone(),
                    address: "a:3306".into(),
                    label: "a".into(),
                    role: "cluster-primary".into(),
                    server_id: 1,
                    invalidated: false,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        topo.metadata
            .put_instance(
                InstanceRow {
                    uuid: "b".into(),
                    topology_id: topo.id.clone(),
                    address: "b:3306".into(),
                    label: "b".into(),
                    role: "cluster-secondary".into(),
                    server_id: 2,
                    invalidated: false,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        let controller = TopologyController::new(topo);
        controller.force_primary_instance(1, "b:3306").await.unwrap();

        let a = controller
            .topology
            .metadata
            .get_instance_by_uuid("a", &controller.topology.id)
            .await
            .unwrap();
        assert!(a.invalidated);
        let b = controller
            .topology
            .metadata
            .get_instance_by_uuid("b", &controller.topology.id)
            .await
            .unwrap();
        assert_eq!(b.role, Role::ClusterPrimary.as_str());
        assert!(!b.invalidated);
    }

    #[tokio::test]
    async fn rejoin_instance_falls_back_to_account_creation_when_missing() {
        let topo = topology(TopologyKind::Cluster);
        topo.metadata
            .put_instance(
                InstanceRow {
                    uuid: "a".into(),
                    topology_id: topo.id.clone(),
                    address: "a:3306".into(),
                    label: "a".into(),
                    role: "cluster-secondary".into(),
                    server_id: 1,
                    invalidated: true,
                    repl_user: None,
                    repl_host: None,
                },
                None,
            )
            .await
            .unwrap();
        let controller = TopologyController::new(topo);
        let primary = FakeSession {
            version: "8.0.34".into(),
        };
        let target = FakeSession {
            version: "8.0.34".into(),
        };
        controller
            .rejoin_instance(1, &primary, &target, "a:3306")
            .await
            .unwrap();

        let row = controller
            .topology
            .metadata
            .get_instance_by_uuid("a", &controller.topology.id)
            .await
            .unwrap();
        assert!(!row.invalidated);
        assert!(row.repl_user.is_some());
    }
}
