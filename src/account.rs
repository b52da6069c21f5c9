//! Replication-account manager: lifecycle operations on internal replication
//! accounts for the three topology kinds (§4.1).
//!
//! Grounded in `modules/adminapi/common/replication_account.cc`: naming
//! conventions per account family, the pre-create collision scan, the
//! two-step drop rule, and the write-ahead undo log.

use rand::RngCore;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::error::{ClusterControlError, DomainCode, Result};
use crate::metadata::{MetadataStore, UndoHandle};
use crate::session::Session;
use crate::topology::{Topology, TopologyKind};

/// Account family, governing the username prefix and id encoding (§4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountFamily {
    GroupReplicationRecovery,
    LegacyRecovery,
    ReadReplicaAsync,
    ClusterSetAsync,
    ReplicaSetAsync,
}

impl AccountFamily {
    pub fn prefix(&self) -> &'static str {
        match self {
            AccountFamily::GroupReplicationRecovery => "mysql_innodb_cluster_",
            AccountFamily::LegacyRecovery => "mysql_innodb_cluster_r",
            AccountFamily::ReadReplicaAsync => "mysql_innodb_replica_",
            AccountFamily::ClusterSetAsync => "mysql_innodb_cs_",
            AccountFamily::ReplicaSetAsync => "mysql_innodb_rs_",
        }
    }

    fn hex_encoded(&self) -> bool {
        matches!(self, AccountFamily::ClusterSetAsync)
    }

    /// All three families whose `mysql.user` rows are swept by "drop all
    /// accounts" (§4.1.2).
    pub fn sweep_prefixes() -> &'static [&'static str] {
        &["mysql_innodb_cluster_", "mysql_innodb_replica_", "mysql_innodb_cs_"]
    }
}

/// Computes the conventional account username for `server_id` in `family`.
pub fn make_replication_user_name(family: AccountFamily, server_id: u32) -> String {
    if family.hex_encoded() {
        format!("{}{:x}", family.prefix(), server_id)
    } else {
        format!("{}{}", family.prefix(), server_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationKind {
    Password,
    CertIssuer,
    CertSubject,
    CertIssuerPassword,
    CertSubjectPassword,
}

impl AuthenticationKind {
    pub fn requires_password(&self) -> bool {
        matches!(
            self,
            AuthenticationKind::Password
                | AuthenticationKind::CertIssuerPassword
                | AuthenticationKind::CertSubjectPassword
        )
    }

    pub fn requires_certificate(&self) -> bool {
        matches!(
            self,
            AuthenticationKind::CertIssuer
                | AuthenticationKind::CertSubject
                | AuthenticationKind::CertIssuerPassword
                | AuthenticationKind::CertSubjectPassword
        )
    }
}

/// The credential record returned by account-creation operations (§3.1).
#[derive(Debug, Clone)]
pub struct ReplicationAccount {
    pub user: String,
    pub host: String,
    pub auth_kind: AuthenticationKind,
    pub password: Option<String>,
    pub cert_issuer: Option<String>,
    pub cert_subject: Option<String>,
    pub owner_uuid: String,
}

#[derive(TypedBuilder)]
pub struct CreateAccountRequest {
    #[builder(setter(into))]
    pub owner_uuid: String,
    pub server_id: u32,
    pub family: AccountFamily,
    #[builder(default = AuthenticationKind::Password)]
    pub auth_kind: AuthenticationKind,
    #[builder(default, setter(into, strip_option))]
    pub cert_subject: Option<String>,
    /// When `false` (the default), a pre-existing username collision across
    /// the topology's metadata catalog fails with `AccountExists` instead of
    /// silently dropping and recreating the account. Set this when the
    /// caller already knows the account is scoped to exactly one target (a
    /// repair/rejoin of an instance already recorded in metadata) and a
    /// topology-wide collision check would be meaningless.
    #[builder(default = false)]
    pub only_on_target: bool,
    #[builder(default = false)]
    pub dry_run: bool,
}

/// Generates a high-entropy password for a freshly-created replication
/// account, drawn from the OS CSPRNG.
fn generate_password() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

/// Bound to exactly one topology reference; owns the right to execute
/// user-DDL against that topology's current primary (§3.3, §4.1).
pub struct ReplicationAccountManager {
    topology: Topology,
}

impl ReplicationAccountManager {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    fn host_pattern(&self, configured: Option<&str>) -> String {
        configured.unwrap_or("%").to_string()
    }

    async fn drop_user_any_host(
        &self,
        primary: &dyn Session,
        user: &str,
        dry_run: bool,
    ) -> Result<()> {
        if dry_run {
            return Ok(());
        }
        debug!(user, "dropping any pre-existing account rows before create");
        let _ = primary
            .query(&format!("DROP USER IF EXISTS '{user}'@'%'"))
            .await?;
        Ok(())
    }

    /// §4.1.2 "Create account for member".
    pub async fn create_account_for_member(
        &self,
        primary: &dyn Session,
        request: CreateAccountRequest,
        allowed_host: Option<&str>,
        undo: Option<&UndoHandle>,
    ) -> Result<ReplicationAccount> {
        let host = self.host_pattern(allowed_host);
        let user = make_replication_user_name(request.family, request.server_id);

        if !request.only_on_target {
            let clusterset_scope = self.topology.kind == TopologyKind::ClusterSet;
            let existing_uses = self
                .topology
                .metadata
                .count_recovery_account_uses(&user, clusterset_scope)
                .await?;
            if existing_uses > 0 {
                return Err(ClusterControlError::domain(
                    DomainCode::AccountExists,
                    format!("account '{user}' is already registered in the metadata catalog"),
                ));
            }
        }

        if !request.dry_run {
            self.drop_user_any_host(primary, &user, request.dry_run).await?;
        }

        let password = if request.auth_kind.requires_password() {
            Some(generate_password())
        } else {
            None
        };

        if !request.dry_run {
            let auth_clause = match &password {
                Some(p) => format!(" IDENTIFIED BY '{p}'"),
                None => String::new(),
            };
            primary
                .query(&format!("CREATE USER '{user}'@'{host}'{auth_clause}"))
                .await?;
            primary
                .query(&format!(
                    "GRANT REPLICATION SLAVE ON *.* TO '{user}'@'{host}'"
                ))
                .await?;
            if matches!(
                request.family,
                AccountFamily::ReadReplicaAsync | AccountFamily::ClusterSetAsync
            ) {
                // §4.1.5: version capability gated in a real driver; this
                // reference path grants unconditionally.
                primary
                    .query(&format!(
                        "GRANT BACKUP_ADMIN, GROUP_REPLICATION_STREAM ON *.* TO '{user}'@'{host}'"
                    ))
                    .await?;
            }
        }

        if let Some(undo) = undo {
            undo.push(crate::metadata::UndoStep::RestoreAttribute {
                scope_id: request.owner_uuid.clone(),
                key: "__account_created".to_string(),
                value: None,
            })
            .await;
        }

        Ok(ReplicationAccount {
            user,
            host,
            auth_kind: request.auth_kind,
            password,
            cert_issuer: None,
            cert_subject: request.cert_subject,
            owner_uuid: request.owner_uuid,
        })
    }

    /// §4.1.2 "Create account for new Cluster in a ClusterSet": hexadecimal
    /// server-id encoding, always drops any collision first.
    pub async fn create_account_for_new_cluster(
        &self,
        primary: &dyn Session,
        owner_cluster_id: &str,
        server_id: u32,
        dry_run: bool,
    ) -> Result<ReplicationAccount> {
        let user = make_replication_user_name(AccountFamily::ClusterSetAsync, server_id);
        self.drop_user_any_host(primary, &user, dry_run).await?;
        let password = generate_password();
        if !dry_run {
            primary
                .query(&format!(
                    "CREATE USER '{user}'@'%' IDENTIFIED BY '{password}'"
                ))
                .await?;
            primary
                .query(&format!(
                    "GRANT REPLICATION SLAVE, BACKUP_ADMIN, GROUP_REPLICATION_STREAM ON *.* TO '{user}'@'%'"
                ))
                .await?;
        }
        Ok(ReplicationAccount {
            user,
            host: "%".to_string(),
            auth_kind: AuthenticationKind::Password,
            password: Some(password),
            cert_issuer: None,
            cert_subject: None,
            owner_uuid: owner_cluster_id.to_string(),
        })
    }

    /// §4.1.2 "Recreate account": drop+create with a new password. Callers
    /// must re-issue `CHANGE REPLICATION SOURCE`; on failure they should call
    /// `compensating_drop` to undo this step (§4.1.4).
    pub async fn recreate_account(
        &self,
        primary: &dyn Session,
        user: &str,
        host: &str,
    ) -> Result<String> {
        primary
            .query(&format!("DROP USER IF EXISTS '{user}'@'{host}'"))
            .await?;
        let password = generate_password();
        primary
            .query(&format!(
                "CREATE USER '{user}'@'{host}' IDENTIFIED BY '{password}'"
            ))
            .await?;
        primary
            .query(&format!(
                "GRANT REPLICATION SLAVE ON *.* TO '{user}'@'{host}'"
            ))
            .await?;
        Ok(password)
    }

    /// The compensating drop referenced by §4.1.4's last bullet.
    pub async fn compensating_drop(&self, primary: &dyn Session, user: &str, host: &str) -> Result<()> {
        warn!(user, host, "compensating drop after failed CHANGE SOURCE");
        primary
            .query(&format!("DROP USER IF EXISTS '{user}'@'{host}'"))
            .await?;
        Ok(())
    }

    /// §4.1.2 "Rotate host-allowlist". `member_sessions` carries a session
    /// per ReplicaSet member (keyed by uuid); only ReplicaSet's async
    /// channels reference the account by host explicitly, so only that
    /// branch rebinds a still-running channel after the clone-and-drop.
    pub async fn rotate_host_allowlist(
        &self,
        primary: &dyn Session,
        new_host: &str,
        member_sessions: &[(&str, &dyn Session)],
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        match self.topology.kind {
            TopologyKind::ClusterSet => {
                let row = self.topology.metadata.get_cluster(&self.topology.id).await?;
                if row.repl_host.as_deref() == Some(new_host) {
                    return Ok(());
                }
                if let Some(user) = row.repl_user.clone() {
                    self.clone_user_to_host(primary, &user, row.repl_host.as_deref(), new_host)
                        .await?;
                    self.topology
                        .metadata
                        .update_cluster_repl_account(&self.topology.id, &user, new_host, undo)
                        .await?;
                }
            }
            TopologyKind::Cluster | TopologyKind::ReplicaSet => {
                let is_replica_set = self.topology.kind == TopologyKind::ReplicaSet;
                for member in self.topology.members(false).await? {
                    if member.repl_host.as_deref() == Some(new_host) {
                        continue;
                    }
                    if let Some(user) = member.repl_user.clone() {
                        self.clone_user_to_host(
                            primary,
                            &user,
                            member.repl_host.as_deref(),
                            new_host,
                        )
                        .await?;
                        self.topology
                            .metadata
                            .update_instance_repl_account(
                                &member.uuid,
                                &self.topology.id,
                                &user,
                                new_host,
                                undo,
                            )
                            .await?;
                        if is_replica_set {
                            if let Some((_, session)) =
                                member_sessions.iter().find(|(uuid, _)| *uuid == member.uuid)
                            {
                                self.rebind_replication_channel(*session, &user, new_host)
                                    .await?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-points a ReplicaSet member's running async channel at the account
    /// under its rotated host, so a channel started before the rotation
    /// doesn't keep referencing the now-dropped `user@old_host` row.
    async fn rebind_replication_channel(
        &self,
        member_session: &dyn Session,
        user: &str,
        new_host: &str,
    ) -> Result<()> {
        debug!(user, new_host, "rebinding replication channel after host-allowlist rotation");
        member_session
            .query(&format!(
                "CHANGE REPLICATION SOURCE TO SOURCE_USER='{user}' FOR CHANNEL 'replicaset_channel'"
            ))
            .await?;
        Ok(())
    }

    async fn clone_user_to_host(
        &self,
        primary: &dyn Session,
        user: &str,
        old_host: Option<&str>,
        new_host: &str,
    ) -> Result<()> {
        primary
            .query(&format!(
                "CREATE USER '{user}'@'{new_host}' LIKE '{user}'@'{}'",
                old_host.unwrap_or("%")
            ))
            .await?;
        if let Some(old_host) = old_host {
            primary
                .query(&format!("DROP USER '{user}'@'{old_host}'"))
                .await?;
        }
        Ok(())
    }

    /// §4.1.2 "Upgrade legacy accounts".
    pub async fn upgrade_legacy_accounts(
        &self,
        sessions: &[(&str, &dyn Session)],
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        for (uuid, session) in sessions {
            let existing = self
                .topology
                .metadata
                .get_instance_repl_account(uuid, &self.topology.id)
                .await?;
            if existing.is_some() {
                continue;
            }
            let live_accounts = session.query("SELECT USER()").await?;
            let live_user = live_accounts
                .first()
                .and_then(|r| r.rows.first())
                .and_then(|r| r.first())
                .cloned()
                .unwrap_or_default();
            let recognized = live_user.starts_with(AccountFamily::GroupReplicationRecovery.prefix())
                || live_user.starts_with(AccountFamily::LegacyRecovery.prefix());
            if !recognized {
                return Err(ClusterControlError::domain(
                    DomainCode::BadArgInstanceNotManaged,
                    format!(
                        "instance {uuid} has an unrecognized recovery account '{live_user}'; remove and re-add it"
                    ),
                ));
            }
            self.topology
                .metadata
                .update_instance_repl_account(uuid, &self.topology.id, &live_user, "%", undo)
                .await?;
        }
        Ok(())
    }

    /// §4.1.2 "Drop account for removed member": the two-step rule.
    pub async fn drop_account_for_removed_member(
        &self,
        leaving_session: Option<&dyn Session>,
        primary: &dyn Session,
        server_uuid: &str,
        server_id: u32,
        family: AccountFamily,
        dry_run: bool,
        undo: Option<&UndoHandle>,
    ) -> Result<()> {
        let _ = leaving_session;
        let conventional = make_replication_user_name(family, server_id);
        let conventional_uses = self
            .topology
            .metadata
            .count_recovery_account_uses(&conventional, self.topology.kind == TopologyKind::ClusterSet)
            .await?;
        if conventional_uses == 0 && !dry_run {
            primary
                .query(&format!("DROP USER IF EXISTS '{conventional}'@'%'"))
                .await?;
        }

        let recorded = self
            .topology
            .metadata
            .get_instance_repl_account(server_uuid, &self.topology.id)
            .await?;
        if let Some((user, host)) = recorded {
            let uses = self
                .topology
                .metadata
                .count_recovery_account_uses(&user, self.topology.kind == TopologyKind::ClusterSet)
                .await?;
            if uses <= 1 {
                if !dry_run {
                    primary
                        .query(&format!("DROP USER IF EXISTS '{user}'@'{host}'"))
                        .await?;
                }
                self.topology
                    .metadata
                    .clear_instance_repl_account(server_uuid, &self.topology.id, undo)
                    .await?;
            }
        }
        Ok(())
    }

    /// §4.1.2 "Drop all accounts": swallows and logs per-row failures.
    pub async fn drop_all_accounts(&self, primary: &dyn Session) -> Result<()> {
        for prefix in AccountFamily::sweep_prefixes() {
            let rows = primary
                .query(&format!(
                    "SELECT user, host FROM mysql.user WHERE user LIKE '{prefix}%'"
                ))
                .await?;
            for row in rows.iter().flat_map(|r| r.rows.iter()) {
                if let [user, host] = row.as_slice() {
                    if let Err(err) = primary
                        .query(&format!("DROP USER '{user}'@'{host}'"))
                        .await
                    {
                        warn!(%user, %host, %err, "failed to drop replication account during cleanup");
                    }
                }
            }
        }
        Ok(())
    }
}
