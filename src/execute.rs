//! Fan-out executor: a bounded worker-pool scheduler that runs a statement
//! against a selected subset of topology members in parallel, with
//! interactive cancellation and per-target result capture (§4.2).
//!
//! Grounded in `modules/adminapi/common/execute.cc`. The original's
//! condition-variable queue becomes, per the Design Notes (§9), a task
//! `mpsc` channel plus a `watch` cancellation channel, with a single
//! supervisor task owning the cancel-set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::config::ClusterControlConfig;
use crate::error::Result;
use crate::metadata::InstanceRow;
use crate::session::SharedSession;
use crate::topology::{Topology, TopologyKind};

const SPINNER_INTERVAL: Duration = Duration::from_millis(300);
const UNREACHABLE_MESSAGE: &str = "Instance isn't reachable.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    All,
    Primary,
    Secondaries,
    ReadReplicas,
}

impl Keyword {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "all" | "a" => Some(Keyword::All),
            "primary" | "p" => Some(Keyword::Primary),
            "secondaries" | "s" => Some(Keyword::Secondaries),
            "read-replicas" | "rr" => Some(Keyword::ReadReplicas),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Selector {
    Keyword(Keyword),
    Addresses(Vec<String>),
}

/// One resolved fan-out target; `session = None` marks it unreachable.
#[derive(Clone)]
pub struct CommandTarget {
    pub session: Option<SharedSession>,
    pub address: String,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout_ms: Option<u64>,
    pub dry_run: bool,
    pub interactive: bool,
    pub host_concurrency: usize,
    pub cancel: Option<CancelToken>,
}

impl ExecuteOptions {
    /// Seeds `host_concurrency` and `interactive` from `config`, leaving
    /// per-run fields (`timeout_ms`, `dry_run`, `cancel`) at their defaults
    /// for the caller to set.
    pub fn from_config(config: &ClusterControlConfig) -> Self {
        Self {
            host_concurrency: config.host_concurrency,
            interactive: config.interactive,
            ..Default::default()
        }
    }
}

/// A handle a caller holds onto and flips to interrupt an in-flight
/// [`execute`]/[`execute_stream`] run. Only meaningful when
/// `ExecuteOptions::interactive` is set; the supervisor polls it on the
/// same cadence it uses to issue `KILL CONNECTION` (§4.2.4).
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Sender<bool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub address: String,
    pub label: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputRow {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetResult {
    pub instance: InstanceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<OutputRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Resolves the include/exclude selectors against a topology into an ordered
/// list of targets (§4.2.1).
pub async fn gather_instances(topology: &Topology, include: &Selector) -> Result<Vec<InstanceRow>> {
    let all = topology.members(false).await?;
    match include {
        Selector::Addresses(addrs) => {
            let mut out = Vec::new();
            for addr in addrs {
                match all.iter().find(|row| &row.address == addr) {
                    Some(row) => out.push(row.clone()),
                    None => {
                        return Err(crate::error::ClusterControlError::ArgumentError(format!(
                            "'{addr}' is not part of this topology"
                        )))
                    }
                }
            }
            Ok(out)
        }
        Selector::Keyword(Keyword::All) => Ok(all),
        Selector::Keyword(Keyword::Primary) => Ok(all
            .into_iter()
            .filter(|row| row.role.contains("primary"))
            .collect()),
        Selector::Keyword(Keyword::Secondaries) => {
            if topology.kind == TopologyKind::Cluster && topology.multi_primary {
                return Err(crate::error::ClusterControlError::ArgumentError(
                    "'secondaries' is not valid for a Cluster running in multi-primary mode".into(),
                ));
            }
            Ok(all
                .into_iter()
                .filter(|row| row.role.ends_with("secondary"))
                .collect())
        }
        Selector::Keyword(Keyword::ReadReplicas) => Ok(all
            .into_iter()
            .filter(|row| row.role.ends_with("read-replica"))
            .collect()),
    }
}

/// Applies an exclude selector to an already-gathered target list.
/// `universe` is every member of the topology regardless of current
/// inclusion, used to distinguish "already excluded" (no-op, §8 property 4)
/// from "never a member of this topology" (hard error, §4.2.1).
pub fn exclude_instances(
    mut rows: Vec<InstanceRow>,
    exclude: Option<&Selector>,
    universe: &[InstanceRow],
) -> Result<Vec<InstanceRow>> {
    let Some(exclude) = exclude else {
        return Ok(rows);
    };
    match exclude {
        Selector::Addresses(addrs) => {
            for addr in addrs {
                if !universe.iter().any(|row| &row.address == addr) {
                    return Err(crate::error::ClusterControlError::ArgumentError(format!(
                        "'{addr}' is not part of this topology"
                    )));
                }
                rows.retain(|row| &row.address != addr);
            }
            Ok(rows)
        }
        Selector::Keyword(Keyword::Primary) => {
            rows.retain(|row| !row.role.contains("primary"));
            Ok(rows)
        }
        Selector::Keyword(Keyword::Secondaries) => {
            rows.retain(|row| !row.role.ends_with("secondary"));
            Ok(rows)
        }
        Selector::Keyword(Keyword::ReadReplicas) => {
            rows.retain(|row| !row.role.ends_with("read-replica"));
            Ok(rows)
        }
        Selector::Keyword(Keyword::All) => Ok(Vec::new()),
    }
}

fn worker_count(targets: usize, host_concurrency: usize, interactive: bool) -> usize {
    let host_concurrency = host_concurrency.max(1);
    if interactive {
        (targets + 1).min((host_concurrency.saturating_sub(1)).max(2))
    } else {
        targets.min((host_concurrency.saturating_sub(1)).max(1))
    }
}

struct CancelEntry {
    uuid: String,
    address: String,
    connection_id: u64,
    session: SharedSession,
}

/// Runs `statement` against every resolved target (§4.2.2-4.2.6).
pub async fn execute(
    targets: Vec<CommandTarget>,
    statement: &str,
    options: &ExecuteOptions,
) -> Vec<TargetResult> {
    execute_inner(targets, statement, options, None).await
}

/// Same fan-out as [`execute`], but yields each target's result as soon as it
/// lands instead of waiting for the whole batch - useful for a caller (e.g. a
/// CLI progress display) that wants to render results incrementally rather
/// than block on the slowest target.
pub fn execute_stream(
    targets: Vec<CommandTarget>,
    statement: String,
    options: ExecuteOptions,
) -> impl Stream<Item = TargetResult> {
    let (tx, rx) = mpsc::channel(targets.len().max(1));
    tokio::spawn(async move {
        execute_inner(targets, &statement, &options, Some(tx)).await;
    });
    ReceiverStream::new(rx)
}

async fn execute_inner(
    targets: Vec<CommandTarget>,
    statement: &str,
    options: &ExecuteOptions,
    sink: Option<mpsc::Sender<TargetResult>>,
) -> Vec<TargetResult> {
    if options.dry_run {
        let mut out = Vec::with_capacity(targets.len());
        for t in &targets {
            let result = dry_run_result(t);
            if let Some(sink) = &sink {
                let _ = sink.send(result.clone()).await;
            }
            out.push(result);
        }
        return out;
    }

    let cancel_set: Arc<Mutex<Vec<CancelEntry>>> = Arc::new(Mutex::new(Vec::new()));
    let cancel_rx = match &options.cancel {
        Some(token) => token.subscribe(),
        None => watch::channel(false).1,
    };
    let results: Arc<Mutex<Vec<TargetResult>>> = Arc::new(Mutex::new(Vec::new()));

    let reachable: Vec<CommandTarget> = targets
        .iter()
        .filter(|t| t.session.is_some())
        .cloned()
        .collect();
    let unreachable: Vec<CommandTarget> = targets
        .iter()
        .filter(|t| t.session.is_none())
        .cloned()
        .collect();
    for t in &unreachable {
        let result = unreachable_result(t);
        if let Some(sink) = &sink {
            let _ = sink.send(result.clone()).await;
        }
        results.lock().await.push(result);
    }

    let workers = worker_count(reachable.len(), options.host_concurrency, options.interactive).max(1);
    let (task_tx, task_rx) = mpsc::channel::<CommandTarget>(reachable.len().max(1));
    let task_rx = Arc::new(Mutex::new(task_rx));

    let supervisor = if options.interactive {
        let cancel_set = cancel_set.clone();
        let mut cancel_rx = cancel_rx.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SPINNER_INTERVAL).await;
                if *cancel_rx.borrow_and_update() {
                    let mut set = cancel_set.lock().await;
                    for entry in set.drain(..) {
                        let _ = entry.session.kill_connection(entry.connection_id).await;
                        tracing::debug!(uuid = %entry.uuid, address = %entry.address, "issued KILL CONNECTION");
                    }
                    return;
                }
            }
        }))
    } else {
        None
    };

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let task_rx = task_rx.clone();
        let cancel_set = cancel_set.clone();
        let cancel_rx = cancel_rx.clone();
        let results = results.clone();
        let timeout_ms = options.timeout_ms;
        let statement = statement.to_string();
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let target = {
                    let mut rx = task_rx.lock().await;
                    rx.recv().await
                };
                let Some(target) = target else { break };
                let result = run_one(&target, &statement, timeout_ms, &cancel_set, &cancel_rx).await;
                if let Some(sink) = &sink {
                    let _ = sink.send(result.clone()).await;
                }
                results.lock().await.push(result);
            }
        }));
    }

    for target in reachable {
        let _ = task_tx.send(target).await;
    }
    drop(task_tx);

    for h in handles {
        let _ = h.await;
    }
    if let Some(supervisor) = supervisor {
        if *cancel_rx.borrow() {
            // Cancellation already landed: let the supervisor finish its
            // sweep and issue KILL CONNECTION for whatever is still in the
            // cancel-set instead of racing it to an abort.
            let _ = supervisor.await;
        } else {
            supervisor.abort();
        }
    }

    let mut out = Arc::try_unwrap(results)
        .map(|m| m.into_inner())
        .unwrap_or_default();
    out.sort_by(|a, b| a.instance.address.cmp(&b.instance.address));
    out
}

async fn run_one(
    target: &CommandTarget,
    statement: &str,
    timeout_ms: Option<u64>,
    cancel_set: &Arc<Mutex<Vec<CancelEntry>>>,
    cancel_rx: &watch::Receiver<bool>,
) -> TargetResult {
    let session = target.session.as_ref().expect("run_one called on reachable target");

    {
        let mut set = cancel_set.lock().await;
        set.push(CancelEntry {
            uuid: target.address.clone(),
            address: target.address.clone(),
            connection_id: session.connection_id(),
            session: session.clone(),
        });
    }

    // Admin statements must land on every target, including read-only
    // secondaries, without getting replicated back out by the very
    // channel the fan-out is inspecting or repairing.
    let _ = session.set_session_variable("super_read_only", "0").await;
    let _ = session.set_session_variable("sql_log_bin", "0").await;

    if let Some(ms) = timeout_ms {
        let _ = session
            .set_session_variable("lock_wait_timeout", &(ms / 1000).max(1).to_string())
            .await;
        let _ = session
            .set_session_variable("max_execution_time", &ms.to_string())
            .await;
    }

    let mut rx = cancel_rx.clone();
    let result = if *rx.borrow() {
        canceled_result(target)
    } else {
        tokio::select! {
            biased;
            _ = rx.changed() => canceled_result(target),
            out = session.query(statement) => match out {
                Ok(result_sets) => TargetResult {
                    instance: InstanceInfo {
                        address: target.address.clone(),
                        label: Some(target.label.clone()),
                        version: None,
                    },
                    output: Some(
                        result_sets
                            .into_iter()
                            .map(|r| OutputRow {
                                column_names: r.column_names,
                                rows: r.rows,
                                warnings: r.warnings,
                                execution_time_ms: r.execution_time_ms,
                                error: None,
                            })
                            .collect(),
                    ),
                    error: None,
                },
                Err(err) => TargetResult {
                    instance: InstanceInfo {
                        address: target.address.clone(),
                        label: Some(target.label.clone()),
                        version: None,
                    },
                    output: None,
                    error: Some(ErrorInfo {
                        kind: "mysqlsh".to_string(),
                        message: err.to_string(),
                        code: None,
                    }),
                },
            },
        }
    };

    let mut set = cancel_set.lock().await;
    set.retain(|e| e.connection_id != session.connection_id());
    result
}

fn dry_run_result(target: &CommandTarget) -> TargetResult {
    TargetResult {
        instance: InstanceInfo {
            address: target.address.clone(),
            label: Some(target.label.clone()),
            version: None,
        },
        output: Some(vec![OutputRow {
            column_names: vec![],
            rows: vec![],
            warnings: vec!["dry run execution".to_string()],
            execution_time_ms: 0,
            error: None,
        }]),
        error: None,
    }
}

fn unreachable_result(target: &CommandTarget) -> TargetResult {
    TargetResult {
        instance: InstanceInfo {
            address: target.address.clone(),
            label: Some(target.label.clone()),
            version: None,
        },
        output: None,
        error: Some(ErrorInfo {
            kind: "mysqlsh".to_string(),
            message: UNREACHABLE_MESSAGE.to_string(),
            code: None,
        }),
    }
}

fn canceled_result(target: &CommandTarget) -> TargetResult {
    TargetResult {
        instance: InstanceInfo {
            address: target.address.clone(),
            label: Some(target.label.clone()),
            version: None,
        },
        output: None,
        error: Some(ErrorInfo {
            kind: "mysqlsh".to_string(),
            message: "canceled".to_string(),
            code: None,
        }),
    }
}

/// Dedup helper backing §8 property 4 (selector idempotence) at the address
/// level, used by callers before re-applying an include selector.
pub fn dedup_addresses(addresses: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses
        .iter()
        .filter(|a| seen.insert((*a).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::QueryResult;
    use async_trait::async_trait;
    use futures::StreamExt;

    struct FakeSession;

    #[async_trait]
    impl crate::session::Session for FakeSession {
        fn connection_id(&self) -> u64 {
            1
        }
        fn address(&self) -> &str {
            "a:3306"
        }
        async fn server_version(&self) -> Result<String> {
            Ok("8.0.34".to_string())
        }
        async fn query(&self, _statement: &str) -> Result<Vec<QueryResult>> {
            Ok(vec![QueryResult::default()])
        }
        async fn set_session_variable(&self, _name: &str, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn kill_connection(&self, _connection_id: u64) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn execute_stream_yields_every_target() {
        let targets = vec![
            CommandTarget {
                session: Some(Arc::new(FakeSession)),
                address: "a:3306".to_string(),
                label: "a".to_string(),
            },
            CommandTarget {
                session: None,
                address: "b:3306".to_string(),
                label: "b".to_string(),
            },
        ];
        let stream = execute_stream(targets, "SELECT 1".to_string(), ExecuteOptions::default());
        let collected: Vec<TargetResult> = stream.collect().await;
        assert_eq!(collected.len(), 2);
        assert!(collected.iter().any(|r| r.instance.address == "a:3306" && r.error.is_none()));
        assert!(collected.iter().any(|r| r.instance.address == "b:3306" && r.error.is_some()));
    }

    #[test]
    fn from_config_carries_host_concurrency_and_interactive() {
        let config = ClusterControlConfig::builder()
            .host_concurrency(4)
            .interactive(true)
            .build();
        let options = ExecuteOptions::from_config(&config);
        assert_eq!(options.host_concurrency, 4);
        assert!(options.interactive);
        assert!(options.timeout_ms.is_none());
    }

    #[test]
    fn keyword_parses_short_and_long_forms() {
        assert_eq!(Keyword::parse("all"), Some(Keyword::All));
        assert_eq!(Keyword::parse("a"), Some(Keyword::All));
        assert_eq!(Keyword::parse("rr"), Some(Keyword::ReadReplicas));
        assert_eq!(Keyword::parse("bogus"), None);
    }

    #[test]
    fn worker_count_matches_interactive_formula() {
        assert_eq!(worker_count(5, 4, true), 3);
        assert_eq!(worker_count(1, 4, true), 2);
        assert_eq!(worker_count(5, 4, false), 3);
        assert_eq!(worker_count(1, 4, false), 1);
    }

    fn sample_row(address: &str) -> InstanceRow {
        InstanceRow {
            uuid: address.to_string(),
            topology_id: "t".to_string(),
            address: address.to_string(),
            label: address.to_string(),
            role: "cluster-secondary".to_string(),
            server_id: 1,
            invalidated: false,
            repl_user: None,
            repl_host: None,
        }
    }

    #[test]
    fn excluding_already_excluded_address_is_noop() {
        let universe = vec![sample_row("x:3306")];
        let rows = vec![];
        let result =
            exclude_instances(rows, Some(&Selector::Addresses(vec!["x:3306".into()])), &universe)
                .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn excluding_unknown_address_is_a_hard_error() {
        let universe = vec![sample_row("x:3306")];
        let rows = vec![sample_row("x:3306")];
        let err = exclude_instances(
            rows,
            Some(&Selector::Addresses(vec!["y:3306".into()])),
            &universe,
        )
        .unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn dedup_addresses_is_idempotent() {
        let addrs = vec!["a".to_string(), "a".to_string(), "b".to_string()];
        let once = dedup_addresses(&addrs);
        let twice = dedup_addresses(&once);
        assert_eq!(once, twice);
        assert_eq!(once, vec!["a".to_string(), "b".to_string()]);
    }
}
