//! Session abstraction: the unit of ownership returned by the instance pool.
//!
//! The core never speaks the wire protocol itself (the low-level SQL driver
//! is an external collaborator, see spec §1); it only needs a narrow
//! `Session` trait that the account manager, fan-out executor, and topology
//! controller can drive. Implementors bridge this to whatever driver a
//! deployment uses.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::options::ConnectionOptions;

/// A single returned row, as strings, matching the original's per-target
/// "rows as strings" capture (§4.2.3).
pub type Row = Vec<String>;

/// One result set produced by a query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    pub rows: Vec<Row>,
    pub warnings: Vec<String>,
    pub execution_time_ms: u64,
}

/// An authenticated connection handle. Cheaply cloneable (`Arc`-backed) so
/// the instance pool and concurrent callers can share ownership per the
/// "arena of sessions" design note (§9).
#[async_trait]
pub trait Session: Send + Sync {
    /// Opaque connection id, used for `KILL CONNECTION <id>`.
    fn connection_id(&self) -> u64;

    /// Canonical address this session is connected to.
    fn address(&self) -> &str;

    /// Server version string, e.g. `"8.0.34"`.
    async fn server_version(&self) -> Result<String>;

    /// Runs a statement and returns its result sets.
    async fn query(&self, statement: &str) -> Result<Vec<QueryResult>>;

    /// Sets a session variable (`lock_wait_timeout`, `max_execution_time`, ...).
    async fn set_session_variable(&self, name: &str, value: &str) -> Result<()>;

    /// Issues `KILL CONNECTION <id>` against this same server, using a fresh
    /// connection opened by the caller (per §4.2.4, cancellation never reuses
    /// the connection being killed).
    async fn kill_connection(&self, connection_id: u64) -> Result<()>;
}

pub type SharedSession = Arc<dyn Session>;

/// Factory a concrete driver implements to let the instance pool open fresh
/// sessions from resolved connection options.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> Result<SharedSession>;
}
