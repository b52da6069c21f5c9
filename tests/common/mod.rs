//! Shared fakes for the integration tests: an in-memory `Session` and
//! `SessionFactory` standing in for a real SQL driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use cluster_control::error::{ClusterControlError, Result};
use cluster_control::options::ConnectionOptions;
use cluster_control::session::{QueryResult, Session, SessionFactory, SharedSession};

/// A session that always succeeds, recording every statement it was asked
/// to run.
pub struct FakeSession {
    id: u64,
    address: String,
    version: String,
    pub queries: Mutex<Vec<String>>,
    pub session_variables: Mutex<Vec<(String, String)>>,
}

impl FakeSession {
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            version: "8.0.34".to_string(),
            queries: Mutex::new(Vec::new()),
            session_variables: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    async fn query(&self, statement: &str) -> Result<Vec<QueryResult>> {
        self.queries.lock().unwrap().push(statement.to_string());
        Ok(vec![QueryResult {
            column_names: vec!["1".to_string()],
            rows: vec![vec!["1".to_string()]],
            warnings: vec![],
            execution_time_ms: 1,
        }])
    }

    async fn set_session_variable(&self, name: &str, value: &str) -> Result<()> {
        self.session_variables
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn kill_connection(&self, _connection_id: u64) -> Result<()> {
        Ok(())
    }
}

/// A factory backed by a fixed address -> session table; addresses outside
/// the table are reported as unreachable, modeling a member that's down.
#[derive(Default)]
pub struct FixedTopologyFactory {
    sessions: Mutex<HashMap<String, SharedSession>>,
    next_id: AtomicU64,
}

impl FixedTopologyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reachable(&self, address: &str) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .unwrap()
            .insert(address.to_string(), std::sync::Arc::new(FakeSession::new(id, address)));
    }

    pub fn session_for(&self, address: &str) -> Option<SharedSession> {
        self.sessions.lock().unwrap().get(address).cloned()
    }
}

#[async_trait]
impl SessionFactory for FixedTopologyFactory {
    async fn connect(&self, options: &ConnectionOptions) -> Result<SharedSession> {
        let address = format!(
            "{}:{}",
            options.host.as_deref().unwrap_or(""),
            options.port.unwrap_or(0)
        );
        self.session_for(&address)
            .ok_or_else(|| ClusterControlError::InstanceUnreachable)
    }
}
