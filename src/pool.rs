//! Instance pool: caches authenticated sessions by connection fingerprint,
//! activated through stack-scoped nested guards (§4.5).

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::config::ClusterControlConfig;
use crate::error::{ClusterControlError, Result};
use crate::options::ConnectionOptions;
use crate::session::{SessionFactory, SharedSession};

/// Baseline credentials and policy the pool uses to open new sessions.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PoolCredentials {
    #[builder(setter(into))]
    pub user: String,
    #[builder(default, setter(into, strip_option))]
    pub password: Option<String>,
    /// Whether missing passwords may be prompted for interactively; the core
    /// itself never prompts (that is the CLI front end's job) but carries the
    /// flag through so callers can decide.
    #[builder(default = false)]
    pub interactive: bool,
}

impl PoolCredentials {
    /// Reads `CLUSTER_CONTROL_USER` / `CLUSTER_CONTROL_PASSWORD` /
    /// `CLUSTER_CONTROL_INTERACTIVE`, mirroring the donor client's
    /// `from_env()` convention.
    pub fn from_env() -> Result<Self> {
        let user = env::var("CLUSTER_CONTROL_USER").unwrap_or_else(|_| "root".to_string());
        let password = env::var("CLUSTER_CONTROL_PASSWORD").ok();
        let interactive = env::var("CLUSTER_CONTROL_INTERACTIVE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        Ok(Self {
            user,
            password,
            interactive,
        })
    }
}

struct PoolEntry {
    sessions: HashMap<String, SharedSession>,
}

/// A logical cache scope. Nested guards nest pool entries: entering a guard
/// pushes a fresh entry, sessions opened while it is active are cached in
/// that entry, and dropping the guard pops back to the parent's cache.
pub struct PoolEntryGuard {
    stack: Arc<Mutex<Vec<PoolEntry>>>,
}

impl Drop for PoolEntryGuard {
    fn drop(&mut self) {
        let mut stack = self.stack.lock().expect("pool stack mutex poisoned");
        if stack.len() > 1 {
            stack.pop();
        }
    }
}

#[derive(Clone)]
pub struct InstancePool {
    credentials: PoolCredentials,
    factory: Arc<dyn SessionFactory>,
    stack: Arc<Mutex<Vec<PoolEntry>>>,
    connect_timeout: Duration,
}

impl InstancePool {
    pub fn new(credentials: PoolCredentials, factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_config(credentials, factory, &ClusterControlConfig::default())
    }

    /// Like [`Self::new`], but takes `connect_timeout` from `config` instead
    /// of the builder default.
    pub fn with_config(
        credentials: PoolCredentials,
        factory: Arc<dyn SessionFactory>,
        config: &ClusterControlConfig,
    ) -> Self {
        Self {
            credentials,
            factory,
            stack: Arc::new(Mutex::new(vec![PoolEntry {
                sessions: HashMap::new(),
            }])),
            connect_timeout: config.connect_timeout,
        }
    }

    /// Pushes a new cache scope; sessions opened under it are evicted when
    /// the returned guard is dropped.
    pub fn enter(&self) -> PoolEntryGuard {
        self.stack
            .lock()
            .expect("pool stack mutex poisoned")
            .push(PoolEntry {
                sessions: HashMap::new(),
            });
        PoolEntryGuard {
            stack: self.stack.clone(),
        }
    }

    /// Returns a cached session for `options`' fingerprint, opening and
    /// caching a fresh one if absent.
    pub async fn get(&self, options: &ConnectionOptions) -> Result<SharedSession> {
        let fingerprint = options.fingerprint();
        if let Some(session) = {
            let stack = self.stack.lock().expect("pool stack mutex poisoned");
            stack
                .last()
                .expect("pool stack is never empty")
                .sessions
                .get(&fingerprint)
                .cloned()
        } {
            return Ok(session);
        }

        let mut resolved = options.clone();
        if resolved.user.is_none() {
            resolved.user = Some(self.credentials.user.clone());
        }
        if resolved.password.is_none() {
            resolved.password = self.credentials.password.clone();
        }
        let session = tokio::time::timeout(self.connect_timeout, self.factory.connect(&resolved))
            .await
            .map_err(|_| ClusterControlError::Timeout(format!("connecting to {fingerprint}")))??;

        let mut stack = self.stack.lock().expect("pool stack mutex poisoned");
        stack
            .last_mut()
            .expect("pool stack is never empty")
            .sessions
            .insert(fingerprint, session.clone());
        Ok(session)
    }

    pub fn credentials(&self) -> &PoolCredentials {
        &self.credentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{QueryResult, Session};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeSession {
        id: u64,
        address: String,
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
            Ok("8.0.34".to_string())
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

    struct CountingFactory {
        next_id: AtomicU64,
        connects: AtomicU64,
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        async fn connect(&self, options: &ConnectionOptions) -> Result<SharedSession> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSession {
                id,
                address: options.host.clone().unwrap_or_default(),
            }))
        }
    }

    #[tokio::test]
    async fn caches_session_by_fingerprint() {
        let factory = Arc::new(CountingFactory {
            next_id: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        });
        let pool = InstancePool::new(
            PoolCredentials::builder().user("root").build(),
            factory.clone(),
        );
        let opts = ConnectionOptions {
            host: Some("a".into()),
            port: Some(3306),
            ..Default::default()
        };
        let s1 = pool.get(&opts).await.unwrap();
        let s2 = pool.get(&opts).await.unwrap();
        assert_eq!(s1.connection_id(), s2.connection_id());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nested_guard_scopes_new_sessions() {
        let factory = Arc::new(CountingFactory {
            next_id: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        });
        let pool = InstancePool::new(
            PoolCredentials::builder().user("root").build(),
            factory.clone(),
        );
        let opts = ConnectionOptions {
            host: Some("a".into()),
            port: Some(3306),
            ..Default::default()
        };
        let outer = pool.get(&opts).await.unwrap();
        {
            let _guard = pool.enter();
            let inner = pool.get(&opts).await.unwrap();
            assert_ne!(outer.connection_id(), inner.connection_id());
        }
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    struct StallingFactory;

    #[async_trait]
    impl SessionFactory for StallingFactory {
        async fn connect(&self, _options: &ConnectionOptions) -> Result<SharedSession> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_honors_the_configured_timeout() {
        let pool = InstancePool::with_config(
            PoolCredentials::builder().user("root").build(),
            Arc::new(StallingFactory),
            &ClusterControlConfig::builder()
                .connect_timeout(Duration::from_millis(50))
                .build(),
        );
        let opts = ConnectionOptions {
            host: Some("a".into()),
            port: Some(3306),
            ..Default::default()
        };
        let err = pool.get(&opts).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
