//! Advisory lock service: shared/exclusive locks scoped to a topology,
//! acquired against the primary via `GET_LOCK`-style semantics (§4.5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use crate::config::ClusterControlConfig;
use crate::error::{ClusterControlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockState {
    /// Ids of sessions currently holding the shared lock.
    shared_holders: Vec<u64>,
    /// Id of the single exclusive holder, if any.
    exclusive_holder: Option<u64>,
}

impl LockState {
    fn can_acquire(&self, mode: LockMode, holder: u64) -> bool {
        match mode {
            LockMode::Shared => self.exclusive_holder.is_none() || self.exclusive_holder == Some(holder),
            LockMode::Exclusive => {
                (self.exclusive_holder.is_none() || self.exclusive_holder == Some(holder))
                    && (self.shared_holders.is_empty()
                        || self.shared_holders == vec![holder])
            }
        }
    }
}

/// Owns the per-topology lock table. Cloning shares the same underlying
/// table (it is `Arc`-backed), matching one lock service per deployment.
#[derive(Clone, Default)]
pub struct LockService {
    topologies: Arc<AsyncMutex<HashMap<String, Arc<Mutex<LockState>>>>>,
    /// Wait used by [`Self::acquire_default`] when no per-call override is
    /// given. `None` (the `new()` default) means "wait forever", matching
    /// `acquire`'s own convention.
    default_wait: Option<Duration>,
}

/// RAII handle: releases its hold when dropped. The scope of the lock
/// follows the caller's frame, per §4.5. Release happens synchronously in
/// `Drop` (a plain `std::sync::Mutex`, not the async one guarding the
/// topology table) so a caller that re-acquires right after the guard falls
/// out of scope never races a still-pending release.
pub struct LockGuard {
    state: Arc<Mutex<LockState>>,
    holder: u64,
    mode: LockMode,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut guard = self.state.lock().expect("lock state mutex poisoned");
        match self.mode {
            LockMode::Shared => guard.shared_holders.retain(|h| *h != self.holder),
            LockMode::Exclusive => {
                if guard.exclusive_holder == Some(self.holder) {
                    guard.exclusive_holder = None;
                }
            }
        }
    }
}

impl LockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a service whose [`Self::acquire_default`] waits
    /// `config.lock_wait_timeout` instead of forever.
    pub fn with_config(config: &ClusterControlConfig) -> Self {
        Self {
            topologies: Arc::new(AsyncMutex::new(HashMap::new())),
            default_wait: Some(config.lock_wait_timeout),
        }
    }

    async fn state_for(&self, topology_id: &str) -> Arc<Mutex<LockState>> {
        let mut topologies = self.topologies.lock().await;
        topologies
            .entry(topology_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LockState::default())))
            .clone()
    }

    /// Acquires `mode` on `topology_id` for `holder` (a session/connection
    /// id), waiting up to `wait` (None = wait forever, matching the default
    /// zero-timeout-means-infinite convention of `GET_LOCK`).
    pub async fn acquire(
        &self,
        topology_id: &str,
        mode: LockMode,
        holder: u64,
        wait: Option<Duration>,
    ) -> Result<LockGuard> {
        let state = self.state_for(topology_id).await;
        let poll = async {
            loop {
                {
                    let mut guard = state.lock().expect("lock state mutex poisoned");
                    if guard.can_acquire(mode, holder) {
                        match mode {
                            LockMode::Shared => {
                                if !guard.shared_holders.contains(&holder) {
                                    guard.shared_holders.push(holder);
                                }
                            }
                            LockMode::Exclusive => guard.exclusive_holder = Some(holder),
                        }
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        match wait {
            Some(d) => timeout(d, poll)
                .await
                .map_err(|_| ClusterControlError::LockUnavailable(topology_id.to_string()))?,
            None => poll.await,
        }
        Ok(LockGuard {
            state,
            holder,
            mode,
        })
    }

    /// Acquires `mode` on `topology_id` for `holder`, waiting up to the
    /// service's configured default instead of requiring a per-call value.
    pub async fn acquire_default(&self, topology_id: &str, mode: LockMode, holder: u64) -> Result<LockGuard> {
        self.acquire(topology_id, mode, holder, self.default_wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_excludes_other_holders() {
        let service = LockService::new();
        let _g1 = service
            .acquire("topo", LockMode::Exclusive, 1, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let second = service
            .acquire("topo", LockMode::Exclusive, 2, Some(Duration::from_millis(50)))
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn reentrant_shared_to_exclusive_upgrade_by_same_holder() {
        let service = LockService::new();
        let _shared = service
            .acquire("topo", LockMode::Shared, 1, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let exclusive = service
            .acquire("topo", LockMode::Exclusive, 1, Some(Duration::from_millis(50)))
            .await;
        assert!(exclusive.is_ok());
    }

    #[tokio::test]
    async fn distinct_topologies_are_independent() {
        let service = LockService::new();
        let _a = service
            .acquire("topo-a", LockMode::Exclusive, 1, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let b = service
            .acquire("topo-b", LockMode::Exclusive, 2, Some(Duration::from_millis(50)))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn reacquiring_immediately_after_drop_never_races_a_pending_release() {
        let service = LockService::new();
        for holder in 0..50u64 {
            let guard = service
                .acquire("topo", LockMode::Exclusive, holder, Some(Duration::from_millis(50)))
                .await
                .unwrap();
            drop(guard);
            // If release were a spawned task instead of synchronous, this
            // next acquire would intermittently time out waiting on the
            // still-pending drop of the previous holder.
            service
                .acquire("topo", LockMode::Exclusive, holder + 1, Some(Duration::from_millis(50)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn acquire_default_uses_the_configured_wait() {
        let config = ClusterControlConfig::builder()
            .lock_wait_timeout(Duration::from_millis(50))
            .build();
        let service = LockService::with_config(&config);
        let _held = service
            .acquire("topo", LockMode::Exclusive, 1, None)
            .await
            .unwrap();
        let blocked = service.acquire_default("topo", LockMode::Exclusive, 2).await;
        assert!(blocked.is_err());
    }
}
