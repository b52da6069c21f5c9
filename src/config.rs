//! Crate-wide configuration (§1.1 "Ambient engineering stack").
//!
//! Mirrors the teacher's client-bootstrap pattern: a `TypedBuilder` struct
//! with sane defaults, plus a `from_env()` constructor for deployments that
//! configure themselves through the environment instead of code.
//!
//! Each field feeds a specific constructor: `connect_timeout` ->
//! [`crate::pool::InstancePool::with_config`], `host_concurrency`/
//! `interactive` -> [`crate::execute::ExecuteOptions::from_config`],
//! `lock_wait_timeout` -> [`crate::lock::LockService::with_config`].

use std::time::Duration;

use typed_builder::TypedBuilder;

/// Tunables shared by the instance pool, lock service, and fan-out executor.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClusterControlConfig {
    /// Timeout applied to each new session connect attempt.
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,

    /// Upper bound on concurrently-open sessions across a fan-out (§4.2.2
    /// calls this "host concurrency"); 0 means "derive from target count".
    #[builder(default = 0)]
    pub host_concurrency: usize,

    /// Default wait applied to `LockService::acquire` when a caller doesn't
    /// specify one explicitly.
    #[builder(default = Duration::from_secs(60))]
    pub lock_wait_timeout: Duration,

    /// Whether the hosting shell is interactive (§4.2.4): gates whether the
    /// cancellation supervisor task is spawned at all.
    #[builder(default = false)]
    pub interactive: bool,
}

impl Default for ClusterControlConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClusterControlConfig {
    /// Reads `CLUSTER_CONTROL_HOST_CONCURRENCY`, `CLUSTER_CONTROL_LOCK_TIMEOUT_MS`,
    /// and `CLUSTER_CONTROL_INTERACTIVE` from the environment, falling back to
    /// the builder defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut builder = Self::default();

        if let Ok(raw) = std::env::var("CLUSTER_CONTROL_HOST_CONCURRENCY") {
            if let Ok(value) = raw.parse() {
                builder.host_concurrency = value;
            }
        }
        if let Ok(raw) = std::env::var("CLUSTER_CONTROL_LOCK_TIMEOUT_MS") {
            if let Ok(value) = raw.parse::<u64>() {
                builder.lock_wait_timeout = Duration::from_millis(value);
            }
        }
        if let Ok(raw) = std::env::var("CLUSTER_CONTROL_INTERACTIVE") {
            builder.interactive = matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_are_conservative() {
        let config = ClusterControlConfig::default();
        assert_eq!(config.host_concurrency, 0);
        assert!(!config.interactive);
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        unsafe {
            std::env::set_var("CLUSTER_CONTROL_HOST_CONCURRENCY", "8");
            std::env::set_var("CLUSTER_CONTROL_INTERACTIVE", "true");
        }
        let config = ClusterControlConfig::from_env();
        assert_eq!(config.host_concurrency, 8);
        assert!(config.interactive);
        unsafe {
            std::env::remove_var("CLUSTER_CONTROL_HOST_CONCURRENCY");
            std::env::remove_var("CLUSTER_CONTROL_INTERACTIVE");
        }
    }
}
