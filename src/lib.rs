//! Cluster-control core: topology, replication-account, and fan-out
//! execution primitives for administering fleets of replicated database
//! servers.
//!
//! This crate does not speak a SQL wire protocol itself. It defines the
//! [`Session`](session::Session) and [`SessionFactory`](session::SessionFactory)
//! traits as the seam a real driver plugs into, and builds the rest of the
//! system - account lifecycle, advisory locking, fan-out execution, and
//! topology operations - on top of that seam.
//!
//! # Module Organization
//!
//! - **Connection shape**: [`options`] (connection option bag and its
//!   cross-field validation), [`uri`] (URI grammar parser)
//! - **Runtime seam**: [`session`] (the `Session`/`SessionFactory` traits),
//!   [`pool`] (session caching keyed by connection fingerprint)
//! - **Coordination**: [`lock`] (named advisory locks)
//! - **Catalog**: [`metadata`] (the `MetadataStore` trait and an in-memory
//!   reference implementation)
//! - **Domain model**: [`topology`] (Cluster/ClusterSet/ReplicaSet), [`account`]
//!   (replication-account lifecycle)
//! - **Operations**: [`execute`] (fan-out command execution), [`controller`]
//!   (add/remove member, switchover, failover, dissolve, ...)
//! - **Ambient**: [`config`] (tunables), [`error`] (the crate's error type)
//!
//! # Quick Start
//!
//! ```no_run
//! use cluster_control::config::ClusterControlConfig;
//! use cluster_control::metadata::InMemoryMetadataStore;
//! use cluster_control::topology::{Topology, TopologyKind};
//! use cluster_control::lock::LockService;
//! use std::sync::Arc;
//!
//! # async fn example() -> cluster_control::error::Result<()> {
//! let config = ClusterControlConfig::from_env();
//! let topology = Topology {
//!     id: "mycluster".to_string(),
//!     kind: TopologyKind::Cluster,
//!     name: "mycluster".to_string(),
//!     multi_primary: false,
//!     metadata: Arc::new(InMemoryMetadataStore::new()),
//!     locks: LockService::with_config(&config),
//! };
//! let _members = topology.members(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod config;
pub mod controller;
pub mod error;
pub mod execute;
pub mod lock;
pub mod metadata;
pub mod options;
pub mod pool;
pub mod session;
pub mod topology;
pub mod uri;

pub use config::ClusterControlConfig;
pub use error::{ClusterControlError, Result};
pub use options::ConnectionOptions;
pub use session::{Session, SessionFactory, SharedSession};
pub use topology::{Topology, TopologyKind};
