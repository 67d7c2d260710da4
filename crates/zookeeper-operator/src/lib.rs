//! # ZooKeeper Kubernetes Operator
//!
//! Kubernetes operator for Apache ZooKeeper ensembles. It manages two
//! namespaced custom resources:
//!
//! - **ZookeeperCluster** — declares an ensemble: role groups and replica
//!   counts, TLS and authentication settings, exposure mode. The operator
//!   composes the per-group configuration, renders `zoo.cfg` /
//!   `security.properties` into ConfigMaps, publishes discovery ConfigMaps
//!   and records client connection strings in the status.
//! - **ZookeeperZnode** — grants an application a dedicated sub-tree of
//!   the ensemble namespace. The path is derived from the resource UID,
//!   created idempotently, and recursively removed through a finalizer
//!   when the resource is deleted.
//!
//! StatefulSets, Services and TLS secret material are produced by external
//! collaborators; this operator looks them up but does not create them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use zookeeper_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`config`] - Role/role-group configuration composition
//! - [`security`] - Authentication and TLS resolution
//! - [`ensemble`] - Membership computation and config file rendering
//! - [`discovery`] - Client connection discovery and discovery ConfigMaps
//! - [`zk`] - ZooKeeper ensemble client and recursive znode operations
//! - [`controller`] - ZookeeperCluster reconciliation
//! - [`znode_controller`] - ZookeeperZnode reconciliation (finalizer)
//! - [`error`] - Error types for operator operations
//!
//! ## Metrics
//!
//! The operator exposes Prometheus metrics per controller:
//!
//! - `zookeeper_operator_cluster_reconciliations_total`
//! - `zookeeper_operator_cluster_reconciliation_errors_total`
//! - `zookeeper_operator_cluster_reconciliation_duration_seconds`
//! - `zookeeper_operator_znode_reconciliations_total`
//! - `zookeeper_operator_znode_reconciliation_errors_total`
//! - `zookeeper_operator_znode_reconciliation_duration_seconds`

pub mod config;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod ensemble;
pub mod error;
pub mod security;
pub mod zk;
pub mod znode_controller;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::controller::{run_controller, ControllerContext, ControllerMetrics};
    pub use crate::crd::{
        AuthenticationClass, AuthenticationClassSpec, ClusterReference, ListenerClass,
        ZookeeperCluster, ZookeeperClusterSpec, ZookeeperClusterStatus, ZookeeperZnode,
        ZookeeperZnodeSpec, ZookeeperZnodeStatus,
    };
    pub use crate::discovery::{DiscoveredConnections, ZookeeperConnection};
    pub use crate::error::{OperatorError, Result};
    pub use crate::security::ZookeeperSecurity;
    pub use crate::znode_controller::{run_znode_controller, ZnodeContext, ZnodeMetrics};
}
