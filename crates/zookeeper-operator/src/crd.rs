//! Custom Resource Definitions for the ZooKeeper Kubernetes Operator
//!
//! This module defines the `ZookeeperCluster` and `ZookeeperZnode` CRDs as
//! well as the cluster-scoped `AuthenticationClass` referenced from cluster
//! security configuration.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Rendered configuration file names mounted into server pods
pub const ZOO_CFG_FILE_NAME: &str = "zoo.cfg";
pub const SECURITY_PROPERTIES_FILE_NAME: &str = "security.properties";

/// Service port names
pub const CLIENT_PORT_NAME: &str = "client";
pub const SECURE_CLIENT_PORT_NAME: &str = "secureClient";
pub const LEADER_PORT_NAME: &str = "leader";
pub const ELECTION_PORT_NAME: &str = "election";
pub const METRICS_PORT_NAME: &str = "metrics";

/// Well-known ZooKeeper ports
pub const CLIENT_PORT: u16 = 2181;
pub const SECURE_CLIENT_PORT: u16 = 2282;
pub const LEADER_PORT: u16 = 2888;
pub const ELECTION_PORT: u16 = 3888;
pub const METRICS_PORT: u16 = 9505;
pub const ADMIN_PORT: u16 = 8080;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "zookeeper-operator";

/// The single server role this operator manages
pub const SERVER_ROLE: &str = "server";

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100m")
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E|m)?$").unwrap()
});

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// ZookeeperCluster custom resource definition
///
/// Represents a ZooKeeper ensemble deployment. The operator composes the
/// per-role-group configuration, resolves security settings, renders the
/// `zoo.cfg` / `security.properties` files and publishes discovery
/// ConfigMaps describing how clients reach the ensemble.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "zookeeper.quorumops.dev",
    version = "v1alpha1",
    kind = "ZookeeperCluster",
    plural = "zookeeperclusters",
    shortname = "zk",
    namespaced,
    status = "ZookeeperClusterStatus",
    printcolumn = r#"{"name":"Listener", "type":"string", "jsonPath":".spec.clusterConfig.listenerClass"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperClusterSpec {
    /// Cluster-wide configuration: exposure, security, identity offsets
    #[serde(default)]
    #[validate(nested)]
    pub cluster_config: ClusterConfigSpec,

    /// The server role: role-level config plus named role groups
    #[validate(nested)]
    pub servers: ServerSpec,
}

/// Cluster-wide configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigSpec {
    /// How the ensemble is exposed to clients
    #[serde(default)]
    pub listener_class: ListenerClass,

    /// References to cluster-scoped AuthenticationClass objects.
    /// At most one is supported and its provider must be TLS.
    #[serde(default)]
    pub authentication: Vec<AuthenticationRef>,

    /// TLS settings for quorum and client traffic
    #[serde(default)]
    pub tls: Option<ZookeeperTls>,
}

/// Exposure mode of the ensemble
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerClass {
    /// Reachable only inside the cluster network (ClusterIP service)
    #[default]
    ClusterInternal,
    /// Additionally reachable through node-level addressing (NodePort service)
    ExternalUnstable,
}

/// Reference to a cluster-scoped AuthenticationClass
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRef {
    /// Name of the AuthenticationClass. Only affects client connections:
    /// whether clients must authenticate via TLS, and which ca.crt is used
    /// to validate client certificates. Overrides
    /// `spec.clusterConfig.tls.serverSecretClass` trust settings.
    #[validate(length(min = 1, message = "authenticationClass must not be empty"))]
    pub authentication_class: String,
}

/// TLS settings for the ensemble
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperTls {
    /// Secret class for mutual quorum (server-to-server) verification
    #[serde(default = "default_quorum_secret_class")]
    pub quorum_secret_class: String,

    /// Secret class for client connections. Setting this enables TLS
    /// towards clients.
    #[serde(default)]
    pub server_secret_class: Option<String>,
}

impl Default for ZookeeperTls {
    fn default() -> Self {
        Self {
            quorum_secret_class: default_quorum_secret_class(),
            server_secret_class: None,
        }
    }
}

fn default_quorum_secret_class() -> String {
    "tls".to_string()
}

/// The server role definition
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Role-level configuration, inherited by all role groups
    #[serde(default)]
    #[validate(nested)]
    pub config: Option<ZookeeperConfigSpec>,

    /// Role-level property-file overrides: filename -> key -> value
    #[serde(default)]
    pub config_overrides: BTreeMap<String, BTreeMap<String, String>>,

    /// Named role groups, each producing one StatefulSet worth of members
    #[serde(default)]
    pub role_groups: BTreeMap<String, RoleGroupSpec>,
}

/// One role group of ensemble members
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RoleGroupSpec {
    /// Number of ensemble members in this group
    #[serde(default = "default_replicas")]
    #[validate(range(min = 1, message = "replicas must be at least 1"))]
    pub replicas: i32,

    /// Group-level configuration, overriding role-level values field by field
    #[serde(default)]
    #[validate(nested)]
    pub config: Option<ZookeeperConfigSpec>,

    /// Group-level property-file overrides: filename -> key -> value
    #[serde(default)]
    pub config_overrides: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for RoleGroupSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            config: None,
            config_overrides: BTreeMap::new(),
        }
    }
}

fn default_replicas() -> i32 {
    1
}

/// Tunables for ZooKeeper servers, mergeable across role and group level
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperConfigSpec {
    /// Starting value for member identities (`myid`); identities must be >= 1
    #[validate(range(min = 1, message = "myidOffset must be at least 1"))]
    pub myid_offset: Option<u16>,

    /// ZooKeeper initLimit (ticks a follower may take to sync with the leader)
    #[validate(range(min = 1))]
    pub init_limit: Option<u32>,

    /// ZooKeeper syncLimit (ticks a follower may lag behind the leader)
    #[validate(range(min = 1))]
    pub sync_limit: Option<u32>,

    /// ZooKeeper tickTime in milliseconds
    #[validate(range(min = 1))]
    pub tick_time: Option<u32>,

    /// Resource envelope for the server containers
    #[validate(nested)]
    pub resources: Option<ResourcesSpec>,

    /// Pod affinity/anti-affinity rules
    #[schemars(skip)]
    pub affinity: Option<k8s_openapi::api::core::v1::Affinity>,

    /// Graceful shutdown window in seconds
    pub graceful_shutdown_timeout_seconds: Option<u64>,
}

/// Resource envelope (CPU, memory, storage)
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    #[validate(nested)]
    pub cpu: Option<CpuLimits>,
    #[validate(nested)]
    pub memory: Option<MemoryLimits>,
    #[validate(nested)]
    pub storage: Option<StorageLimits>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CpuLimits {
    /// CPU request (e.g. "100m")
    #[validate(custom(function = "validate_quantity"))]
    pub min: Option<String>,
    /// CPU limit (e.g. "200m")
    #[validate(custom(function = "validate_quantity"))]
    pub max: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MemoryLimits {
    /// Memory limit (e.g. "1Gi")
    #[validate(custom(function = "validate_quantity"))]
    pub limit: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StorageLimits {
    /// Persistent volume capacity (e.g. "1Gi")
    #[validate(custom(function = "validate_quantity"))]
    pub capacity: Option<String>,
}

/// Status of a ZookeeperCluster
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperClusterStatus {
    /// Per-role-group client connection strings
    #[serde(default)]
    pub client_connections: BTreeMap<String, String>,

    /// Observed conditions
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Generation last acted upon
    #[serde(default)]
    pub observed_generation: i64,
}

/// A single status condition
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Condition type (e.g. "Ready")
    pub r#type: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// RFC 3339 timestamp of the last transition
    pub last_transition_time: String,
}

/// ZookeeperZnode custom resource definition
///
/// Requests a dedicated sub-tree ("chroot") inside a ZooKeeper ensemble's
/// namespace. The path is derived from the resource's UID, never from user
/// input, which guarantees collision-freedom without coordination.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "zookeeper.quorumops.dev",
    version = "v1alpha1",
    kind = "ZookeeperZnode",
    plural = "zookeeperznodes",
    shortname = "znode",
    namespaced,
    status = "ZookeeperZnodeStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterRef.name"}"#,
    printcolumn = r#"{"name":"Path", "type":"string", "jsonPath":".status.znodePath"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperZnodeSpec {
    /// The ZookeeperCluster this znode lives in
    #[validate(nested)]
    pub cluster_ref: ClusterReference,
}

/// Reference to a ZookeeperCluster
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReference {
    /// Name of the ZookeeperCluster
    #[validate(length(min = 1, message = "cluster name must not be empty"))]
    pub name: String,
    /// Namespace of the cluster; defaults to the znode's own namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Status of a ZookeeperZnode
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperZnodeStatus {
    /// The realized namespace path inside the ensemble. Absent means the
    /// znode has not been created yet (or creation is pending retry).
    #[serde(default)]
    pub znode_path: Option<String>,
}

/// AuthenticationClass custom resource definition (cluster-scoped)
///
/// Describes a reusable client authentication method. ZooKeeper only
/// supports the TLS provider; any other provider is rejected during
/// security resolution.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "authentication.quorumops.dev",
    version = "v1alpha1",
    kind = "AuthenticationClass",
    plural = "authenticationclasses"
)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationClassSpec {
    /// The authentication backend; exactly one variant should be set
    pub provider: AuthenticationProvider,
}

/// Authentication backends. Only `tls` is supported by this operator.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationProvider {
    pub tls: Option<TlsProvider>,
    pub ldap: Option<LdapProvider>,
    pub oidc: Option<OidcProvider>,
    pub r#static: Option<StaticProvider>,
}

/// TLS (mutual certificate) authentication
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsProvider {
    /// Secret class supplying the trust material for validating client
    /// certificates. When unset, the server's own trust store is used.
    #[serde(default)]
    pub client_cert_secret_class: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LdapProvider {
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OidcProvider {
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaticProvider {
    #[serde(default)]
    pub user_credentials_secret: Option<String>,
}
