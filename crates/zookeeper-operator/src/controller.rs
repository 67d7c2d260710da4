//! ZookeeperCluster controller
//!
//! Watches ZookeeperCluster resources and reconciles the ensemble's
//! rendered configuration: one ConfigMap per role group carrying `zoo.cfg`
//! and `security.properties`, the cluster-level discovery ConfigMaps, and
//! the `status.clientConnections` map. StatefulSets, Services and TLS
//! secret material are produced by external collaborators; owned objects
//! are garbage-collected through owner references, so the cluster needs no
//! finalizer.

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

use crate::config::{self, MergedConfig};
use crate::crd::{
    ClusterCondition, ZookeeperCluster, ZookeeperClusterStatus, FIELD_MANAGER,
    SECURITY_PROPERTIES_FILE_NAME, ZOO_CFG_FILE_NAME,
};
use crate::discovery;
use crate::ensemble;
use crate::error::{OperatorError, Result};
use crate::security::ZookeeperSecurity;

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the cluster controller
#[derive(Clone)]
pub struct ControllerMetrics {
    pub reconciliations: metrics::Counter,
    pub errors: metrics::Counter,
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("zookeeper_operator_cluster_reconciliations_total"),
            errors: metrics::counter!("zookeeper_operator_cluster_reconciliation_errors_total"),
            duration: metrics::histogram!(
                "zookeeper_operator_cluster_reconciliation_duration_seconds"
            ),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the ZookeeperCluster controller
pub async fn run_controller(client: Client, namespace: Option<String>) -> Result<()> {
    let clusters: Api<ZookeeperCluster> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting ZookeeperCluster controller"
    );

    let config_maps = match &namespace {
        Some(ns) => Api::<ConfigMap>::namespaced(client.clone(), ns),
        None => Api::<ConfigMap>::all(client.clone()),
    };

    Controller::new(clusters, Config::default())
        .owns(config_maps, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<ZookeeperCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = apply_cluster(&cluster, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    if result.is_ok() {
        ctx.error_counts.remove(&cluster.name_any());
    } else if let Some(ref metrics) = ctx.metrics {
        metrics.errors.increment(1);
    }

    result
}

/// Apply (create/update) the rendered configuration for one cluster
async fn apply_cluster(cluster: &ZookeeperCluster, ctx: &ControllerContext) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().ok_or_else(|| {
        OperatorError::ValidationError("ZookeeperCluster must be namespaced".to_string())
    })?;

    info!(name = %name, namespace = %namespace, "Reconciling ZookeeperCluster");

    if let Err(errors) = cluster.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %name, errors = %error_msg, "Cluster spec validation failed");
        return Err(OperatorError::ValidationError(error_msg));
    }

    if cluster.spec.servers.role_groups.is_empty() {
        return Err(OperatorError::ValidationError(
            "spec.servers.roleGroups must define at least one role group".to_string(),
        ));
    }
    for (group_name, group) in &cluster.spec.servers.role_groups {
        if let Err(errors) = group.validate() {
            return Err(OperatorError::ValidationError(format!(
                "role group '{}': {}",
                group_name, errors
            )));
        }
    }

    let security = ZookeeperSecurity::resolve(&ctx.client, cluster).await?;

    let owner_ref = cluster.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::ValidationError("ZookeeperCluster has no UID yet".to_string())
    })?;

    let mut client_connections = BTreeMap::new();
    for (group_name, group) in &cluster.spec.servers.role_groups {
        let merged = config::compose(&name, &cluster.spec.servers, group);
        let replicas = u16::try_from(group.replicas).unwrap_or(1).max(1);
        let members = ensemble::members(&name, group_name, &namespace, replicas, merged.myid_offset);

        let cm = role_group_config_map(
            &name,
            group_name,
            &namespace,
            owner_ref.clone(),
            &members,
            &merged,
            &security,
        );
        apply_config_map(&ctx.client, &namespace, cm).await?;

        let hosts: Vec<String> = members
            .iter()
            .map(|m| format!("{}:{}", m.fqdn, security.client_port()))
            .collect();
        client_connections.insert(group_name.clone(), hosts.join(","));
    }

    // Cluster-level discovery at the namespace root.
    let connections = discovery::resolve(&ctx.client, cluster, &security, "/").await?;
    for cm in discovery::discovery_config_maps(&name, &namespace, owner_ref, &connections) {
        apply_config_map(&ctx.client, &namespace, cm).await?;
    }

    let status = build_status(cluster, client_connections);
    if !status_up_to_date(cluster.status.as_ref(), &status) {
        update_status(&ctx.client, &namespace, &name, status).await?;
    } else {
        debug!(name = %name, "Status already up to date");
    }

    info!(name = %name, "Reconciliation complete");

    Ok(Action::requeue(Duration::from_secs(
        DEFAULT_REQUEUE_SECONDS,
    )))
}

/// Build the ConfigMap holding one role group's rendered configuration
fn role_group_config_map(
    cluster_name: &str,
    group_name: &str,
    namespace: &str,
    owner_ref: OwnerReference,
    members: &[ensemble::EnsembleMember],
    merged: &MergedConfig,
    security: &ZookeeperSecurity,
) -> ConfigMap {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "zookeeper".to_string());
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        cluster_name.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        crate::crd::SERVER_ROLE.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );

    let mut data = BTreeMap::new();
    data.insert(
        ZOO_CFG_FILE_NAME.to_string(),
        ensemble::render_zoo_cfg(members, merged, security),
    );
    data.insert(
        SECURITY_PROPERTIES_FILE_NAME.to_string(),
        ensemble::render_security_properties(merged),
    );

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(ensemble::role_group_name(cluster_name, group_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Verify the operator still owns a resource before force-applying.
///
/// Checks the `app.kubernetes.io/managed-by` label of the existing object;
/// a resource managed by a different controller (Helm, another operator)
/// is never force-applied over.
fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get("app.kubernetes.io/managed-by"));
    match managed_by {
        Some(manager) if manager != FIELD_MANAGER => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::ValidationError(format!(
                "resource '{}' is managed by '{}', not {}; \
                 refusing to force-apply to avoid ownership conflict",
                name, manager, FIELD_MANAGER
            )))
        }
        _ => Ok(()),
    }
}

/// Apply a ConfigMap using server-side apply
pub(crate) async fn apply_config_map(
    client: &Client,
    namespace: &str,
    cm: ConfigMap,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let name = cm.metadata.name.clone().ok_or_else(|| {
        OperatorError::ValidationError("ConfigMap missing metadata.name".into())
    })?;

    debug!(name = %name, "Applying ConfigMap");

    if let Ok(existing) = api.get(&name).await {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&name, &patch_params, &Patch::Apply(&cm)).await?;

    Ok(())
}

/// Build cluster status from the computed connection map
fn build_status(
    cluster: &ZookeeperCluster,
    client_connections: BTreeMap<String, String>,
) -> ZookeeperClusterStatus {
    ZookeeperClusterStatus {
        client_connections,
        conditions: vec![ClusterCondition {
            r#type: "Ready".to_string(),
            status: "True".to_string(),
            reason: "ReconcileSucceeded".to_string(),
            message: "Configuration rendered and discovery published".to_string(),
            last_transition_time: Utc::now().to_rfc3339(),
        }],
        observed_generation: cluster.metadata.generation.unwrap_or(0),
    }
}

/// Whether the recorded status already reflects the computed one.
///
/// Transition timestamps are ignored so an unchanged cluster produces no
/// status writes.
fn status_up_to_date(
    existing: Option<&ZookeeperClusterStatus>,
    computed: &ZookeeperClusterStatus,
) -> bool {
    match existing {
        None => false,
        Some(existing) => {
            existing.client_connections == computed.client_connections
                && existing.observed_generation == computed.observed_generation
                && existing.conditions.len() == computed.conditions.len()
                && existing
                    .conditions
                    .iter()
                    .zip(&computed.conditions)
                    .all(|(a, b)| a.r#type == b.r#type && a.status == b.status)
        }
    }
}

/// Update the cluster status subresource
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: ZookeeperClusterStatus,
) -> Result<()> {
    let api: Api<ZookeeperCluster> = Api::namespaced(client.clone(), namespace);

    debug!(name = %name, "Updating cluster status");

    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

/// Error policy for the controller — exponential backoff
fn error_policy(
    cluster: Arc<ZookeeperCluster>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = cluster.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // 30s -> 60s -> 120s -> 240s -> 480s -> 600s (capped)
    let delay = {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    };

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RoleGroupSpec, ServerSpec, ZookeeperClusterSpec};

    fn test_cluster(groups: &[(&str, i32)]) -> ZookeeperCluster {
        let role_groups = groups
            .iter()
            .map(|(name, replicas)| {
                (
                    name.to_string(),
                    RoleGroupSpec {
                        replicas: *replicas,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let mut zk = ZookeeperCluster::new(
            "test-zk",
            ZookeeperClusterSpec {
                cluster_config: Default::default(),
                servers: ServerSpec {
                    role_groups,
                    ..Default::default()
                },
            },
        );
        zk.metadata.namespace = Some("default".to_string());
        zk.metadata.uid = Some("test-uid".to_string());
        zk.metadata.generation = Some(2);
        zk
    }

    #[test]
    fn test_role_group_config_map_contents() {
        let cluster = test_cluster(&[("default", 3)]);
        let merged = config::compose(
            "test-zk",
            &cluster.spec.servers,
            &cluster.spec.servers.role_groups["default"],
        );
        let security = ZookeeperSecurity::new(None, &[]).unwrap();
        let members = ensemble::members("test-zk", "default", "default", 3, merged.myid_offset);

        let cm = role_group_config_map(
            "test-zk",
            "default",
            "default",
            OwnerReference::default(),
            &members,
            &merged,
            &security,
        );

        assert_eq!(cm.metadata.name.as_deref(), Some("test-zk-server-default"));
        let data = cm.data.unwrap();
        assert!(data["zoo.cfg"].contains("server.1="));
        assert!(data["security.properties"].contains("networkaddress.cache.ttl=5"));
        assert_eq!(
            cm.metadata.labels.unwrap()["app.kubernetes.io/managed-by"],
            "zookeeper-operator"
        );
    }

    #[test]
    fn test_status_skip_logic_ignores_timestamps() {
        let cluster = test_cluster(&[("default", 1)]);
        let mut connections = BTreeMap::new();
        connections.insert("default".to_string(), "host:2181".to_string());

        let first = build_status(&cluster, connections.clone());
        let mut second = build_status(&cluster, connections);
        second.conditions[0].last_transition_time = "2020-01-01T00:00:00Z".to_string();
        assert!(status_up_to_date(Some(&first), &second));

        let changed = build_status(&cluster, BTreeMap::new());
        assert!(!status_up_to_date(Some(&first), &changed));
        assert!(!status_up_to_date(None, &first));
    }

    #[test]
    fn test_verify_ownership_rejects_foreign_manager() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("zk-server-default".to_string());
        assert!(verify_ownership(&cm).is_ok());

        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/managed-by".to_string(), "Helm".to_string());
        cm.metadata.labels = Some(labels);
        assert!(verify_ownership(&cm).is_err());
    }
}
