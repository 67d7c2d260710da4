//! ZookeeperZnode controller
//!
//! Grants each ZookeeperZnode resource a dedicated sub-tree inside the
//! referenced ensemble. The path is derived from the resource UID, created
//! idempotently, published through discovery ConfigMaps and recorded in
//! the status. Deletion is gated by a finalizer: the resource stays until
//! the remote sub-tree is recursively removed.

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{ZookeeperCluster, ZookeeperZnode};
use crate::discovery;
use crate::error::{OperatorError, Result};
use crate::security::ZookeeperSecurity;
use crate::zk::{self, ZookeeperEnsembleClient};

/// Finalizer gating znode deletion on remote cleanup
pub const ZNODE_FINALIZER: &str = "zookeeper.quorumops.dev/znode-finalizer";

/// Requeue interval after a successful pass
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Base and cap for error backoff
const ERROR_REQUEUE_SECONDS: u64 = 30;
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the znode controller
pub struct ZnodeContext {
    pub client: Client,
    pub metrics: Option<ZnodeMetrics>,
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the znode controller
#[derive(Clone)]
pub struct ZnodeMetrics {
    pub reconciliations: metrics::Counter,
    pub errors: metrics::Counter,
    pub duration: metrics::Histogram,
}

impl ZnodeMetrics {
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("zookeeper_operator_znode_reconciliations_total"),
            errors: metrics::counter!("zookeeper_operator_znode_reconciliation_errors_total"),
            duration: metrics::histogram!(
                "zookeeper_operator_znode_reconciliation_duration_seconds"
            ),
        }
    }
}

impl Default for ZnodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the ZookeeperZnode controller
pub async fn run_znode_controller(client: Client, namespace: Option<String>) -> Result<()> {
    let znodes: Api<ZookeeperZnode> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ZnodeContext {
        client: client.clone(),
        metrics: Some(ZnodeMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting ZookeeperZnode controller"
    );

    let config_maps = match &namespace {
        Some(ns) => Api::<ConfigMap>::namespaced(client.clone(), ns),
        None => Api::<ConfigMap>::all(client.clone()),
    };

    Controller::new(znodes, Config::default())
        .owns(config_maps, Config::default())
        .run(reconcile_znode, znode_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Znode reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Znode reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// The namespace path granted to a znode resource.
///
/// Derived from the UID so the path is collision-free without any
/// coordination and survives spec edits unchanged.
pub fn znode_path(znode: &ZookeeperZnode) -> Result<String> {
    let uid = znode.uid().ok_or_else(|| {
        OperatorError::ValidationError("ZookeeperZnode has no UID yet".to_string())
    })?;
    Ok(format!("/znode-{uid}"))
}

/// Connect string of a cluster's client Service
fn cluster_connect_string(cluster_name: &str, namespace: &str, port: u16) -> String {
    format!("{cluster_name}.{namespace}.svc.cluster.local:{port}")
}

/// Main reconciliation function
#[instrument(skip(znode, ctx), fields(name = %znode.name_any(), namespace = znode.namespace()))]
async fn reconcile_znode(znode: Arc<ZookeeperZnode>, ctx: Arc<ZnodeContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = znode.namespace().ok_or_else(|| {
        OperatorError::ValidationError("ZookeeperZnode must be namespaced".to_string())
    })?;
    let znode_name = znode.name_any();
    let znodes: Api<ZookeeperZnode> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&znodes, ZNODE_FINALIZER, znode, |event| async {
        match event {
            FinalizerEvent::Apply(znode) => apply_znode(znode, ctx.clone()).await,
            FinalizerEvent::Cleanup(znode) => cleanup_znode(znode, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    if result.is_ok() {
        ctx.error_counts.remove(&znode_name);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        OperatorError::ReconcileFailed(e.to_string())
    })
}

/// Resolve the referenced cluster; `None` means it does not exist (yet)
async fn resolve_cluster_ref(
    client: &Client,
    znode: &ZookeeperZnode,
    znode_namespace: &str,
) -> Result<Option<(ZookeeperCluster, String)>> {
    let cluster_name = &znode.spec.cluster_ref.name;
    let cluster_namespace = znode
        .spec
        .cluster_ref
        .namespace
        .clone()
        .unwrap_or_else(|| znode_namespace.to_string());

    let clusters: Api<ZookeeperCluster> = Api::namespaced(client.clone(), &cluster_namespace);
    Ok(clusters
        .get_opt(cluster_name)
        .await?
        .map(|c| (c, cluster_namespace)))
}

/// Apply path: create the znode remotely, publish discovery, record status
#[instrument(skip(znode, ctx))]
async fn apply_znode(znode: Arc<ZookeeperZnode>, ctx: Arc<ZnodeContext>) -> Result<Action> {
    let name = znode.name_any();
    let namespace = znode.namespace().ok_or_else(|| {
        OperatorError::ValidationError("ZookeeperZnode must be namespaced".to_string())
    })?;
    let path = znode_path(&znode)?;

    let (cluster, cluster_namespace) = resolve_cluster_ref(&ctx.client, &znode, &namespace)
        .await?
        .ok_or_else(|| {
            OperatorError::NotFound(format!(
                "ZookeeperCluster '{}' referenced by znode '{}/{}'",
                znode.spec.cluster_ref.name, namespace, name
            ))
        })?;

    let security = ZookeeperSecurity::resolve(&ctx.client, &cluster).await?;

    let connect = cluster_connect_string(
        &cluster.name_any(),
        &cluster_namespace,
        security.client_port(),
    );
    let session = ZookeeperEnsembleClient::connect(&connect).await?;
    zk::ensure_created(&session, &path).await?;
    info!(name = %name, path = %path, "Znode present in ensemble");

    // Discovery only becomes visible once the znode exists remotely.
    let owner_ref = znode.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::ValidationError("ZookeeperZnode has no UID yet".to_string())
    })?;
    let connections = discovery::resolve(&ctx.client, &cluster, &security, &path).await?;
    for cm in discovery::discovery_config_maps(&name, &namespace, owner_ref, &connections) {
        crate::controller::apply_config_map(&ctx.client, &namespace, cm).await?;
    }

    if znode.status.as_ref().and_then(|s| s.znode_path.as_deref()) != Some(path.as_str()) {
        let znodes: Api<ZookeeperZnode> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": { "znodePath": path } });
        znodes
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    } else {
        debug!(name = %name, "Status already records the znode path");
    }

    Ok(Action::requeue(Duration::from_secs(
        DEFAULT_REQUEUE_SECONDS,
    )))
}

/// Cleanup path: recursively delete the remote sub-tree.
///
/// Errors propagate so the finalizer retries until the ensemble confirms
/// the deletion; the resource cannot be garbage-collected before that. A
/// deleted cluster is the one exception: with the ensemble gone there is
/// nothing left to clean.
#[instrument(skip(znode, ctx))]
async fn cleanup_znode(znode: Arc<ZookeeperZnode>, ctx: Arc<ZnodeContext>) -> Result<Action> {
    let name = znode.name_any();
    let namespace = znode.namespace().ok_or_else(|| {
        OperatorError::ValidationError("ZookeeperZnode must be namespaced".to_string())
    })?;
    let path = znode_path(&znode)?;

    let Some((cluster, cluster_namespace)) =
        resolve_cluster_ref(&ctx.client, &znode, &namespace).await?
    else {
        warn!(
            name = %name,
            cluster = %znode.spec.cluster_ref.name,
            "Referenced cluster no longer exists, skipping remote cleanup"
        );
        return Ok(Action::await_change());
    };

    let security = ZookeeperSecurity::resolve(&ctx.client, &cluster).await?;
    let connect = cluster_connect_string(
        &cluster.name_any(),
        &cluster_namespace,
        security.client_port(),
    );
    let session = ZookeeperEnsembleClient::connect(&connect).await?;
    zk::delete_recursive(&session, &path).await?;

    info!(name = %name, path = %path, "Znode removed from ensemble");

    Ok(Action::await_change())
}

/// Error policy for the znode controller — exponential backoff
fn znode_error_policy(
    znode: Arc<ZookeeperZnode>,
    error: &OperatorError,
    ctx: Arc<ZnodeContext>,
) -> Action {
    let key = znode.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    };

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Znode reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterReference, ZookeeperZnodeSpec, ZookeeperZnodeStatus};

    fn test_znode(uid: Option<&str>) -> ZookeeperZnode {
        let mut znode = ZookeeperZnode::new(
            "my-znode",
            ZookeeperZnodeSpec {
                cluster_ref: ClusterReference {
                    name: "zk".to_string(),
                    namespace: None,
                },
            },
        );
        znode.metadata.namespace = Some("default".to_string());
        znode.metadata.uid = uid.map(str::to_string);
        znode
    }

    #[test]
    fn test_znode_path_from_uid() {
        let znode = test_znode(Some("4fd4c380-5f46-4d36-9d88-93b19e7de2d3"));
        assert_eq!(
            znode_path(&znode).unwrap(),
            "/znode-4fd4c380-5f46-4d36-9d88-93b19e7de2d3"
        );
    }

    #[test]
    fn test_znode_path_requires_uid() {
        let znode = test_znode(None);
        assert!(matches!(
            znode_path(&znode),
            Err(OperatorError::ValidationError(_))
        ));
    }

    #[test]
    fn test_cluster_connect_string() {
        assert_eq!(
            cluster_connect_string("zk", "prod", 2282),
            "zk.prod.svc.cluster.local:2282"
        );
    }

    #[test]
    fn test_status_write_skipped_when_path_recorded() {
        let mut znode = test_znode(Some("abc"));
        let path = znode_path(&znode).unwrap();
        znode.status = Some(ZookeeperZnodeStatus {
            znode_path: Some(path.clone()),
        });
        let recorded = znode.status.as_ref().and_then(|s| s.znode_path.as_deref());
        assert_eq!(recorded, Some(path.as_str()));
    }
}
