//! Connection discovery for ZooKeeper ensembles
//!
//! Produces connection descriptors for clients and publishes them as
//! discovery ConfigMaps. Two modes exist: stable in-cluster DNS names
//! (always) and node-level addressing through a NodePort Service (only
//! when the cluster's listener class opts in). The Service and
//! EndpointSlices are created by external collaborators; this module only
//! looks them up, and treats their absence as a retryable condition.

use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, ObjectMeta};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::crd::{ListenerClass, ZookeeperCluster, CLIENT_PORT_NAME, FIELD_MANAGER};
use crate::ensemble::pod_fqdn;
use crate::error::{OperatorError, Result};
use crate::security::ZookeeperSecurity;

/// Label set by Kubernetes on EndpointSlices belonging to a Service
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// A resolved way to reach an ensemble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZookeeperConnection {
    /// `host:port` entries, ordered and deduplicated
    pub hosts: Vec<String>,
    pub port: u16,
    /// Normalized namespace prefix, always starts with `/`
    pub chroot: String,
}

impl ZookeeperConnection {
    /// Build a connection descriptor, normalizing the chroot.
    ///
    /// An empty chroot resolves to `/`; anything else must already start
    /// with `/`.
    pub fn new(hosts: Vec<String>, port: u16, chroot: &str) -> Result<Self> {
        let chroot = normalize_chroot(chroot)?;
        Ok(Self { hosts, port, chroot })
    }

    /// The ZooKeeper connection URI: `host1:port,host2:port/chroot`.
    ///
    /// The chroot is always appended, including the root `/`, so the
    /// published value has one canonical spelling.
    pub fn uri(&self) -> String {
        format!("{}{}", self.hosts.join(","), self.chroot)
    }
}

fn normalize_chroot(chroot: &str) -> Result<String> {
    if chroot.is_empty() {
        return Ok("/".to_string());
    }
    if !chroot.starts_with('/') {
        return Err(OperatorError::ValidationError(format!(
            "chroot '{}' must start with '/'",
            chroot
        )));
    }
    Ok(chroot.to_string())
}

/// Both connection views of one ensemble
#[derive(Debug, Clone)]
pub struct DiscoveredConnections {
    pub in_cluster: ZookeeperConnection,
    /// Present only for listener class `external-unstable`
    pub external: Option<ZookeeperConnection>,
}

/// Resolve connection descriptors for a cluster.
#[instrument(skip(client, cluster, security), fields(cluster = %cluster.name_any()))]
pub async fn resolve(
    client: &Client,
    cluster: &ZookeeperCluster,
    security: &ZookeeperSecurity,
    chroot: &str,
) -> Result<DiscoveredConnections> {
    let namespace = cluster.namespace().ok_or_else(|| {
        OperatorError::ValidationError("ZookeeperCluster must be namespaced".to_string())
    })?;

    let in_cluster = in_cluster_connection(cluster, &namespace, security, chroot)?;
    let external = match cluster.spec.cluster_config.listener_class {
        ListenerClass::ClusterInternal => None,
        ListenerClass::ExternalUnstable => {
            Some(external_connection(client, cluster, &namespace, security, chroot).await?)
        }
    };

    debug!(
        in_cluster_hosts = in_cluster.hosts.len(),
        external = external.is_some(),
        "resolved connections"
    );
    Ok(DiscoveredConnections { in_cluster, external })
}

/// In-cluster connection: one stable DNS host per declared member.
///
/// Role groups are walked in name order (the map is sorted), ordinals in
/// ascending order, so the host list is deterministic.
pub fn in_cluster_connection(
    cluster: &ZookeeperCluster,
    namespace: &str,
    security: &ZookeeperSecurity,
    chroot: &str,
) -> Result<ZookeeperConnection> {
    let cluster_name = cluster.name_any();
    let port = security.client_port();

    let mut hosts = Vec::new();
    for (group_name, group) in &cluster.spec.servers.role_groups {
        let replicas = u16::try_from(group.replicas).unwrap_or(1).max(1);
        for ordinal in 0..replicas {
            hosts.push(format!(
                "{}:{}",
                pod_fqdn(&cluster_name, group_name, namespace, ordinal),
                port
            ));
        }
    }

    ZookeeperConnection::new(hosts, port, chroot)
}

/// External connection through the cluster's NodePort Service.
///
/// Hosts carry the allocated NodePort, but `port` stays the effective
/// client port: `CLIENT_PORT` in the published descriptor describes what
/// the ensemble listens on, not how the Service maps it.
async fn external_connection(
    client: &Client,
    cluster: &ZookeeperCluster,
    namespace: &str,
    security: &ZookeeperSecurity,
    chroot: &str,
) -> Result<ZookeeperConnection> {
    let service_name = cluster.name_any();
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let service = services.get_opt(&service_name).await?.ok_or_else(|| {
        OperatorError::NotFound(format!("Service '{}/{}'", namespace, service_name))
    })?;

    let node_port = client_node_port(&service)?;

    let slices: Api<EndpointSlice> = Api::namespaced(client.clone(), namespace);
    let params =
        ListParams::default().labels(&format!("{}={}", SERVICE_NAME_LABEL, service_name));
    let slices = slices.list(&params).await?.items;
    if slices.is_empty() {
        return Err(OperatorError::NotFound(format!(
            "no EndpointSlices for Service '{}/{}'",
            namespace, service_name
        )));
    }

    let nodes = node_names(&slices);
    if nodes.is_empty() {
        return Err(OperatorError::NotFound(format!(
            "EndpointSlices for Service '{}/{}' carry no node names",
            namespace, service_name
        )));
    }

    let hosts = nodes
        .into_iter()
        .map(|node| format!("{}:{}", node, node_port))
        .collect();
    ZookeeperConnection::new(hosts, security.client_port(), chroot)
}

/// Extract the allocated NodePort of the port named `client`.
///
/// A missing or zero NodePort means allocation has not happened yet.
pub fn client_node_port(service: &Service) -> Result<u16> {
    let name = service.name_any();
    let port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(CLIENT_PORT_NAME))
        })
        .and_then(|p| p.node_port)
        .ok_or_else(|| {
            OperatorError::NotFound(format!(
                "Service '{}' has no NodePort for port '{}'",
                name, CLIENT_PORT_NAME
            ))
        })?;
    u16::try_from(port).ok().filter(|p| *p != 0).ok_or_else(|| {
        OperatorError::NotFound(format!(
            "Service '{}' NodePort for '{}' not allocated yet",
            name, CLIENT_PORT_NAME
        ))
    })
}

/// Distinct node names backing a set of EndpointSlices, sorted
pub fn node_names(slices: &[EndpointSlice]) -> Vec<String> {
    let mut nodes: Vec<String> = slices
        .iter()
        .flat_map(|slice| &slice.endpoints)
        .filter_map(|endpoint| endpoint.node_name.clone())
        .collect();
    nodes.sort();
    nodes.dedup();
    nodes
}

/// Build the discovery ConfigMaps for an owner object.
///
/// The first ConfigMap is named after the owner and carries the in-cluster
/// view; a `<name>-nodeport` sibling is added when an external connection
/// was resolved.
pub fn discovery_config_maps(
    owner_name: &str,
    namespace: &str,
    owner_ref: OwnerReference,
    connections: &DiscoveredConnections,
) -> Vec<ConfigMap> {
    let mut maps = vec![discovery_config_map(
        owner_name,
        namespace,
        owner_ref.clone(),
        &connections.in_cluster,
    )];
    if let Some(external) = &connections.external {
        maps.push(discovery_config_map(
            &format!("{owner_name}-nodeport"),
            namespace,
            owner_ref,
            external,
        ));
    }
    maps
}

fn discovery_config_map(
    name: &str,
    namespace: &str,
    owner_ref: OwnerReference,
    connection: &ZookeeperConnection,
) -> ConfigMap {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );

    let mut data = BTreeMap::new();
    data.insert("HOST".to_string(), connection.uri());
    data.insert("HOSTS".to_string(), connection.hosts.join(","));
    data.insert("CLIENT_PORT".to_string(), connection.port.to_string());
    data.insert("CHROOT".to_string(), connection.chroot.clone());

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RoleGroupSpec, ServerSpec, ZookeeperClusterSpec};
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::api::discovery::v1::Endpoint;

    fn cluster(groups: &[(&str, i32)]) -> ZookeeperCluster {
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
            "zk",
            ZookeeperClusterSpec {
                cluster_config: Default::default(),
                servers: ServerSpec {
                    role_groups,
                    ..Default::default()
                },
            },
        );
        zk.metadata.namespace = Some("prod".to_string());
        zk
    }

    fn plain_security() -> ZookeeperSecurity {
        ZookeeperSecurity::new(None, &[]).unwrap()
    }

    fn nodeport_service(name: &str, port_name: &str, node_port: Option<i32>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some(port_name.to_string()),
                    node_port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn slice_with_nodes(nodes: &[&str]) -> EndpointSlice {
        EndpointSlice {
            endpoints: nodes
                .iter()
                .map(|n| Endpoint {
                    node_name: Some(n.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_in_cluster_hosts_cover_all_groups_in_order() {
        let zk = cluster(&[("beta", 1), ("alpha", 2)]);
        let conn = in_cluster_connection(&zk, "prod", &plain_security(), "").unwrap();
        assert_eq!(
            conn.hosts,
            vec![
                "zk-server-alpha-0.zk-server-alpha.prod.svc.cluster.local:2181",
                "zk-server-alpha-1.zk-server-alpha.prod.svc.cluster.local:2181",
                "zk-server-beta-0.zk-server-beta.prod.svc.cluster.local:2181",
            ]
        );
        assert_eq!(conn.port, 2181);
    }

    #[test]
    fn test_chroot_normalization() {
        let conn = ZookeeperConnection::new(vec!["h:2181".into()], 2181, "").unwrap();
        assert_eq!(conn.chroot, "/");
        // the root chroot is still spelled out
        assert_eq!(conn.uri(), "h:2181/");

        let conn = ZookeeperConnection::new(vec!["h:2181".into()], 2181, "/znode-abc").unwrap();
        assert_eq!(conn.uri(), "h:2181/znode-abc");

        let err = ZookeeperConnection::new(vec![], 2181, "no-slash").unwrap_err();
        assert!(matches!(err, OperatorError::ValidationError(_)));
    }

    #[test]
    fn test_client_node_port_extraction() {
        let svc = nodeport_service("zk", "client", Some(31000));
        assert_eq!(client_node_port(&svc).unwrap(), 31000);
    }

    #[test]
    fn test_missing_node_port_is_retryable() {
        let svc = nodeport_service("zk", "client", None);
        let err = client_node_port(&svc).unwrap_err();
        assert!(matches!(err, OperatorError::NotFound(_)));
        assert!(err.is_retryable());

        let svc = nodeport_service("zk", "metrics", Some(31000));
        assert!(client_node_port(&svc).is_err());
    }

    #[test]
    fn test_node_names_distinct_and_sorted() {
        let slices = vec![
            slice_with_nodes(&["node-b", "node-a"]),
            slice_with_nodes(&["node-a", "node-c"]),
        ];
        assert_eq!(node_names(&slices), vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn test_discovery_config_map_data() {
        let conn = ZookeeperConnection::new(
            vec!["a:2181".to_string(), "b:2181".to_string()],
            2181,
            "/znode-x",
        )
        .unwrap();
        let maps = discovery_config_maps(
            "my-znode",
            "prod",
            OwnerReference::default(),
            &DiscoveredConnections {
                in_cluster: conn,
                external: None,
            },
        );
        assert_eq!(maps.len(), 1);
        let data = maps[0].data.as_ref().unwrap();
        assert_eq!(data["HOST"], "a:2181,b:2181/znode-x");
        assert_eq!(data["HOSTS"], "a:2181,b:2181");
        assert_eq!(data["CLIENT_PORT"], "2181");
        assert_eq!(data["CHROOT"], "/znode-x");
    }

    #[test]
    fn test_external_adds_nodeport_config_map() {
        let security = plain_security();
        let in_cluster =
            ZookeeperConnection::new(vec!["a:2181".to_string()], security.client_port(), "")
                .unwrap();
        // hosts address the Service's NodePort, CLIENT_PORT stays the
        // port the ensemble itself listens on
        let external = ZookeeperConnection::new(
            vec!["node-a:31000".to_string()],
            security.client_port(),
            "",
        )
        .unwrap();
        let maps = discovery_config_maps(
            "zk",
            "prod",
            OwnerReference::default(),
            &DiscoveredConnections {
                in_cluster,
                external: Some(external),
            },
        );
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[1].metadata.name.as_deref(), Some("zk-nodeport"));
        let data = maps[1].data.as_ref().unwrap();
        assert_eq!(data["CLIENT_PORT"], "2181");
        assert_eq!(data["HOSTS"], "node-a:31000");
        assert_eq!(data["HOST"], "node-a:31000/");
    }
}
