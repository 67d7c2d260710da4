//! Ensemble membership and configuration file rendering
//!
//! Computes the stable member list of a role group (identities, pod FQDNs,
//! quorum ports) and renders `zoo.cfg` / `security.properties` as sorted
//! `key=value` property files. Rendering is deterministic: identical
//! logical input produces byte-identical output, so ConfigMap updates only
//! happen on real changes.

use std::collections::BTreeMap;

use crate::config::MergedConfig;
use crate::crd::{ADMIN_PORT, ELECTION_PORT, LEADER_PORT, SERVER_ROLE};
use crate::security::ZookeeperSecurity;

/// Data directory inside server pods
pub const DATA_DIR: &str = "/quorumops/data";

/// Port the bundled Prometheus metrics provider listens on
const METRICS_PROVIDER_PORT: u16 = 7000;

/// One ZooKeeper ensemble member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsembleMember {
    /// ZooKeeper server identity (`myid`), always >= 1
    pub myid: u16,
    /// Stable in-cluster DNS name of the member pod
    pub fqdn: String,
    pub leader_port: u16,
    pub election_port: u16,
}

impl EnsembleMember {
    /// The `server.<myid>` directive value for `zoo.cfg`
    fn membership_value(&self, client_port: u16) -> String {
        format!(
            "{}:{}:{};{}",
            self.fqdn, self.leader_port, self.election_port, client_port
        )
    }
}

/// Name of the headless Service (and StatefulSet) for one role group
pub fn role_group_name(cluster_name: &str, group_name: &str) -> String {
    format!("{cluster_name}-{SERVER_ROLE}-{group_name}")
}

/// DNS name of one pod behind a role group's headless Service
pub fn pod_fqdn(cluster_name: &str, group_name: &str, namespace: &str, ordinal: u16) -> String {
    let svc = role_group_name(cluster_name, group_name);
    format!("{svc}-{ordinal}.{svc}.{namespace}.svc.cluster.local")
}

/// Compute the member list for one role group.
///
/// Member `i` gets identity `i + myid_offset`, so identities cover exactly
/// `[offset, offset + replicas)` with no gaps or duplicates. Sums beyond
/// `u16::MAX` clamp to the ceiling instead of wrapping.
pub fn members(
    cluster_name: &str,
    group_name: &str,
    namespace: &str,
    replicas: u16,
    myid_offset: u16,
) -> Vec<EnsembleMember> {
    (0..replicas)
        .map(|i| EnsembleMember {
            myid: i.saturating_add(myid_offset),
            fqdn: pod_fqdn(cluster_name, group_name, namespace, i),
            leader_port: LEADER_PORT,
            election_port: ELECTION_PORT,
        })
        .collect()
}

/// Render `zoo.cfg` for one role group.
///
/// Later layers win: base defaults, then membership directives, then
/// security settings, then user overrides.
pub fn render_zoo_cfg(
    members: &[EnsembleMember],
    merged: &MergedConfig,
    security: &ZookeeperSecurity,
) -> String {
    let mut props: BTreeMap<String, String> = BTreeMap::new();

    props.insert("dataDir".to_string(), DATA_DIR.to_string());
    props.insert("initLimit".to_string(), merged.init_limit.to_string());
    props.insert("syncLimit".to_string(), merged.sync_limit.to_string());
    props.insert("tickTime".to_string(), merged.tick_time.to_string());
    props.insert("admin.serverPort".to_string(), ADMIN_PORT.to_string());
    props.insert(
        "4lw.commands.whitelist".to_string(),
        "srvr, mntr, conf, ruok".to_string(),
    );
    props.insert(
        "metricsProvider.className".to_string(),
        "org.apache.zookeeper.metrics.prometheus.PrometheusMetricsProvider".to_string(),
    );
    props.insert(
        "metricsProvider.httpPort".to_string(),
        METRICS_PROVIDER_PORT.to_string(),
    );

    // A single server runs standalone; membership directives would make it
    // wait for quorum peers that never come.
    if members.len() > 1 {
        for member in members {
            props.insert(
                format!("server.{}", member.myid),
                member.membership_value(security.client_port()),
            );
        }
    }

    props.extend(security.config_settings());
    props.extend(merged.zoo_cfg_overrides());

    to_property_file(&props)
}

/// Render `security.properties` from the composed override map
pub fn render_security_properties(merged: &MergedConfig) -> String {
    to_property_file(&merged.security_properties())
}

/// Serialize properties as sorted `key=value` lines
fn to_property_file(props: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in props {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compose;
    use crate::crd::{RoleGroupSpec, ServerSpec};

    fn default_merged() -> MergedConfig {
        compose("zk", &ServerSpec::default(), &RoleGroupSpec::default())
    }

    fn plain_security() -> ZookeeperSecurity {
        ZookeeperSecurity::new(None, &[]).unwrap()
    }

    #[test]
    fn test_members_identities_are_contiguous_from_offset() {
        let members = members("zk", "default", "prod", 3, 10);
        assert_eq!(members.len(), 3);
        let ids: Vec<u16> = members.iter().map(|m| m.myid).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert_eq!(
            members[0].fqdn,
            "zk-server-default-0.zk-server-default.prod.svc.cluster.local"
        );
    }

    #[test]
    fn test_members_with_offset_near_identity_ceiling() {
        // identities saturate instead of wrapping or panicking
        let members = members("zk", "default", "prod", 3, u16::MAX - 1);
        assert_eq!(members.len(), 3);
        let ids: Vec<u16> = members.iter().map(|m| m.myid).collect();
        assert_eq!(ids, vec![u16::MAX - 1, u16::MAX, u16::MAX]);
    }

    #[test]
    fn test_membership_lines_present_for_replicated_group() {
        let members = members("zk", "default", "prod", 3, 1);
        let cfg = render_zoo_cfg(&members, &default_merged(), &plain_security());
        assert!(cfg.contains(
            "server.1=zk-server-default-0.zk-server-default.prod.svc.cluster.local:2888:3888;2181\n"
        ));
        assert!(cfg.contains("server.3="));
    }

    #[test]
    fn test_standalone_server_has_no_membership_lines() {
        let members = members("zk", "default", "prod", 1, 1);
        let cfg = render_zoo_cfg(&members, &default_merged(), &plain_security());
        assert!(!cfg.contains("server."));
        assert!(cfg.contains("clientPort=2181\n"));
    }

    #[test]
    fn test_overrides_win_over_defaults_and_security() {
        let mut role = ServerSpec::default();
        let mut zoo = std::collections::BTreeMap::new();
        zoo.insert("tickTime".to_string(), "9999".to_string());
        zoo.insert("clientPort".to_string(), "9181".to_string());
        role.config_overrides
            .insert(crate::crd::ZOO_CFG_FILE_NAME.to_string(), zoo);

        let merged = compose("zk", &role, &RoleGroupSpec::default());
        let members = members("zk", "default", "prod", 1, 1);
        let cfg = render_zoo_cfg(&members, &merged, &plain_security());
        assert!(cfg.contains("tickTime=9999\n"));
        assert!(cfg.contains("clientPort=9181\n"));
    }

    #[test]
    fn test_rendering_is_byte_stable() {
        let members = members("zk", "default", "prod", 3, 1);
        let merged = default_merged();
        let security = plain_security();
        let first = render_zoo_cfg(&members, &merged, &security);
        let second = render_zoo_cfg(&members, &merged, &security);
        assert_eq!(first, second);
    }

    #[test]
    fn test_property_file_is_sorted() {
        let cfg = render_zoo_cfg(
            &members("zk", "default", "prod", 1, 1),
            &default_merged(),
            &plain_security(),
        );
        let keys: Vec<&str> = cfg
            .lines()
            .map(|l| l.split('=').next().unwrap())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_security_properties_render() {
        let out = render_security_properties(&default_merged());
        assert_eq!(
            out,
            "networkaddress.cache.negative.ttl=0\nnetworkaddress.cache.ttl=5\n"
        );
    }
}
