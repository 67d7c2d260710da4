//! Configuration composition for ZooKeeper server role groups
//!
//! Merges role-group settings onto role-level settings onto compiled-in
//! defaults, field by field. The output is a fully populated
//! [`MergedConfig`] with no optional fields left, so downstream rendering
//! never has to re-apply defaults.

use k8s_openapi::api::core::v1::{
    Affinity, PodAffinityTerm, PodAntiAffinity, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::crd::{
    RoleGroupSpec, ServerSpec, ZookeeperConfigSpec, SECURITY_PROPERTIES_FILE_NAME,
    ZOO_CFG_FILE_NAME,
};

/// Default ZooKeeper tunables
pub const DEFAULT_MYID_OFFSET: u16 = 1;
pub const DEFAULT_INIT_LIMIT: u32 = 5;
pub const DEFAULT_SYNC_LIMIT: u32 = 2;
pub const DEFAULT_TICK_TIME: u32 = 3000;

/// Default resource envelope
pub const DEFAULT_CPU_MIN: &str = "100m";
pub const DEFAULT_CPU_MAX: &str = "200m";
pub const DEFAULT_MEMORY_LIMIT: &str = "1Gi";
pub const DEFAULT_STORAGE_CAPACITY: &str = "1Gi";

/// Default graceful shutdown window
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// Preferred anti-affinity weight for spreading members across nodes
const ANTI_AFFINITY_WEIGHT: i32 = 70;

/// JVM DNS cache settings; low TTLs so members re-resolve peers quickly
/// after pod restarts.
const DEFAULT_DNS_CACHE_TTL: (&str, &str) = ("networkaddress.cache.ttl", "5");
const DEFAULT_DNS_CACHE_NEGATIVE_TTL: (&str, &str) = ("networkaddress.cache.negative.ttl", "0");

/// Fully merged configuration for one role group
#[derive(Debug, Clone, PartialEq)]
pub struct MergedConfig {
    pub myid_offset: u16,
    pub init_limit: u32,
    pub sync_limit: u32,
    pub tick_time: u32,
    pub resources: MergedResources,
    pub affinity: Affinity,
    pub graceful_shutdown_timeout: Duration,
    /// Property-file overrides, filename -> key -> value, with defaults
    /// already seeded and role/group overrides applied on top
    pub config_overrides: BTreeMap<String, BTreeMap<String, String>>,
}

/// Merged resource envelope, every field populated
#[derive(Debug, Clone, PartialEq)]
pub struct MergedResources {
    pub cpu_min: String,
    pub cpu_max: String,
    pub memory_limit: String,
    pub storage_capacity: String,
}

impl MergedConfig {
    /// Overrides targeting `zoo.cfg`
    pub fn zoo_cfg_overrides(&self) -> BTreeMap<String, String> {
        self.config_overrides
            .get(ZOO_CFG_FILE_NAME)
            .cloned()
            .unwrap_or_default()
    }

    /// Overrides targeting `security.properties` (defaults included)
    pub fn security_properties(&self) -> BTreeMap<String, String> {
        self.config_overrides
            .get(SECURITY_PROPERTIES_FILE_NAME)
            .cloned()
            .unwrap_or_default()
    }
}

/// Compose the effective configuration for one role group.
///
/// Precedence is group > role > default, decided per field: a role group
/// that sets only `resources.cpu` still inherits the role's memory limit
/// and the default tick time.
pub fn compose(cluster_name: &str, role: &ServerSpec, group: &RoleGroupSpec) -> MergedConfig {
    let role_cfg = role.config.as_ref();
    let group_cfg = group.config.as_ref();

    let myid_offset = pick(group_cfg, role_cfg, |c| c.myid_offset).unwrap_or(DEFAULT_MYID_OFFSET);
    let init_limit = pick(group_cfg, role_cfg, |c| c.init_limit).unwrap_or(DEFAULT_INIT_LIMIT);
    let sync_limit = pick(group_cfg, role_cfg, |c| c.sync_limit).unwrap_or(DEFAULT_SYNC_LIMIT);
    let tick_time = pick(group_cfg, role_cfg, |c| c.tick_time).unwrap_or(DEFAULT_TICK_TIME);

    let resources = MergedResources {
        cpu_min: pick(group_cfg, role_cfg, |c| {
            c.resources.as_ref()?.cpu.as_ref()?.min.clone()
        })
        .unwrap_or_else(|| DEFAULT_CPU_MIN.to_string()),
        cpu_max: pick(group_cfg, role_cfg, |c| {
            c.resources.as_ref()?.cpu.as_ref()?.max.clone()
        })
        .unwrap_or_else(|| DEFAULT_CPU_MAX.to_string()),
        memory_limit: pick(group_cfg, role_cfg, |c| {
            c.resources.as_ref()?.memory.as_ref()?.limit.clone()
        })
        .unwrap_or_else(|| DEFAULT_MEMORY_LIMIT.to_string()),
        storage_capacity: pick(group_cfg, role_cfg, |c| {
            c.resources.as_ref()?.storage.as_ref()?.capacity.clone()
        })
        .unwrap_or_else(|| DEFAULT_STORAGE_CAPACITY.to_string()),
    };

    let affinity = pick(group_cfg, role_cfg, |c| c.affinity.clone())
        .unwrap_or_else(|| default_affinity(cluster_name));

    let graceful_shutdown_timeout =
        pick(group_cfg, role_cfg, |c| c.graceful_shutdown_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT);

    let mut config_overrides = default_overrides();
    merge_overrides(&mut config_overrides, &role.config_overrides);
    merge_overrides(&mut config_overrides, &group.config_overrides);

    MergedConfig {
        myid_offset,
        init_limit,
        sync_limit,
        tick_time,
        resources,
        affinity,
        graceful_shutdown_timeout,
        config_overrides,
    }
}

/// First non-None of group value, role value
fn pick<T>(
    group: Option<&ZookeeperConfigSpec>,
    role: Option<&ZookeeperConfigSpec>,
    f: impl Fn(&ZookeeperConfigSpec) -> Option<T>,
) -> Option<T> {
    group.and_then(&f).or_else(|| role.and_then(&f))
}

fn default_overrides() -> BTreeMap<String, BTreeMap<String, String>> {
    let mut security = BTreeMap::new();
    security.insert(
        DEFAULT_DNS_CACHE_TTL.0.to_string(),
        DEFAULT_DNS_CACHE_TTL.1.to_string(),
    );
    security.insert(
        DEFAULT_DNS_CACHE_NEGATIVE_TTL.0.to_string(),
        DEFAULT_DNS_CACHE_NEGATIVE_TTL.1.to_string(),
    );

    let mut overrides = BTreeMap::new();
    overrides.insert(SECURITY_PROPERTIES_FILE_NAME.to_string(), security);
    overrides
}

fn merge_overrides(
    target: &mut BTreeMap<String, BTreeMap<String, String>>,
    source: &BTreeMap<String, BTreeMap<String, String>>,
) {
    for (file, props) in source {
        let entry = target.entry(file.clone()).or_default();
        for (key, value) in props {
            entry.insert(key.clone(), value.clone());
        }
    }
}

/// Soft anti-affinity spreading members of the same cluster's server role
/// across nodes.
fn default_affinity(cluster_name: &str) -> Affinity {
    let mut match_labels = BTreeMap::new();
    match_labels.insert("app.kubernetes.io/name".to_string(), "zookeeper".to_string());
    match_labels.insert(
        "app.kubernetes.io/instance".to_string(),
        cluster_name.to_string(),
    );
    match_labels.insert(
        "app.kubernetes.io/component".to_string(),
        crate::crd::SERVER_ROLE.to_string(),
    );

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: ANTI_AFFINITY_WEIGHT,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(match_labels),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CpuLimits, MemoryLimits, ResourcesSpec};

    fn role_with_config(config: ZookeeperConfigSpec) -> ServerSpec {
        ServerSpec {
            config: Some(config),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let merged = compose("zk", &ServerSpec::default(), &RoleGroupSpec::default());
        assert_eq!(merged.myid_offset, 1);
        assert_eq!(merged.init_limit, 5);
        assert_eq!(merged.sync_limit, 2);
        assert_eq!(merged.tick_time, 3000);
        assert_eq!(merged.resources.cpu_min, "100m");
        assert_eq!(merged.resources.memory_limit, "1Gi");
        assert_eq!(merged.graceful_shutdown_timeout, Duration::from_secs(120));
        assert!(merged.affinity.pod_anti_affinity.is_some());
    }

    #[test]
    fn test_group_overrides_role() {
        let role = role_with_config(ZookeeperConfigSpec {
            tick_time: Some(2000),
            init_limit: Some(10),
            ..Default::default()
        });
        let group = RoleGroupSpec {
            config: Some(ZookeeperConfigSpec {
                tick_time: Some(4000),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = compose("zk", &role, &group);
        assert_eq!(merged.tick_time, 4000);
        // untouched by the group, inherited from the role
        assert_eq!(merged.init_limit, 10);
        assert_eq!(merged.sync_limit, 2);
    }

    #[test]
    fn test_partial_resources_do_not_blank_inherited_fields() {
        let role = role_with_config(ZookeeperConfigSpec {
            resources: Some(ResourcesSpec {
                memory: Some(MemoryLimits {
                    limit: Some("2Gi".to_string()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        let group = RoleGroupSpec {
            config: Some(ZookeeperConfigSpec {
                resources: Some(ResourcesSpec {
                    cpu: Some(CpuLimits {
                        min: Some("500m".to_string()),
                        max: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = compose("zk", &role, &group);
        assert_eq!(merged.resources.cpu_min, "500m");
        assert_eq!(merged.resources.memory_limit, "2Gi");
        assert_eq!(merged.resources.cpu_max, "200m");
    }

    #[test]
    fn test_security_properties_defaults_present() {
        let merged = compose("zk", &ServerSpec::default(), &RoleGroupSpec::default());
        let props = merged.security_properties();
        assert_eq!(props["networkaddress.cache.ttl"], "5");
        assert_eq!(props["networkaddress.cache.negative.ttl"], "0");
    }

    #[test]
    fn test_override_maps_merge_key_by_key() {
        let mut role_overrides = BTreeMap::new();
        let mut zoo = BTreeMap::new();
        zoo.insert("prop.a".to_string(), "role".to_string());
        zoo.insert("prop.b".to_string(), "role".to_string());
        role_overrides.insert(ZOO_CFG_FILE_NAME.to_string(), zoo);

        let mut group_overrides = BTreeMap::new();
        let mut zoo = BTreeMap::new();
        zoo.insert("prop.b".to_string(), "group".to_string());
        group_overrides.insert(ZOO_CFG_FILE_NAME.to_string(), zoo);

        let role = ServerSpec {
            config_overrides: role_overrides,
            ..Default::default()
        };
        let group = RoleGroupSpec {
            config_overrides: group_overrides,
            ..Default::default()
        };

        let merged = compose("zk", &role, &group);
        let zoo = merged.zoo_cfg_overrides();
        assert_eq!(zoo["prop.a"], "role");
        assert_eq!(zoo["prop.b"], "group");
    }

    #[test]
    fn test_user_can_override_security_property_defaults() {
        let mut group_overrides = BTreeMap::new();
        let mut security = BTreeMap::new();
        security.insert("networkaddress.cache.ttl".to_string(), "30".to_string());
        group_overrides.insert(SECURITY_PROPERTIES_FILE_NAME.to_string(), security);

        let group = RoleGroupSpec {
            config_overrides: group_overrides,
            ..Default::default()
        };
        let merged = compose("zk", &ServerSpec::default(), &group);
        assert_eq!(merged.security_properties()["networkaddress.cache.ttl"], "30");
    }
}
