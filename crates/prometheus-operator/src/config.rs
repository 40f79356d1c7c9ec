//! Global operator configuration
//!
//! `OperatorConfig` carries every setting that is not part of a custom
//! resource but still shapes the objects the operator produces: default
//! images, the config-reloader sidecar, labels and annotations stamped on
//! managed objects, and the rule shard size ceiling. It is built once from
//! command-line flags and shared read-only by every controller.

use crate::error::{OperatorError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use std::time::Duration;

/// Default Thanos image without tag
pub const DEFAULT_THANOS_BASE_IMAGE: &str = "quay.io/thanos/thanos";
/// Default Thanos version
pub const DEFAULT_THANOS_VERSION: &str = "v0.37.2";
/// Default Alertmanager image without tag
pub const DEFAULT_ALERTMANAGER_BASE_IMAGE: &str = "quay.io/prometheus/alertmanager";
/// Default Alertmanager version
pub const DEFAULT_ALERTMANAGER_VERSION: &str = "v0.28.0";
/// Default config-reloader image
pub const DEFAULT_RELOADER_IMAGE: &str =
    "quay.io/prometheus-operator/prometheus-config-reloader:v0.80.0";

/// Largest object the API server stores (1 MiB)
pub const MAX_OBJECT_SIZE: usize = 1024 * 1024;
/// Default ceiling for the data of one rule ConfigMap: half the object limit
pub const DEFAULT_MAX_CONFIG_MAP_DATA_SIZE: usize = MAX_OBJECT_SIZE / 2;

static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap()
});

/// Config-reloader sidecar settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReloaderConfig {
    pub image: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    /// Expose the reloader's web endpoint for liveness/readiness probes
    pub enable_probes: bool,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_RELOADER_IMAGE.to_string(),
            cpu_request: "10m".to_string(),
            cpu_limit: "10m".to_string(),
            memory_request: "50Mi".to_string(),
            memory_limit: "50Mi".to_string(),
            enable_probes: false,
        }
    }
}

/// Operator-wide settings shared by all controllers
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Thanos image used when a ThanosRuler does not set `image`
    pub thanos_default_base_image: String,
    /// Alertmanager image used when an Alertmanager does not set `image`
    pub alertmanager_default_base_image: String,
    pub reloader: ReloaderConfig,
    /// Labels added to every managed object
    pub labels: BTreeMap<String, String>,
    /// Annotations added to every managed object
    pub annotations: BTreeMap<String, String>,
    /// Address used by `listenLocal` workloads
    pub localhost: String,
    /// When set, only objects annotated with this controller ID are managed
    pub controller_id: String,
    /// Namespace to watch (`None` for cluster-wide)
    pub namespace: Option<String>,
    /// Namespaces never reconciled nor selected for rules
    pub deny_namespaces: BTreeSet<String>,
    /// Rule shard ceiling in bytes
    pub max_config_map_data_size: usize,
    /// Concurrent reconcile workers per controller
    pub workers: usize,
    /// How often resources that are not available get their status refreshed
    pub status_poll_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            thanos_default_base_image: DEFAULT_THANOS_BASE_IMAGE.to_string(),
            alertmanager_default_base_image: DEFAULT_ALERTMANAGER_BASE_IMAGE.to_string(),
            reloader: ReloaderConfig::default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            localhost: "localhost".to_string(),
            controller_id: String::new(),
            namespace: None,
            deny_namespaces: BTreeSet::new(),
            max_config_map_data_size: DEFAULT_MAX_CONFIG_MAP_DATA_SIZE,
            workers: 4,
            status_poll_interval: Duration::from_secs(60),
        }
    }
}

impl OperatorConfig {
    /// Check the configuration for values the controllers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.thanos_default_base_image.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "thanos default base image must not be empty".to_string(),
            ));
        }
        if self.alertmanager_default_base_image.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "alertmanager default base image must not be empty".to_string(),
            ));
        }
        if self.reloader.image.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "config-reloader image must not be empty".to_string(),
            ));
        }
        for (field, value) in [
            ("cpu request", &self.reloader.cpu_request),
            ("cpu limit", &self.reloader.cpu_limit),
            ("memory request", &self.reloader.memory_request),
            ("memory limit", &self.reloader.memory_limit),
        ] {
            // Empty disables the request or limit
            if !value.is_empty() && !QUANTITY_REGEX.is_match(value) {
                return Err(OperatorError::InvalidConfig(format!(
                    "config-reloader {} '{}' is not a valid quantity",
                    field, value
                )));
            }
        }
        if self.max_config_map_data_size == 0 || self.max_config_map_data_size > MAX_OBJECT_SIZE {
            return Err(OperatorError::InvalidConfig(format!(
                "max ConfigMap data size must be between 1 and {} bytes",
                MAX_OBJECT_SIZE
            )));
        }
        if self.workers == 0 {
            return Err(OperatorError::InvalidConfig(
                "at least one reconcile worker is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether objects in `namespace` are reconciled at all.
    pub fn is_namespace_allowed(&self, namespace: &str) -> bool {
        !self.deny_namespaces.contains(namespace)
    }
}

/// Parse `key=value,key2=value2` into a map (used for label and annotation flags).
pub fn parse_key_values(input: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            OperatorError::InvalidConfig(format!("'{}' is not a key=value pair", pair))
        })?;
        if key.trim().is_empty() {
            return Err(OperatorError::InvalidConfig(format!(
                "'{}' has an empty key",
                pair
            )));
        }
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_config_map_data_size, 512 * 1024);
    }

    #[test]
    fn test_rejects_zero_shard_ceiling() {
        let config = OperatorConfig {
            max_config_map_data_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_invalid_reloader_quantity() {
        let mut config = OperatorConfig::default();
        config.reloader.memory_limit = "lots".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("memory limit"));

        config.reloader.memory_limit = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config = OperatorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_denied_namespaces() {
        let mut config = OperatorConfig::default();
        config.deny_namespaces.insert("kube-system".to_string());
        assert!(!config.is_namespace_allowed("kube-system"));
        assert!(config.is_namespace_allowed("monitoring"));
    }

    #[test]
    fn test_parse_key_values() {
        let map = parse_key_values("team=infra, tier = backend,").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["tier"], "backend");

        assert!(parse_key_values("novalue").is_err());
        assert!(parse_key_values("=x").is_err());
        assert!(parse_key_values("").unwrap().is_empty());
    }
}
