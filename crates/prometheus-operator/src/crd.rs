//! Custom Resource Definitions for the Prometheus operator
//!
//! This module defines the `ThanosRuler`, `Alertmanager` and `PrometheusRule`
//! CRDs of the `monitoring.coreos.com/v1` API group, the embedded types they
//! share, and the [`Workload`] trait through which the shared reconciliation
//! library treats every StatefulSet-backed kind the same way.

use crate::cache::ObjectKey;
use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, EphemeralVolumeSource, LocalObjectReference,
    PersistentVolumeClaimSpec, PodSecurityContext, ResourceRequirements, SecretKeySelector,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, CustomResourceExt, Resource};
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of all resources managed by the operator
pub const GROUP: &str = "monitoring.coreos.com";
/// Plural resource name of `PrometheusRule`
pub const PROMETHEUS_RULES_RESOURCE: &str = "prometheusrules";

/// Prometheus-style duration, e.g. `30s`, `1h30m`, `2d`
static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([0-9]+)y)?(([0-9]+)w)?(([0-9]+)d)?(([0-9]+)h)?(([0-9]+)m)?(([0-9]+)s)?(([0-9]+)ms)?$")
        .unwrap()
});

/// Check a Prometheus duration string.
pub fn is_valid_duration(value: &str) -> bool {
    !value.is_empty() && DURATION_REGEX.is_match(value)
}

fn validate_duration(value: &str) -> Result<(), ValidationError> {
    if is_valid_duration(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_duration").with_message(
            format!("'{}' is not a valid duration (e.g., 30s, 1h)", value).into(),
        ))
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level {
        "" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")
            .with_message("logLevel must be one of debug, info, warn, error".into())),
    }
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "" | "logfmt" | "json" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_format")
            .with_message("logFormat must be logfmt or json".into())),
    }
}

fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("imagePullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Metadata that is copied onto generated objects
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedObjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// PersistentVolumeClaim template embedded in a storage spec
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedPersistentVolumeClaim {
    #[serde(default)]
    pub metadata: EmbeddedObjectMetadata,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

/// Storage for the workload's data directory
///
/// At most one source is used: `emptyDir` wins over `ephemeral`, which wins
/// over `volumeClaimTemplate`. Without any, an empty dir is used.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<EmbeddedPersistentVolumeClaim>,
}

/// An extra command-line argument for the main container
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Argument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Reference to objects exempted from namespace label enforcement
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedRuleReference {
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_rules_resource")]
    pub resource: String,
    pub namespace: String,
    /// Empty or absent exempts every object in the namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_group() -> String {
    GROUP.to_string()
}

fn default_rules_resource() -> String {
    PROMETHEUS_RULES_RESOURCE.to_string()
}

/// Fields shared by every StatefulSet-backed kind
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CommonSpec {
    /// Version of the workload; used for the default image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    pub version: Option<String>,

    /// Container image (overrides the version-based default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// When true, the operator leaves the workload untouched
    #[serde(default)]
    pub paused: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, max = 1000, message = "replicas must be between 0 and 1000"))]
    pub replicas: Option<i32>,

    /// Labels and annotations for the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<EmbeddedObjectMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Containers merged by name into the generated ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Extra mounts for the main container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, message = "terminationGracePeriodSeconds must not be negative"))]
    pub termination_grace_period_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_log_format"))]
    pub log_format: Option<String>,

    /// Bind the web endpoint to localhost only
    #[serde(default)]
    pub listen_local: bool,

    /// Arguments appended to the generated ones; may not override them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_args: Vec<Argument>,
}

/// Status shared by every StatefulSet-backed kind
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Mirrors `spec.paused`
    #[serde(default)]
    pub paused: bool,
    /// Number of pods targeted by the workload
    #[serde(default)]
    pub replicas: i32,
    /// Ready pods running the current pod template
    #[serde(default)]
    pub updated_replicas: i32,
    /// Ready pods
    #[serde(default)]
    pub available_replicas: i32,
    /// Pods that are not ready
    #[serde(default)]
    pub unavailable_replicas: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WorkloadStatus {
    /// Find a condition by type
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// Enough pods are ready
    Available,
    /// The last reconciliation succeeded
    Reconciled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
    /// Partially available
    Degraded,
}

/// A typed status condition
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    /// RFC 3339 time of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Generation the condition was computed for; stale when behind the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// ThanosRuler custom resource definition
///
/// Runs Thanos in rule mode, evaluating the recording and alerting rules of
/// every selected `PrometheusRule` against the configured query endpoints.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ThanosRuler",
    plural = "thanosrulers",
    shortname = "ruler",
    namespaced,
    status = "WorkloadStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Paused", "type":"boolean", "jsonPath":".status.paused"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ThanosRulerSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub common: CommonSpec,

    /// Thanos Query endpoints to evaluate rules against
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_endpoints: Vec<String>,

    /// Secret key holding a Thanos query configuration; overrides `queryEndpoints`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_config: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alertmanagers_url: Vec<String>,

    /// Secret key holding an Alertmanager configuration; overrides `alertmanagersUrl`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alertmanagers_config: Option<SecretKeySelector>,

    /// External labels attached to every produced series and alert
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Labels dropped from alerts before they are sent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alert_drop_labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_query_url: Option<String>,

    #[serde(default = "default_evaluation_interval")]
    #[validate(custom(function = "validate_duration"))]
    pub evaluation_interval: String,

    #[serde(default = "default_ruler_retention")]
    #[validate(custom(function = "validate_duration"))]
    pub retention: String,

    /// Selects PrometheusRule objects; absent selects nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_selector: Option<LabelSelector>,

    /// Namespaces to select rules from; absent means the object's own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_namespace_selector: Option<LabelSelector>,

    /// Label forced to the rule's namespace on every selected rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforced_namespace_label: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_from_enforcement: Vec<ExcludedRuleReference>,

    /// Deprecated: use `excludedFromEnforcement`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prometheus_rules_excluded_from_enforce: Vec<ExcludedRuleReference>,
}

fn default_evaluation_interval() -> String {
    "15s".to_string()
}

fn default_ruler_retention() -> String {
    "24h".to_string()
}

impl Default for ThanosRulerSpec {
    fn default() -> Self {
        Self {
            common: CommonSpec::default(),
            query_endpoints: Vec::new(),
            query_config: None,
            alertmanagers_url: Vec::new(),
            alertmanagers_config: None,
            labels: BTreeMap::new(),
            alert_drop_labels: Vec::new(),
            external_prefix: None,
            route_prefix: None,
            alert_query_url: None,
            evaluation_interval: default_evaluation_interval(),
            retention: default_ruler_retention(),
            rule_selector: None,
            rule_namespace_selector: None,
            enforced_namespace_label: None,
            excluded_from_enforcement: Vec::new(),
            prometheus_rules_excluded_from_enforce: Vec::new(),
        }
    }
}

impl ThanosRulerSpec {
    /// Exemptions from namespace enforcement, current list first.
    ///
    /// The deprecated list is concatenated as-is; duplicates are kept.
    pub fn enforcement_exclusions(&self) -> Vec<ExcludedRuleReference> {
        self.excluded_from_enforcement
            .iter()
            .chain(self.prometheus_rules_excluded_from_enforce.iter())
            .cloned()
            .collect()
    }
}

/// Alertmanager custom resource definition
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "Alertmanager",
    plural = "alertmanagers",
    shortname = "am",
    namespaced,
    status = "WorkloadStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub common: CommonSpec,

    /// How long to retain silences and notification logs
    #[serde(default = "default_alertmanager_retention")]
    #[validate(custom(function = "validate_duration"))]
    pub retention: String,

    /// Secret holding `alertmanager.yaml`; defaults to `alertmanager-<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,

    /// Peers outside this Alertmanager cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_peers: Vec<String>,

    /// Label isolating this cluster's gossip traffic (Alertmanager >= 0.26)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_label: Option<String>,
}

fn default_alertmanager_retention() -> String {
    "120h".to_string()
}

impl Default for AlertmanagerSpec {
    fn default() -> Self {
        Self {
            common: CommonSpec::default(),
            retention: default_alertmanager_retention(),
            config_secret: None,
            external_url: None,
            route_prefix: None,
            additional_peers: Vec::new(),
            cluster_label: None,
        }
    }
}

/// PrometheusRule custom resource definition
///
/// The spec serializes directly into a rule file, so field names follow the
/// rule file format rather than camelCase.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PrometheusRule",
    plural = "prometheusrules",
    shortname = "promrule",
    namespaced
)]
pub struct PrometheusRuleSpec {
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

/// A named group of rules evaluated together
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct RuleGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_offset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i32>,
    /// Thanos only: `warn` or `abort`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_response_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A recording or alerting rule
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub expr: String,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_firing_for: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A custom resource reconciled into a StatefulSet
///
/// The StatefulSet of an object `ns/name` is always `ns/<prefix>-name`; the
/// mapping in both directions lives in [`statefulset_key`] and
/// [`owner_key_for_statefulset`].
pub trait Workload:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind as it appears in owner references
    const KIND: &'static str;
    /// Prefix of the generated StatefulSet name
    const STATEFULSET_PREFIX: &'static str;

    fn common(&self) -> &CommonSpec;
    fn workload_status(&self) -> Option<&WorkloadStatus>;

    fn is_paused(&self) -> bool {
        self.common().paused
    }

    /// Desired replica count, defaulting to 1
    fn desired_replicas(&self) -> i32 {
        self.common().replicas.unwrap_or(1)
    }
}

impl Workload for ThanosRuler {
    const KIND: &'static str = "ThanosRuler";
    const STATEFULSET_PREFIX: &'static str = "thanos-ruler";

    fn common(&self) -> &CommonSpec {
        &self.spec.common
    }

    fn workload_status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }
}

impl Workload for Alertmanager {
    const KIND: &'static str = "Alertmanager";
    const STATEFULSET_PREFIX: &'static str = "alertmanager";

    fn common(&self) -> &CommonSpec {
        &self.spec.common
    }

    fn workload_status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }
}

/// Name of the StatefulSet generated for the object `name`.
pub fn statefulset_name<W: Workload>(name: &str) -> String {
    format!("{}-{}", W::STATEFULSET_PREFIX, name)
}

/// Key of the StatefulSet generated for the object with `key`.
pub fn statefulset_key<W: Workload>(key: &ObjectKey) -> ObjectKey {
    ObjectKey::new(&key.namespace, statefulset_name::<W>(&key.name))
}

/// Inverse of [`statefulset_key`]; `None` when the name lacks the prefix.
pub fn owner_key_for_statefulset<W: Workload>(key: &ObjectKey) -> Option<ObjectKey> {
    key.name
        .strip_prefix(W::STATEFULSET_PREFIX)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|name| !name.is_empty())
        .map(|name| ObjectKey::new(&key.namespace, name))
}

/// All CRDs served by the operator
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ThanosRuler::crd(),
        Alertmanager::crd(),
        PrometheusRule::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_validation() {
        for valid in ["30s", "1h30m", "2d", "500ms", "1y2w"] {
            assert!(is_valid_duration(valid), "{} should be valid", valid);
        }
        for invalid in ["", "30", "1hour", "-5m", "1.5h"] {
            assert!(!is_valid_duration(invalid), "{} should be invalid", invalid);
        }
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: ThanosRulerSpec = serde_json::from_value(serde_json::json!({
            "queryEndpoints": ["dnssrv+_http._tcp.thanos-query"],
            "replicas": 2
        }))
        .unwrap();
        assert_eq!(spec.evaluation_interval, "15s");
        assert_eq!(spec.retention, "24h");
        assert_eq!(spec.common.replicas, Some(2));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut spec = ThanosRulerSpec::default();
        spec.common.log_level = Some("verbose".to_string());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_invalid_retention_rejected() {
        let spec = AlertmanagerSpec {
            retention: "forever".to_string(),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_rule_serializes_in_rule_file_format() {
        let group = RuleGroup {
            name: "example".to_string(),
            partial_response_strategy: Some("warn".to_string()),
            rules: vec![Rule {
                alert: Some("HighLatency".to_string()),
                expr: "latency > 1".to_string(),
                for_: Some("5m".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&group).unwrap();
        assert!(yaml.contains("partial_response_strategy: warn"));
        assert!(yaml.contains("for: 5m"));
        assert!(!yaml.contains("record"));
    }

    #[test]
    fn test_statefulset_naming_round_trip() {
        let key = ObjectKey::new("monitoring", "main");
        let sts = statefulset_key::<ThanosRuler>(&key);
        assert_eq!(sts.name, "thanos-ruler-main");
        assert_eq!(owner_key_for_statefulset::<ThanosRuler>(&sts), Some(key.clone()));

        let am = statefulset_key::<Alertmanager>(&key);
        assert_eq!(am.name, "alertmanager-main");
        assert_eq!(owner_key_for_statefulset::<Alertmanager>(&am), Some(key));
    }

    #[test]
    fn test_unrelated_statefulset_has_no_owner() {
        let key = ObjectKey::new("monitoring", "thanos-rulerx");
        assert_eq!(owner_key_for_statefulset::<ThanosRuler>(&key), None);
        let key = ObjectKey::new("monitoring", "thanos-ruler-");
        assert_eq!(owner_key_for_statefulset::<ThanosRuler>(&key), None);
    }

    #[test]
    fn test_enforcement_exclusions_keep_duplicates() {
        let reference = ExcludedRuleReference {
            group: GROUP.to_string(),
            resource: PROMETHEUS_RULES_RESOURCE.to_string(),
            namespace: "team-a".to_string(),
            name: None,
        };
        let spec = ThanosRulerSpec {
            excluded_from_enforcement: vec![reference.clone()],
            prometheus_rules_excluded_from_enforce: vec![reference],
            ..Default::default()
        };
        assert_eq!(spec.enforcement_exclusions().len(), 2);
    }

    #[test]
    fn test_crds_generate() {
        let crds = all_crds();
        assert_eq!(crds.len(), 3);
        assert_eq!(
            crds[0].metadata.name.as_deref(),
            Some("thanosrulers.monitoring.coreos.com")
        );
    }
}
