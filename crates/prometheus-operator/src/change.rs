//! Change detection for generated StatefulSets
//!
//! The inputs of a synthesis are serialized into an explicit, versioned
//! document and digested with SHA-256. The digest is stored on the
//! StatefulSet under [`INPUT_HASH_ANNOTATION`]; an unchanged digest means the
//! write can be skipped.

use crate::client::ClusterClient;
use crate::config::{OperatorConfig, ReloaderConfig};
use crate::error::Result;
use crate::k8sutil;
use crate::operator::INPUT_HASH_ANNOTATION;
use crate::telemetry::ControllerMetrics;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use kube::api::PropagationPolicy;
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Bumped whenever the layout of [`HashInput`] changes
const HASH_FORMAT_VERSION: u32 = 1;

/// The part of the global configuration synthesis reads
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFingerprint<'a> {
    thanos_default_base_image: &'a str,
    alertmanager_default_base_image: &'a str,
    reloader: &'a ReloaderConfig,
    labels: &'a BTreeMap<String, String>,
    annotations: &'a BTreeMap<String, String>,
    localhost: &'a str,
}

impl<'a> From<&'a OperatorConfig> for ConfigFingerprint<'a> {
    fn from(config: &'a OperatorConfig) -> Self {
        Self {
            thanos_default_base_image: &config.thanos_default_base_image,
            alertmanager_default_base_image: &config.alertmanager_default_base_image,
            reloader: &config.reloader,
            labels: &config.labels,
            annotations: &config.annotations,
            localhost: &config.localhost,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HashInput<'a, S: Serialize> {
    version: u32,
    kind: &'a str,
    spec: &'a S,
    annotations: &'a BTreeMap<String, String>,
    config: ConfigFingerprint<'a>,
    existing: Option<&'a StatefulSetSpec>,
    rule_config_maps: &'a [String],
}

/// Inputs of one StatefulSet synthesis
///
/// Labels, generation and resource version of the custom resource are left
/// out: they never affect the generated spec.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInputs<'a, S> {
    pub kind: &'a str,
    pub spec: &'a S,
    pub annotations: &'a BTreeMap<String, String>,
    pub config: &'a OperatorConfig,
    pub rule_config_maps: &'a [String],
}

impl<'a, S: Serialize> SynthesisInputs<'a, S> {
    /// Digest of the inputs together with the StatefulSet spec they are
    /// compared against.
    pub fn hash(&self, existing: Option<&StatefulSetSpec>) -> Result<String> {
        let input = HashInput {
            version: HASH_FORMAT_VERSION,
            kind: self.kind,
            spec: self.spec,
            annotations: self.annotations,
            config: ConfigFingerprint::from(self.config),
            existing,
            rule_config_maps: self.rule_config_maps,
        };
        let bytes = serde_json::to_vec(&input)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// What to do with a generated StatefulSet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Create,
    NoOp,
    Update,
    /// The update was rejected; the live object was deleted and will be
    /// created again on the next pass.
    DeleteAndRecreate,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Create => "create",
            Decision::NoOp => "noop",
            Decision::Update => "update",
            Decision::DeleteAndRecreate => "delete-and-recreate",
        };
        f.write_str(s)
    }
}

/// Hash stored on a live StatefulSet, if any.
pub fn stored_hash(sts: &StatefulSet) -> Option<&str> {
    sts.annotations()
        .get(INPUT_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Decide between create, update and no-op.
///
/// `input_hash` must have been computed against the live spec.
pub fn decide(live: Option<&StatefulSet>, input_hash: &str) -> Decision {
    match live {
        None => Decision::Create,
        Some(sts) if stored_hash(sts) == Some(input_hash) => Decision::NoOp,
        Some(_) => Decision::Update,
    }
}

/// Decide what to do with `desired` and stamp it with the hash it will carry.
///
/// The stored hash is compared with the inputs hashed against the live spec.
/// A written StatefulSet carries the inputs hashed against its own spec, so
/// the pass after a create or an update finds both equal.
pub fn plan<S: Serialize>(
    inputs: &SynthesisInputs<'_, S>,
    live: Option<&StatefulSet>,
    desired: &mut StatefulSet,
) -> Result<Decision> {
    let observed = inputs.hash(live.and_then(|sts| sts.spec.as_ref()))?;
    let decision = decide(live, &observed);
    if matches!(decision, Decision::Create | Decision::Update) {
        let hash = inputs.hash(desired.spec.as_ref())?;
        set_hash(desired, hash);
    }
    Ok(decision)
}

/// Write `desired` according to `decision`.
///
/// An update rejected as invalid (an immutable field changed) deletes the
/// live object with foreground propagation instead; the caller gets
/// [`Decision::DeleteAndRecreate`] and the next reconcile creates it again.
pub async fn apply(
    client: &dyn ClusterClient,
    metrics: &ControllerMetrics,
    desired: &StatefulSet,
    decision: Decision,
) -> Result<Decision> {
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();
    match decision {
        Decision::NoOp => {
            debug!(namespace = %namespace, name = %name, "StatefulSet is up to date");
            Ok(Decision::NoOp)
        }
        Decision::Create => {
            info!(namespace = %namespace, name = %name, "Creating StatefulSet");
            client.create_statefulset(desired).await?;
            Ok(Decision::Create)
        }
        Decision::Update | Decision::DeleteAndRecreate => {
            info!(namespace = %namespace, name = %name, "Updating StatefulSet");
            match k8sutil::update_statefulset(client, desired).await {
                Ok(_) => Ok(Decision::Update),
                Err(e) if e.is_invalid() => {
                    warn!(
                        namespace = %namespace,
                        name = %name,
                        error = %e,
                        "StatefulSet update rejected, deleting it to recreate"
                    );
                    metrics.statefulset_delete_create.increment(1);
                    client
                        .delete_statefulset(&namespace, &name, PropagationPolicy::Foreground)
                        .await?;
                    Ok(Decision::DeleteAndRecreate)
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Annotate `sts` with `hash`.
pub fn set_hash(sts: &mut StatefulSet, hash: String) {
    sts.annotations_mut()
        .insert(INPUT_HASH_ANNOTATION.to_string(), hash);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ThanosRulerSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn create_test_sts(hash: Option<&str>) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("thanos-ruler-test".to_string()),
                namespace: Some("monitoring".to_string()),
                annotations: hash.map(|h| {
                    BTreeMap::from([(INPUT_HASH_ANNOTATION.to_string(), h.to_string())])
                }),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec::default()),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_stable() {
        let spec = ThanosRulerSpec::default();
        let config = OperatorConfig::default();
        let annotations = BTreeMap::new();
        let inputs = SynthesisInputs {
            kind: "ThanosRuler",
            spec: &spec,
            annotations: &annotations,
            config: &config,
            rule_config_maps: &[],
        };
        let a = inputs.hash(None).unwrap();
        let b = inputs.hash(None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_tracks_inputs() {
        let spec = ThanosRulerSpec::default();
        let config = OperatorConfig::default();
        let annotations = BTreeMap::new();
        let cms = vec!["thanos-ruler-test-rulefiles-0".to_string()];
        let base = SynthesisInputs {
            kind: "ThanosRuler",
            spec: &spec,
            annotations: &annotations,
            config: &config,
            rule_config_maps: &[],
        };
        let with_cms = SynthesisInputs {
            rule_config_maps: &cms,
            ..base
        };
        let live = StatefulSetSpec {
            replicas: Some(2),
            ..Default::default()
        };

        let h = base.hash(None).unwrap();
        assert_ne!(h, with_cms.hash(None).unwrap());
        assert_ne!(h, base.hash(Some(&live)).unwrap());

        let mut changed = spec.clone();
        changed.common.replicas = Some(3);
        let changed_inputs = SynthesisInputs {
            spec: &changed,
            ..base
        };
        assert_ne!(h, changed_inputs.hash(None).unwrap());
    }

    #[test]
    fn test_decide() {
        assert_eq!(decide(None, "abc"), Decision::Create);
        assert_eq!(decide(Some(&create_test_sts(Some("abc"))), "abc"), Decision::NoOp);
        assert_eq!(decide(Some(&create_test_sts(Some("old"))), "abc"), Decision::Update);
        assert_eq!(decide(Some(&create_test_sts(None)), "abc"), Decision::Update);
    }

    #[test]
    fn test_written_object_is_noop_on_next_pass() {
        let config = OperatorConfig::default();
        let annotations = BTreeMap::new();
        let spec = ThanosRulerSpec::default();
        let inputs = SynthesisInputs {
            kind: "ThanosRuler",
            spec: &spec,
            annotations: &annotations,
            config: &config,
            rule_config_maps: &[],
        };

        let mut created = create_test_sts(None);
        assert_eq!(plan(&inputs, None, &mut created).unwrap(), Decision::Create);
        let mut again = create_test_sts(None);
        assert_eq!(plan(&inputs, Some(&created), &mut again).unwrap(), Decision::NoOp);

        let mut scaled = spec.clone();
        scaled.common.replicas = Some(3);
        let inputs = SynthesisInputs {
            spec: &scaled,
            ..inputs
        };
        let mut updated = create_test_sts(None);
        if let Some(sts_spec) = updated.spec.as_mut() {
            sts_spec.replicas = Some(3);
        }
        assert_eq!(plan(&inputs, Some(&created), &mut updated).unwrap(), Decision::Update);
        let mut again = updated.clone();
        assert_eq!(plan(&inputs, Some(&updated), &mut again).unwrap(), Decision::NoOp);
    }

    #[test]
    fn test_set_hash() {
        let mut sts = create_test_sts(None);
        set_hash(&mut sts, "abc".to_string());
        assert_eq!(stored_hash(&sts), Some("abc"));
    }
}
