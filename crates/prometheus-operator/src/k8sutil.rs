//! Object-level helpers shared by the controllers
//!
//! Metadata merging before updates, container merge-patching, storage volume
//! selection, and create-or-update of governing services.

use crate::client::ClusterClient;
use crate::crd::{StorageSpec, Workload};
use crate::error::{OperatorError, Result};
use crate::selector::SelectorCriteria;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PersistentVolumeClaim, Service, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Prefix of annotations written by `kubectl`
pub const KUBECTL_ANNOTATION_PREFIX: &str = "kubectl.kubernetes.io/";

/// Attempts made by [`retry_on_conflict`]
const CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

/// Whether the object is being deleted.
pub fn deletion_in_progress(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Controller owner reference pointing at `owner`.
pub fn owner_reference<W: Workload>(owner: &W) -> Result<OwnerReference> {
    let meta = owner.meta();
    let (Some(name), Some(uid)) = (meta.name.clone(), meta.uid.clone()) else {
        return Err(OperatorError::InvalidConfig(format!(
            "{} is missing a name or uid",
            W::KIND
        )));
    };
    Ok(OwnerReference {
        api_version: W::api_version(&()).to_string(),
        kind: W::KIND.to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Name of the object owning `meta` through a controller reference of `kind`.
pub fn controller_owner_name<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a str> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == kind)
        .map(|r| r.name.as_str())
}

/// Drop `kubectl.kubernetes.io/` annotations.
pub fn strip_kubectl_annotations(annotations: &mut BTreeMap<String, String>) {
    annotations.retain(|k, _| !k.starts_with(KUBECTL_ANNOTATION_PREFIX));
}

/// Merge the live object's metadata into the desired metadata.
///
/// Labels and annotations of both are kept, the desired value winning on a
/// shared key. The live `resourceVersion` is carried over so the update is
/// checked against the version it was computed from.
pub fn merge_metadata(desired: &mut ObjectMeta, live: &ObjectMeta) {
    desired.resource_version = live.resource_version.clone();
    desired.labels = Some(merge_maps(desired.labels.take(), live.labels.as_ref()));
    desired.annotations = Some(merge_maps(
        desired.annotations.take(),
        live.annotations.as_ref(),
    ));
}

fn merge_maps(
    desired: Option<BTreeMap<String, String>>,
    live: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = live.cloned().unwrap_or_default();
    merged.extend(desired.unwrap_or_default());
    merged
}

/// Copy `kubectl` annotations of the live pod template onto the desired one,
/// so that e.g. `kubectl rollout restart` is not reverted.
pub fn propagate_kubectl_annotations(live: &ObjectMeta, desired: &mut ObjectMeta) {
    let Some(live) = &live.annotations else {
        return;
    };
    let annotations = desired.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in live {
        if k.starts_with(KUBECTL_ANNOTATION_PREFIX) {
            annotations.insert(k.clone(), v.clone());
        }
    }
}

/// Add the owner references of `desired` missing from `live`.
pub fn merge_owner_references(
    live: &[OwnerReference],
    desired: &[OwnerReference],
) -> Vec<OwnerReference> {
    let mut merged = live.to_vec();
    for reference in desired {
        if !merged.contains(reference) {
            merged.push(reference.clone());
        }
    }
    merged
}

/// Merge user containers into generated ones by name.
///
/// A user container named like a generated one is merged into it field by
/// field; other user containers are appended in their original order.
pub fn merge_patch_containers(base: Vec<Container>, patches: &[Container]) -> Result<Vec<Container>> {
    let mut pending: Vec<&Container> = patches.iter().collect();
    let mut out = Vec::with_capacity(base.len() + patches.len());

    for container in base {
        match pending.iter().position(|p| p.name == container.name) {
            Some(i) => {
                let patch = pending.remove(i);
                let mut merged = serde_json::to_value(&container)?;
                merge_json(&mut merged, serde_json::to_value(patch)?);
                let merged: Container = serde_json::from_value(merged).map_err(|e| {
                    OperatorError::InvalidConfig(format!(
                        "failed to merge container {}: {}",
                        container.name, e
                    ))
                })?;
                out.push(merged);
            }
            None => out.push(container),
        }
    }
    out.extend(pending.into_iter().cloned());
    Ok(out)
}

/// JSON merge where lists of named objects merge element-wise by `name`.
fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(&key);
                    continue;
                }
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(patch)) if is_named_list(base) && is_named_list(&patch) => {
            for item in patch {
                let name = item.get("name").cloned();
                match base.iter_mut().find(|b| b.get("name") == name.as_ref()) {
                    Some(existing) => merge_json(existing, item),
                    None => base.push(item),
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|v| v.get("name").is_some_and(Value::is_string))
}

/// Where the data directory of a workload lives
#[derive(Debug, Clone, PartialEq)]
pub enum DataVolume {
    /// A volume in the pod spec
    Pod(Volume),
    /// A claim template of the StatefulSet
    ClaimTemplate(PersistentVolumeClaim),
}

impl DataVolume {
    pub fn name(&self) -> &str {
        match self {
            DataVolume::Pod(volume) => &volume.name,
            DataVolume::ClaimTemplate(pvc) => pvc.metadata.name.as_deref().unwrap_or_default(),
        }
    }
}

/// Pick the data volume: `emptyDir`, then `ephemeral`, then a claim
/// template; an empty dir when no storage is configured.
pub fn data_volume(storage: Option<&StorageSpec>, default_name: &str) -> DataVolume {
    let empty_dir = || {
        DataVolume::Pod(Volume {
            name: default_name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        })
    };
    let Some(storage) = storage else {
        return empty_dir();
    };

    if let Some(source) = &storage.empty_dir {
        return DataVolume::Pod(Volume {
            name: default_name.to_string(),
            empty_dir: Some(source.clone()),
            ..Default::default()
        });
    }
    if let Some(source) = &storage.ephemeral {
        return DataVolume::Pod(Volume {
            name: default_name.to_string(),
            ephemeral: Some(source.clone()),
            ..Default::default()
        });
    }
    let Some(template) = &storage.volume_claim_template else {
        return empty_dir();
    };

    let name = template
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_name.to_string());
    let mut spec = template.spec.clone();
    if spec.access_modes.as_ref().map_or(true, Vec::is_empty) {
        spec.access_modes = Some(vec!["ReadWriteOnce".to_string()]);
    }
    DataVolume::ClaimTemplate(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name),
            labels: (!template.metadata.labels.is_empty()).then(|| template.metadata.labels.clone()),
            annotations: (!template.metadata.annotations.is_empty())
                .then(|| template.metadata.annotations.clone()),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Whether `obj` belongs to the operator instance with `controller_id`.
///
/// With an empty ID, only objects without the annotation are managed.
pub fn is_managed_by_controller<K: Resource>(obj: &K, controller_id: &str) -> bool {
    let annotated = obj
        .annotations()
        .get(crate::operator::CONTROLLER_ID_ANNOTATION)
        .map(String::as_str)
        .unwrap_or_default();
    annotated == controller_id
}

/// Whether `selector` selects a different answer for the old and new labels.
pub fn label_selection_has_changed(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
    selector: &SelectorCriteria,
) -> bool {
    if old == new || matches!(selector, SelectorCriteria::Everything | SelectorCriteria::Nothing) {
        return false;
    }
    selector.matches(old) != selector.matches(new)
}

/// Render match labels as an equality-based selector string, `k=v,k2=v2`.
pub fn format_label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Run `op` again while it fails with an optimistic-concurrency conflict.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                debug!(attempt, error = %e, "Conflict on write, retrying");
                attempt += 1;
                tokio::time::sleep(CONFLICT_BACKOFF).await;
            }
            result => return result,
        }
    }
}

fn namespace_and_name<K: Resource>(obj: &K) -> Result<(String, String)> {
    match (obj.meta().namespace.clone(), obj.meta().name.clone()) {
        (Some(namespace), Some(name)) => Ok((namespace, name)),
        _ => Err(OperatorError::Internal(
            "generated object lacks a namespace or name".to_string(),
        )),
    }
}

/// Update a StatefulSet from its desired state, merging in the live metadata.
pub async fn update_statefulset(
    client: &dyn ClusterClient,
    desired: &StatefulSet,
) -> Result<StatefulSet> {
    let (namespace, name) = namespace_and_name(desired)?;
    let (namespace, name) = (namespace.as_str(), name.as_str());
    retry_on_conflict(move || async move {
        let live = client
            .get_statefulset(namespace, name)
            .await?
            .ok_or_else(|| OperatorError::NotFound {
                kind: "StatefulSet".to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;

        let mut sts = desired.clone();
        merge_metadata(&mut sts.metadata, &live.metadata);
        if let (Some(live_spec), Some(spec)) = (&live.spec, sts.spec.as_mut()) {
            let template = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
            if let Some(live_template) = &live_spec.template.metadata {
                propagate_kubectl_annotations(live_template, template);
            }
        }
        client.update_statefulset(&sts).await
    })
    .await
}

/// Create a Service or converge the live one to `desired`.
///
/// The live cluster IP and IP families are kept since they are immutable.
/// Nothing is written when the merged object equals the live one.
pub async fn create_or_update_service(client: &dyn ClusterClient, desired: &Service) -> Result<()> {
    let (namespace, name) = namespace_and_name(desired)?;
    let (namespace, name) = (namespace.as_str(), name.as_str());
    retry_on_conflict(move || async move {
        let Some(live) = client.get_service(namespace, name).await? else {
            debug!(namespace, name, "Creating Service");
            client.create_service(desired).await?;
            return Ok(());
        };

        let mut svc = desired.clone();
        if let (Some(spec), Some(live_spec)) = (svc.spec.as_mut(), live.spec.as_ref()) {
            spec.ip_families = live_spec.ip_families.clone();
            spec.ip_family_policy = live_spec.ip_family_policy.clone();
            spec.cluster_ip = live_spec.cluster_ip.clone();
            spec.cluster_ips = live_spec.cluster_ips.clone();
        }
        svc.metadata.owner_references = Some(merge_owner_references(
            live.owner_references(),
            svc.owner_references(),
        ));
        merge_metadata(&mut svc.metadata, &live.metadata);

        if svc.spec == live.spec
            && svc.metadata.labels == live.metadata.labels
            && svc.metadata.annotations == live.metadata.annotations
            && svc.metadata.owner_references.as_deref().unwrap_or_default()
                == live.owner_references()
        {
            return Ok(());
        }
        debug!(namespace, name, "Updating Service");
        client.update_service(&svc).await?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::EmbeddedPersistentVolumeClaim;
    use crate::error::api_error;
    use k8s_openapi::api::core::v1::{EnvVar, EphemeralVolumeSource, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn create_test_container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            args: Some(vec!["--a".to_string()]),
            env: Some(vec![EnvVar {
                name: "POD_NAME".to_string(),
                value: Some("x".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_metadata_desired_wins() {
        let mut desired = ObjectMeta {
            labels: Some(map(&[("a", "new")])),
            annotations: Some(map(&[("x", "1")])),
            ..Default::default()
        };
        let live = ObjectMeta {
            resource_version: Some("42".to_string()),
            labels: Some(map(&[("a", "old"), ("b", "kept")])),
            ..Default::default()
        };
        merge_metadata(&mut desired, &live);

        assert_eq!(desired.resource_version.as_deref(), Some("42"));
        assert_eq!(desired.labels, Some(map(&[("a", "new"), ("b", "kept")])));
        assert_eq!(desired.annotations, Some(map(&[("x", "1")])));
    }

    #[test]
    fn test_propagate_kubectl_annotations() {
        let live = ObjectMeta {
            annotations: Some(map(&[
                ("kubectl.kubernetes.io/restartedAt", "now"),
                ("other", "dropped"),
            ])),
            ..Default::default()
        };
        let mut desired = ObjectMeta::default();
        propagate_kubectl_annotations(&live, &mut desired);
        assert_eq!(
            desired.annotations,
            Some(map(&[("kubectl.kubernetes.io/restartedAt", "now")]))
        );
    }

    #[test]
    fn test_strip_kubectl_annotations() {
        let mut annotations = map(&[
            ("kubectl.kubernetes.io/last-applied-configuration", "{}"),
            ("team", "obs"),
        ]);
        strip_kubectl_annotations(&mut annotations);
        assert_eq!(annotations, map(&[("team", "obs")]));
    }

    #[test]
    fn test_merge_patch_containers_by_name() {
        let base = vec![
            create_test_container("thanos-ruler", "thanos:v1"),
            create_test_container("config-reloader", "reloader:v1"),
        ];
        let patches = vec![
            Container {
                name: "thanos-ruler".to_string(),
                image: Some("thanos:custom".to_string()),
                env: Some(vec![EnvVar {
                    name: "EXTRA".to_string(),
                    value: Some("1".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            create_test_container("sidecar", "sidecar:v1"),
        ];

        let merged = merge_patch_containers(base, &patches).unwrap();
        let names: Vec<&str> = merged.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["thanos-ruler", "config-reloader", "sidecar"]);

        let ruler = &merged[0];
        assert_eq!(ruler.image.as_deref(), Some("thanos:custom"));
        assert_eq!(ruler.args.as_deref(), Some(&["--a".to_string()][..]));
        let env: Vec<&str> = ruler.env.as_ref().unwrap().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(env, vec!["POD_NAME", "EXTRA"]);
    }

    #[test]
    fn test_merge_patch_containers_without_patches() {
        let base = vec![create_test_container("a", "img")];
        assert_eq!(merge_patch_containers(base.clone(), &[]).unwrap(), base);
    }

    #[test]
    fn test_data_volume_defaults_to_empty_dir() {
        let volume = data_volume(None, "data");
        assert!(matches!(&volume, DataVolume::Pod(v) if v.empty_dir.is_some()));
        assert_eq!(volume.name(), "data");
    }

    #[test]
    fn test_data_volume_precedence() {
        let storage = StorageSpec {
            empty_dir: None,
            ephemeral: Some(EphemeralVolumeSource::default()),
            volume_claim_template: Some(EmbeddedPersistentVolumeClaim::default()),
        };
        assert!(matches!(
            data_volume(Some(&storage), "data"),
            DataVolume::Pod(v) if v.ephemeral.is_some()
        ));

        let storage = StorageSpec {
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..storage
        };
        assert!(matches!(
            data_volume(Some(&storage), "data"),
            DataVolume::Pod(v) if v.empty_dir.is_some()
        ));
    }

    #[test]
    fn test_claim_template_defaults_access_mode() {
        let mut template = EmbeddedPersistentVolumeClaim::default();
        template.metadata.name = Some("store".to_string());
        template.spec.resources = Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity("10Gi".to_string()),
            )])),
            ..Default::default()
        });
        let storage = StorageSpec {
            volume_claim_template: Some(template),
            ..Default::default()
        };

        let DataVolume::ClaimTemplate(pvc) = data_volume(Some(&storage), "data") else {
            panic!("expected a claim template");
        };
        assert_eq!(pvc.metadata.name.as_deref(), Some("store"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        assert!(spec.resources.is_some());
    }

    #[test]
    fn test_label_selection_has_changed() {
        let selector = SelectorCriteria::from_match_labels([("team", "a")]);
        let old = map(&[("team", "a")]);
        let new = map(&[("team", "b")]);
        assert!(label_selection_has_changed(&old, &new, &selector));
        assert!(!label_selection_has_changed(&old, &old, &selector));
        assert!(!label_selection_has_changed(
            &old,
            &new,
            &SelectorCriteria::Everything
        ));
        assert!(!label_selection_has_changed(
            &map(&[("team", "b")]),
            &map(&[("team", "c")]),
            &selector
        ));
    }

    #[test]
    fn test_controller_owner_name() {
        let meta = ObjectMeta {
            owner_references: Some(vec![
                OwnerReference {
                    kind: "ThanosRuler".to_string(),
                    name: "not-controller".to_string(),
                    ..Default::default()
                },
                OwnerReference {
                    kind: "ThanosRuler".to_string(),
                    name: "main".to_string(),
                    controller: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        assert_eq!(controller_owner_name(&meta, "ThanosRuler"), Some("main"));
        assert_eq!(controller_owner_name(&meta, "Alertmanager"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_conflict() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_on_conflict(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(api_error(409, "Conflict", "stale"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);

        calls.store(0, Ordering::SeqCst);
        let result: Result<()> = retry_on_conflict(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(409, "Conflict", "stale"))
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), CONFLICT_RETRIES);

        calls.store(0, Ordering::SeqCst);
        let result: Result<()> = retry_on_conflict(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(422, "Invalid", "immutable"))
        })
        .await;
        assert!(result.unwrap_err().is_invalid());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
