//! Testing utilities for controllers
//!
//! [`InMemoryClient`] implements [`ClusterClient`] over in-memory maps with
//! the API server behaviours reconcilers depend on: resource versions with
//! optimistic-concurrency checks, `AlreadyExists` on create, and `Invalid`
//! rejections of StatefulSet updates that touch immutable fields. Every write
//! is recorded so tests can assert on the exact API traffic.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = InMemoryClient::new();
//! controller.sync(&key).await?;
//! assert_eq!(client.writes().len(), 3);
//! client.clear_writes();
//! controller.sync(&key).await?;
//! assert!(client.writes().is_empty());
//! ```

use crate::cache::ObjectKey;
use crate::client::ClusterClient;
use crate::error::{api_error, OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodCondition, PodStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, PropagationPolicy};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// Write log
// ============================================================================

/// Kind of API write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
    PatchStatus,
}

/// One recorded API write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub op: WriteOp,
    pub kind: String,
    pub key: ObjectKey,
}

// ============================================================================
// In-memory client
// ============================================================================

#[derive(Default)]
struct State {
    statefulsets: BTreeMap<ObjectKey, StatefulSet>,
    services: BTreeMap<ObjectKey, Service>,
    config_maps: BTreeMap<ObjectKey, ConfigMap>,
    pods: BTreeMap<ObjectKey, Pod>,
    statuses: BTreeMap<(String, ObjectKey), Value>,
    writes: Vec<RecordedWrite>,
    resource_version: u64,
    pending_conflicts: u32,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn record(&mut self, op: WriteOp, kind: &str, key: ObjectKey) {
        self.writes.push(RecordedWrite {
            op,
            kind: kind.to_string(),
            key,
        });
    }
}

/// A [`ClusterClient`] for tests
#[derive(Default)]
pub struct InMemoryClient {
    state: Mutex<State>,
}

fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey> {
    ObjectKey::from_object(obj)
        .ok_or_else(|| OperatorError::Internal("object lacks a namespace or name".to_string()))
}

fn not_found(kind: &str, key: &ObjectKey) -> OperatorError {
    api_error(404, "NotFound", format!("{} \"{}\" not found", kind, key))
}

/// Whether `labels` satisfy a `k=v,k2=v2` selector.
fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

/// Names of the immutable StatefulSet spec fields that differ.
fn immutable_changes(live: &StatefulSet, desired: &StatefulSet) -> Vec<&'static str> {
    let (Some(live), Some(desired)) = (&live.spec, &desired.spec) else {
        return Vec::new();
    };
    let mut changed = Vec::new();
    if live.selector != desired.selector {
        changed.push("selector");
    }
    if live.service_name != desired.service_name {
        changed.push("serviceName");
    }
    if live.volume_claim_templates != desired.volume_claim_templates {
        changed.push("volumeClaimTemplates");
    }
    if live.pod_management_policy != desired.pod_management_policy {
        changed.push("podManagementPolicy");
    }
    changed
}

/// Store `obj` as a create: fails if it exists, assigns a resource version.
fn insert_new<K: Resource + Clone>(
    map: &mut BTreeMap<ObjectKey, K>,
    obj: &K,
    kind: &str,
    rv: String,
) -> Result<(ObjectKey, K)> {
    let key = key_of(obj)?;
    if map.contains_key(&key) {
        return Err(api_error(
            409,
            "AlreadyExists",
            format!("{} \"{}\" already exists", kind, key),
        ));
    }
    let mut stored = obj.clone();
    let meta = stored.meta_mut();
    meta.resource_version = Some(rv);
    meta.uid.get_or_insert_with(|| format!("uid-{}", key.name));
    meta.generation = Some(1);
    map.insert(key.clone(), stored.clone());
    Ok((key, stored))
}

/// Check the optimistic-concurrency precondition of an update.
fn check_version<K: Resource>(live: &K, update: &K, kind: &str, key: &ObjectKey) -> Result<()> {
    match update.meta().resource_version.as_deref() {
        Some(rv) if Some(rv) != live.meta().resource_version.as_deref() => Err(api_error(
            409,
            "Conflict",
            format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
                kind, key
            ),
        )),
        _ => Ok(()),
    }
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes recorded since creation or the last [`clear_writes`](Self::clear_writes)
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Make the next `n` StatefulSet updates fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.state.lock().pending_conflicts = n;
    }

    pub fn statefulset(&self, key: &ObjectKey) -> Option<StatefulSet> {
        self.state.lock().statefulsets.get(key).cloned()
    }

    pub fn service(&self, key: &ObjectKey) -> Option<Service> {
        self.state.lock().services.get(key).cloned()
    }

    pub fn config_maps(&self, namespace: &str) -> Vec<ConfigMap> {
        self.state
            .lock()
            .config_maps
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, cm)| cm.clone())
            .collect()
    }

    /// Last status patched onto the custom resource `plural` `key`
    pub fn status(&self, plural: &str, key: &ObjectKey) -> Option<Value> {
        self.state
            .lock()
            .statuses
            .get(&(plural.to_string(), key.clone()))
            .cloned()
    }

    /// Replace a stored StatefulSet without recording a write, as an
    /// external actor would.
    pub fn put_statefulset(&self, mut sts: StatefulSet) -> Result<()> {
        let key = key_of(&sts)?;
        let mut state = self.state.lock();
        sts.metadata.resource_version = Some(state.next_resource_version());
        state.statefulsets.insert(key, sts);
        Ok(())
    }

    /// Add `count` running, ready pods built from the StatefulSet's template.
    pub fn add_ready_pods(&self, sts: &StatefulSet, count: usize) -> Result<()> {
        let key = key_of(sts)?;
        let template = sts
            .spec
            .as_ref()
            .map(|s| s.template.clone())
            .unwrap_or_default();
        let mut state = self.state.lock();
        for i in 0..count {
            let name = format!("{}-{}", key.name, i);
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(key.namespace.clone()),
                    labels: template.metadata.as_ref().and_then(|m| m.labels.clone()),
                    ..Default::default()
                },
                spec: Some(template.spec.clone().unwrap_or_default()),
                status: Some(PodStatus {
                    phase: Some("Running".to_string()),
                    conditions: Some(vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            };
            state.pods.insert(ObjectKey::new(&key.namespace, name), pod);
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for InMemoryClient {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.statefulset(&ObjectKey::new(namespace, name)))
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        let (key, stored) = insert_new(&mut state.statefulsets, sts, "StatefulSet", rv)?;
        state.record(WriteOp::Create, "StatefulSet", key);
        Ok(stored)
    }

    async fn update_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let key = key_of(sts)?;
        let mut state = self.state.lock();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(api_error(409, "Conflict", "injected conflict"));
        }
        let live = state
            .statefulsets
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("StatefulSet", &key))?;
        check_version(&live, sts, "statefulsets.apps", &key)?;
        let changed = immutable_changes(&live, sts);
        if !changed.is_empty() {
            return Err(api_error(
                422,
                "Invalid",
                format!(
                    "StatefulSet.apps \"{}\" is invalid: spec: Forbidden: updates to statefulset spec for fields other than 'replicas', 'ordinals', 'template', 'updateStrategy', 'persistentVolumeClaimRetentionPolicy' and 'minReadySeconds' are forbidden ({})",
                    key.name,
                    changed.join(", ")
                ),
            ));
        }

        let generation = live.metadata.generation.unwrap_or(1);
        let mut stored = sts.clone();
        stored.metadata.uid = live.metadata.uid.clone();
        stored.metadata.generation = Some(if live.spec != sts.spec {
            generation + 1
        } else {
            generation
        });
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.statefulsets.insert(key.clone(), stored.clone());
        state.record(WriteOp::Update, "StatefulSet", key);
        Ok(stored)
    }

    async fn delete_statefulset(
        &self,
        namespace: &str,
        name: &str,
        _propagation: PropagationPolicy,
    ) -> Result<()> {
        let key = ObjectKey::new(namespace, name);
        let mut state = self.state.lock();
        if state.statefulsets.remove(&key).is_some() {
            state.pods.retain(|k, _| {
                !(k.namespace == key.namespace && k.name.starts_with(&format!("{}-", key.name)))
            });
            state.record(WriteOp::Delete, "StatefulSet", key);
        }
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(&ObjectKey::new(namespace, name)))
    }

    async fn create_service(&self, svc: &Service) -> Result<Service> {
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        let (key, stored) = insert_new(&mut state.services, svc, "Service", rv)?;
        state.record(WriteOp::Create, "Service", key);
        Ok(stored)
    }

    async fn update_service(&self, svc: &Service) -> Result<Service> {
        let key = key_of(svc)?;
        let mut state = self.state.lock();
        let live = state
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("Service", &key))?;
        check_version(&live, svc, "services", &key)?;
        let mut stored = svc.clone();
        stored.metadata.uid = live.metadata.uid.clone();
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.services.insert(key.clone(), stored.clone());
        state.record(WriteOp::Update, "Service", key);
        Ok(stored)
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>> {
        Ok(self
            .config_maps(namespace)
            .into_iter()
            .filter(|cm| matches_selector(cm.labels(), label_selector))
            .collect())
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        let (key, stored) = insert_new(&mut state.config_maps, cm, "ConfigMap", rv)?;
        state.record(WriteOp::Create, "ConfigMap", key);
        Ok(stored)
    }

    async fn update_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        let key = key_of(cm)?;
        let mut state = self.state.lock();
        let live = state
            .config_maps
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("ConfigMap", &key))?;
        check_version(&live, cm, "configmaps", &key)?;
        let mut stored = cm.clone();
        stored.metadata.uid = live.metadata.uid.clone();
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.config_maps.insert(key.clone(), stored.clone());
        state.record(WriteOp::Update, "ConfigMap", key);
        Ok(stored)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::new(namespace, name);
        let mut state = self.state.lock();
        if state.config_maps.remove(&key).is_some() {
            state.record(WriteOp::Delete, "ConfigMap", key);
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|(k, pod)| k.namespace == namespace && matches_selector(pod.labels(), label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<()> {
        let key = ObjectKey::new(namespace, name);
        let mut state = self.state.lock();
        state
            .statuses
            .insert((resource.plural.clone(), key.clone()), status);
        state.record(WriteOp::PatchStatus, &resource.kind, key);
        Ok(())
    }
}
