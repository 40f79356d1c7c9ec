//! Read-only object caches
//!
//! A [`Cache`] is the reconciler's view of one resource kind: a handle to a
//! `kube` reflector store that the watch layer keeps up to date. Reads are
//! in-memory and never block on the network.

use crate::error::{OperatorError, Result};
use crate::selector::SelectorCriteria;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// `namespace/name` identity of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object; `None` if it lacks a name or namespace.
    pub fn from_object<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(OperatorError::Internal(format!(
                "'{}' is not a namespace/name key",
                s
            ))),
        }
    }
}

/// Keyed, eventually consistent snapshot of one resource kind
pub struct Cache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
}

impl<K> Clone for Cache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<K> Cache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(store: Store<K>) -> Self {
        Self { store }
    }

    /// Look up a namespaced object.
    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    /// Look up a cluster-scoped object.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name))
    }

    pub(crate) fn get_ref(&self, obj_ref: &ObjectRef<K>) -> Option<Arc<K>> {
        self.store.get(obj_ref)
    }

    /// Objects in `namespace` (all namespaces for `None`) whose labels match
    /// `selector`, ordered by namespace then name.
    pub fn list(&self, namespace: Option<&str>, selector: &SelectorCriteria) -> Vec<Arc<K>> {
        let mut objects: Vec<Arc<K>> = self
            .store
            .state()
            .into_iter()
            .filter(|obj| namespace.is_none() || obj.namespace().as_deref() == namespace)
            .filter(|obj| selector.matches(obj.labels()))
            .collect();
        objects.sort_by(|a, b| {
            (a.namespace(), a.name_any()).cmp(&(b.namespace(), b.name_any()))
        });
        objects
    }

    /// Every cached object, ordered by namespace then name.
    pub fn list_all(&self) -> Vec<Arc<K>> {
        self.list(None, &SelectorCriteria::Everything)
    }

    /// Wait until the initial list has been received.
    pub async fn wait_until_ready(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|e| OperatorError::Internal(format!("cache writer dropped: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;
    use std::collections::BTreeMap;

    fn create_test_config_map(ns: &str, name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn create_test_cache(objects: Vec<ConfigMap>) -> (Writer<ConfigMap>, Cache<ConfigMap>) {
        let mut writer = Writer::default();
        for obj in objects {
            writer.apply_watcher_event(&watcher::Event::Apply(obj));
        }
        let cache = Cache::new(writer.as_reader());
        (writer, cache)
    }

    #[test]
    fn test_object_key_parse_and_display() {
        let key: ObjectKey = "monitoring/main".parse().unwrap();
        assert_eq!(key, ObjectKey::new("monitoring", "main"));
        assert_eq!(key.to_string(), "monitoring/main");

        assert!("main".parse::<ObjectKey>().is_err());
        assert!("/main".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn test_get_by_key() {
        let (_writer, cache) = create_test_cache(vec![create_test_config_map("a", "one", &[])]);
        assert!(cache.get_by_key(&ObjectKey::new("a", "one")).is_some());
        assert!(cache.get_by_key(&ObjectKey::new("b", "one")).is_none());
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let (_writer, cache) = create_test_cache(vec![
            create_test_config_map("b", "z", &[("app", "x")]),
            create_test_config_map("a", "y", &[("app", "x")]),
            create_test_config_map("a", "w", &[("app", "other")]),
            create_test_config_map("a", "v", &[("app", "x")]),
        ]);
        let selector = SelectorCriteria::from_match_labels([("app", "x")]);

        let all: Vec<String> = cache
            .list(None, &selector)
            .iter()
            .map(|cm| format!("{}/{}", cm.namespace().unwrap(), cm.name_any()))
            .collect();
        assert_eq!(all, vec!["a/v", "a/y", "b/z"]);

        assert_eq!(cache.list(Some("b"), &selector).len(), 1);
        assert!(cache.list(Some("a"), &SelectorCriteria::Nothing).is_empty());
        assert_eq!(cache.list_all().len(), 4);
    }

    #[test]
    fn test_cache_sees_later_writes() {
        let (mut writer, cache) = create_test_cache(vec![]);
        assert!(cache.list_all().is_empty());

        let cm = create_test_config_map("a", "late", &[]);
        writer.apply_watcher_event(&watcher::Event::Apply(cm.clone()));
        assert_eq!(cache.list_all().len(), 1);

        writer.apply_watcher_event(&watcher::Event::Delete(cm));
        assert!(cache.list_all().is_empty());
    }
}
