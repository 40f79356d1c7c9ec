//! Typed Kubernetes client
//!
//! Reconcilers talk to the API server only through the [`ClusterClient`]
//! trait: create/update/delete of the objects they manage plus status patches
//! on custom resources. The production implementation wraps `kube::Client`;
//! [`crate::testing::InMemoryClient`] implements the same contract in memory.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::{Client, Resource};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Default timeout for a single API call
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// CRUD operations the reconcilers need
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;
    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet>;
    /// Replace a StatefulSet; fails on a stale `resourceVersion`.
    async fn update_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet>;
    async fn delete_statefulset(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, svc: &Service) -> Result<Service>;
    async fn update_service(&self, svc: &Service) -> Result<Service>;

    async fn list_config_maps(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<ConfigMap>>;
    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap>;
    async fn update_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Merge-patch the status subresource of a custom resource.
    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>;
}

/// Configuration for [`KubeClusterClient`]
#[derive(Debug, Clone)]
pub struct KubeClientConfig {
    /// Timeout applied to every API call
    pub operation_timeout: Duration,
}

impl Default for KubeClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// [`ClusterClient`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    config: KubeClientConfig,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self::with_config(client, KubeClientConfig::default())
    }

    pub fn with_config(client: Client, config: KubeClientConfig) -> Self {
        Self { client, config }
    }

    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>> + Send,
    {
        timeout(self.config.operation_timeout, fut)
            .await
            .map_err(|_| OperatorError::Timeout(format!("{} timed out", operation)))?
            .map_err(OperatorError::from)
    }

    fn name_of<K: Resource>(obj: &K) -> Result<(String, String)> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("object missing metadata.name".into()))?;
        let namespace = obj.meta().namespace.clone().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("object {} missing metadata.namespace", name))
        })?;
        Ok((namespace, name))
    }
}

/// Treat 404 on delete as success
fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        self.call("get StatefulSet", api.get_opt(name)).await
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let (namespace, name) = Self::name_of(sts)?;
        debug!(namespace = %namespace, name = %name, "Creating StatefulSet");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        self.call("create StatefulSet", api.create(&PostParams::default(), sts))
            .await
    }

    async fn update_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let (namespace, name) = Self::name_of(sts)?;
        debug!(namespace = %namespace, name = %name, "Updating StatefulSet");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        self.call(
            "update StatefulSet",
            api.replace(&name, &PostParams::default(), sts),
        )
        .await
    }

    async fn delete_statefulset(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(propagation),
            ..Default::default()
        };
        ignore_not_found(
            self.call("delete StatefulSet", api.delete(name, &params))
                .await
                .map(|_| ()),
        )
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.call("get Service", api.get_opt(name)).await
    }

    async fn create_service(&self, svc: &Service) -> Result<Service> {
        let (namespace, _) = Self::name_of(svc)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        self.call("create Service", api.create(&PostParams::default(), svc))
            .await
    }

    async fn update_service(&self, svc: &Service) -> Result<Service> {
        let (namespace, name) = Self::name_of(svc)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        self.call(
            "update Service",
            api.replace(&name, &PostParams::default(), svc),
        )
        .await
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        self.call("list ConfigMaps", api.list(&params))
            .await
            .map(|list| list.items)
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        let (namespace, _) = Self::name_of(cm)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        self.call("create ConfigMap", api.create(&PostParams::default(), cm))
            .await
    }

    async fn update_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        let (namespace, name) = Self::name_of(cm)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        self.call(
            "update ConfigMap",
            api.replace(&name, &PostParams::default(), cm),
        )
        .await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(
            self.call("delete ConfigMap", api.delete(name, &DeleteParams::default()))
                .await
                .map(|_| ()),
        )
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        self.call("list Pods", api.list(&params))
            .await
            .map(|list| list.items)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        let patch = serde_json::json!({ "status": status });
        self.call(
            "patch status",
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .map(|_| ())
    }
}
