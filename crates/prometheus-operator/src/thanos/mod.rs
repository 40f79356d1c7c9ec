//! ThanosRuler controller
//!
//! A reconcile pass for one ThanosRuler:
//!
//! 1. selects and validates its PrometheusRules and writes them into
//!    sharded ConfigMaps,
//! 2. converges the governing Service,
//! 3. builds the StatefulSet and creates, updates or leaves it alone
//!    depending on the input hash, recreating it when an update is rejected.
//!
//! Status is computed separately from the StatefulSet's pods.

mod statefulset;

pub use statefulset::{
    RulerBuilder, APP_NAME, CONTAINER_NAME, GOVERNING_SERVICE_NAME, RULER_NAME_LABEL,
    RULE_CONFIGMAP_LABEL,
};

use crate::cache::{Cache, ObjectKey};
use crate::change::{self, SynthesisInputs};
use crate::client::ClusterClient;
use crate::config::OperatorConfig;
use crate::crd::{PrometheusRule, ThanosRuler, Workload};
use crate::error::{OperatorError, Result};
use crate::informer::ResourceEventHandler;
use crate::k8sutil::{self, deletion_in_progress};
use crate::reconciler::{ResourceReconciler, Syncer};
use crate::rules::{self, NamespaceLabeler, RuleSelector, RuleShards};
use crate::selector::SelectorCriteria;
use crate::status::{self, ReconciliationTracker};
use crate::telemetry::ControllerMetrics;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Controller name used in metrics and logs
pub const CONTROLLER_NAME: &str = "thanos";

/// Caches the ThanosRuler controller reads from
#[derive(Clone)]
pub struct ThanosCaches {
    pub rulers: Cache<ThanosRuler>,
    pub rules: Cache<PrometheusRule>,
    pub namespaces: Cache<Namespace>,
}

/// Reconciles ThanosRuler objects
pub struct ThanosController {
    client: Arc<dyn ClusterClient>,
    config: Arc<OperatorConfig>,
    caches: ThanosCaches,
    tracker: ReconciliationTracker,
    metrics: ControllerMetrics,
}

impl ThanosController {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: Arc<OperatorConfig>,
        caches: ThanosCaches,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            config,
            caches,
            tracker: ReconciliationTracker::new(),
            metrics,
        }
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    async fn reconcile(&self, key: &ObjectKey, ruler: &ThanosRuler) -> Result<()> {
        if deletion_in_progress(&ruler.metadata) {
            debug!("ThanosRuler is being deleted, skipping");
            return Ok(());
        }
        if ruler.is_paused() {
            debug!("ThanosRuler is paused, skipping");
            return Ok(());
        }
        if !self.config.is_namespace_allowed(&key.namespace) {
            debug!("Namespace is denied, skipping");
            return Ok(());
        }
        if let Err(errors) = ruler.spec.validate() {
            let err = OperatorError::from(errors);
            warn!(error = %err, "ThanosRuler spec validation failed");
            return Err(err);
        }

        info!("Reconciling ThanosRuler");
        let builder = RulerBuilder::new(ruler, &self.config)
            .map_err(|e| OperatorError::synthesis("StatefulSet", key, e))?;

        let rule_config_maps = self.sync_rules(key, ruler, &builder).await?;

        let service = builder.build_governing_service()?;
        k8sutil::create_or_update_service(self.client.as_ref(), &service).await?;

        let sts_name = builder.statefulset_name();
        let live = self.client.get_statefulset(&key.namespace, &sts_name).await?;
        if live.as_ref().is_some_and(|sts| deletion_in_progress(&sts.metadata)) {
            info!(statefulset = %sts_name, "StatefulSet is being deleted, waiting for it to go away");
            return Ok(());
        }

        let mut desired = builder
            .build_statefulset(&rule_config_maps)
            .map_err(|e| OperatorError::synthesis("StatefulSet", key, e))?;
        let inputs = SynthesisInputs {
            kind: ThanosRuler::KIND,
            spec: &ruler.spec,
            annotations: ruler.annotations(),
            config: &self.config,
            rule_config_maps: &rule_config_maps,
        };
        let decision = change::plan(&inputs, live.as_ref(), &mut desired)?;
        let outcome = change::apply(self.client.as_ref(), &self.metrics, &desired, decision).await?;
        info!(decision = %outcome, "Reconciliation complete");
        Ok(())
    }

    /// Select the ruler's rules and converge its rule ConfigMaps.
    ///
    /// Returns the shard names in mount order.
    async fn sync_rules(
        &self,
        key: &ObjectKey,
        ruler: &ThanosRuler,
        builder: &RulerBuilder<'_>,
    ) -> Result<Vec<String>> {
        let spec = &ruler.spec;
        let namespaces = rules::select_namespaces(
            &key.namespace,
            spec.rule_namespace_selector.as_ref(),
            &self.caches.namespaces,
            self.config.namespace.as_deref(),
            &self.config.deny_namespaces,
        )?;
        let labeler = NamespaceLabeler::new(
            spec.enforced_namespace_label.as_deref(),
            &spec.enforcement_exclusions(),
        );
        let selection = RuleSelector::new(
            &self.caches.rules,
            spec.rule_selector.as_ref(),
            labeler,
            builder.version(),
            self.config.max_config_map_data_size,
        )?
        .select(&namespaces);
        self.metrics.set_selected_resources(
            "PrometheusRule",
            &key.to_string(),
            selection.accepted_len(),
            selection.rejected_len(),
        );

        let sts_name = builder.statefulset_name();
        let shards = RuleShards {
            namespace: &key.namespace,
            statefulset_name: &sts_name,
            selector_labels: builder.rule_config_map_labels(),
            labels: &self.config.labels,
            annotations: &self.config.annotations,
            owner: builder.owner_reference()?,
            max_size: self.config.max_config_map_data_size,
        };
        shards.sync(self.client.as_ref(), &selection.rule_files()).await
    }
}

#[async_trait]
impl Syncer for ThanosController {
    #[instrument(skip(self, key), fields(controller = CONTROLLER_NAME, key = %key))]
    async fn sync(&self, key: &ObjectKey) -> Result<()> {
        let Some(ruler) = self.caches.rulers.get_by_key(key) else {
            debug!("ThanosRuler not found in cache");
            self.tracker.forget(key);
            return Ok(());
        };
        let result = self.reconcile(key, &ruler).await;
        self.tracker
            .set_status(key, result.as_ref().err().map(ToString::to_string));
        result
    }

    #[instrument(skip(self, key), fields(controller = CONTROLLER_NAME, key = %key))]
    async fn update_status(&self, key: &ObjectKey) -> Result<()> {
        let Some(ruler) = self.caches.rulers.get_by_key(key) else {
            return Ok(());
        };
        status::sync_workload_status(self.client.as_ref(), &self.tracker, ruler.as_ref()).await
    }
}

/// Requeues rulers whose rule namespace selection flips with a namespace's labels
pub struct NamespaceHandler {
    reconciler: Arc<ResourceReconciler<ThanosRuler>>,
}

impl NamespaceHandler {
    pub fn new(reconciler: Arc<ResourceReconciler<ThanosRuler>>) -> Self {
        Self { reconciler }
    }
}

impl ResourceEventHandler<Namespace> for NamespaceHandler {
    fn on_add(&self, _obj: &Namespace) {}

    fn on_update(&self, old: &Namespace, new: &Namespace) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        let reconciler = &self.reconciler;
        reconciler.enqueue_matching(|ruler| {
            let criteria = match SelectorCriteria::from_label_selector(
                ruler.spec.rule_namespace_selector.as_ref(),
            ) {
                Ok(criteria) => criteria,
                Err(e) => {
                    warn!(thanosruler = %ruler.name_any(), error = %e, "Invalid rule namespace selector");
                    return false;
                }
            };
            let changed = k8sutil::label_selection_has_changed(old.labels(), new.labels(), &criteria);
            if changed {
                reconciler.metrics().triggered("Namespace", "update");
            }
            changed
        });
    }

    fn on_delete(&self, _obj: &Namespace) {}
}

/// Requeues the rulers selecting the namespace of a changed PrometheusRule
pub struct RuleHandler {
    reconciler: Arc<ResourceReconciler<ThanosRuler>>,
    namespaces: Cache<Namespace>,
}

impl RuleHandler {
    pub fn new(reconciler: Arc<ResourceReconciler<ThanosRuler>>, namespaces: Cache<Namespace>) -> Self {
        Self {
            reconciler,
            namespaces,
        }
    }

    fn enqueue_for_namespace(&self, namespace: &str, action: &'static str) {
        let labels = self
            .namespaces
            .get_by_name(namespace)
            .map(|ns| ns.labels().clone())
            .unwrap_or_default();
        let reconciler = &self.reconciler;
        reconciler.enqueue_matching(|ruler| {
            let owner_namespace = ruler.namespace().unwrap_or_default();
            match rules::selects_namespace(
                &owner_namespace,
                ruler.spec.rule_namespace_selector.as_ref(),
                namespace,
                &labels,
            ) {
                Ok(true) => {
                    reconciler.metrics().triggered("PrometheusRule", action);
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    warn!(thanosruler = %ruler.name_any(), error = %e, "Invalid rule namespace selector");
                    false
                }
            }
        });
    }
}

impl ResourceEventHandler<PrometheusRule> for RuleHandler {
    fn on_add(&self, obj: &PrometheusRule) {
        if let Some(ns) = obj.namespace() {
            self.enqueue_for_namespace(&ns, "add");
        }
    }

    fn on_update(&self, old: &PrometheusRule, new: &PrometheusRule) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        if old.spec == new.spec && old.labels() == new.labels() {
            return;
        }
        if let Some(ns) = new.namespace() {
            self.enqueue_for_namespace(&ns, "update");
        }
    }

    fn on_delete(&self, obj: &PrometheusRule) {
        if let Some(ns) = obj.namespace() {
            self.enqueue_for_namespace(&ns, "delete");
        }
    }
}

/// Requeues the owner of a rule ConfigMap that was changed or removed behind
/// the operator's back
pub struct RuleConfigMapHandler {
    reconciler: Arc<ResourceReconciler<ThanosRuler>>,
}

impl RuleConfigMapHandler {
    pub fn new(reconciler: Arc<ResourceReconciler<ThanosRuler>>) -> Self {
        Self { reconciler }
    }

    fn enqueue_owner(&self, cm: &ConfigMap, action: &'static str) {
        let (Some(namespace), Some(owner)) = (cm.namespace(), cm.labels().get(RULE_CONFIGMAP_LABEL))
        else {
            return;
        };
        if let Some(ruler) = self
            .reconciler
            .resources()
            .get_by_key(&ObjectKey::new(namespace, owner))
        {
            self.reconciler.metrics().triggered("ConfigMap", action);
            self.reconciler.enqueue_for_reconcile(&ruler);
        }
    }
}

impl ResourceEventHandler<ConfigMap> for RuleConfigMapHandler {
    fn on_add(&self, _obj: &ConfigMap) {}

    fn on_update(&self, old: &ConfigMap, new: &ConfigMap) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        self.enqueue_owner(new, "update");
    }

    fn on_delete(&self, obj: &ConfigMap) {
        self.enqueue_owner(obj, "delete");
    }
}
