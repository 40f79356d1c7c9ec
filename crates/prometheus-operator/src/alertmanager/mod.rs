//! Alertmanager controller
//!
//! Runs Alertmanager clusters from `Alertmanager` objects with the same
//! reconcile machinery as the ThanosRuler controller. The configuration is
//! read from a user-provided Secret and hot-reloaded by a sidecar, so a pass
//! only converges the governing Service and the StatefulSet.

mod statefulset;

pub use statefulset::{
    AlertmanagerBuilder, ALERTMANAGER_NAME_LABEL, APP_NAME, CONTAINER_NAME,
    GOVERNING_SERVICE_NAME,
};

use crate::cache::{Cache, ObjectKey};
use crate::change::{self, SynthesisInputs};
use crate::client::ClusterClient;
use crate::config::OperatorConfig;
use crate::crd::{Alertmanager, Workload};
use crate::error::{OperatorError, Result};
use crate::k8sutil::{self, deletion_in_progress};
use crate::reconciler::Syncer;
use crate::status::{self, ReconciliationTracker};
use crate::telemetry::ControllerMetrics;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

pub const CONTROLLER_NAME: &str = "alertmanager";

/// Reconciles Alertmanager objects
pub struct AlertmanagerController {
    client: Arc<dyn ClusterClient>,
    config: Arc<OperatorConfig>,
    alertmanagers: Cache<Alertmanager>,
    tracker: ReconciliationTracker,
    metrics: ControllerMetrics,
}

impl AlertmanagerController {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: Arc<OperatorConfig>,
        alertmanagers: Cache<Alertmanager>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            config,
            alertmanagers,
            tracker: ReconciliationTracker::new(),
            metrics,
        }
    }

    async fn reconcile(&self, key: &ObjectKey, am: &Alertmanager) -> Result<()> {
        if deletion_in_progress(&am.metadata) {
            debug!("Alertmanager is being deleted, skipping");
            return Ok(());
        }
        if am.is_paused() {
            debug!("Alertmanager is paused, skipping");
            return Ok(());
        }
        if !self.config.is_namespace_allowed(&key.namespace) {
            debug!("Namespace is denied, skipping");
            return Ok(());
        }
        if let Err(errors) = am.spec.validate() {
            let err = OperatorError::from(errors);
            warn!(error = %err, "Alertmanager spec validation failed");
            return Err(err);
        }

        info!("Reconciling Alertmanager");
        let builder = AlertmanagerBuilder::new(am, &self.config)
            .map_err(|e| OperatorError::synthesis("StatefulSet", key, e))?;

        let service = builder.build_governing_service()?;
        k8sutil::create_or_update_service(self.client.as_ref(), &service).await?;

        let sts_name = builder.statefulset_name();
        let live = self.client.get_statefulset(&key.namespace, &sts_name).await?;
        if live.as_ref().is_some_and(|sts| deletion_in_progress(&sts.metadata)) {
            info!(statefulset = %sts_name, "StatefulSet is being deleted, waiting for it to go away");
            return Ok(());
        }

        let mut desired = builder
            .build_statefulset()
            .map_err(|e| OperatorError::synthesis("StatefulSet", key, e))?;
        let inputs = SynthesisInputs {
            kind: Alertmanager::KIND,
            spec: &am.spec,
            annotations: am.annotations(),
            config: &self.config,
            rule_config_maps: &[],
        };
        let decision = change::plan(&inputs, live.as_ref(), &mut desired)?;
        let outcome = change::apply(self.client.as_ref(), &self.metrics, &desired, decision).await?;
        info!(decision = %outcome, "Reconciliation complete");
        Ok(())
    }
}

#[async_trait]
impl Syncer for AlertmanagerController {
    #[instrument(skip(self, key), fields(controller = CONTROLLER_NAME, key = %key))]
    async fn sync(&self, key: &ObjectKey) -> Result<()> {
        let Some(am) = self.alertmanagers.get_by_key(key) else {
            debug!("Alertmanager not found in cache");
            self.tracker.forget(key);
            return Ok(());
        };
        let result = self.reconcile(key, &am).await;
        self.tracker
            .set_status(key, result.as_ref().err().map(ToString::to_string));
        result
    }

    #[instrument(skip(self, key), fields(controller = CONTROLLER_NAME, key = %key))]
    async fn update_status(&self, key: &ObjectKey) -> Result<()> {
        let Some(am) = self.alertmanagers.get_by_key(key) else {
            return Ok(());
        };
        status::sync_workload_status(self.client.as_ref(), &self.tracker, am.as_ref()).await
    }
}
