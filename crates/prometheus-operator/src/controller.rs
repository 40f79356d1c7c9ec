//! Operator wiring
//!
//! Builds one informer per watched kind, registers the controllers' event
//! handlers on them and runs informers and reconcilers until shutdown.

use crate::alertmanager::{self, AlertmanagerController};
use crate::client::{ClusterClient, KubeClusterClient};
use crate::config::OperatorConfig;
use crate::crd::{Alertmanager, PrometheusRule, ThanosRuler};
use crate::error::{OperatorError, Result};
use crate::informer::Informer;
use crate::operator::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::reconciler::{ReconcilerConfig, ResourceHandler, ResourceReconciler, StatefulSetHandler};
use crate::telemetry::ControllerMetrics;
use crate::thanos::{self, ThanosCaches, ThanosController};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run both controllers until `shutdown` is cancelled.
///
/// The first controller error cancels `shutdown` and is returned once
/// everything has stopped.
pub async fn run_operator(
    client: Client,
    config: OperatorConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;
    let config = Arc::new(config);
    let namespace = config.namespace.as_deref();
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));

    let mut rulers: Informer<ThanosRuler> = Informer::new(
        "ThanosRuler",
        scoped_api(&client, namespace),
        watcher::Config::default(),
    );
    let mut alertmanagers: Informer<Alertmanager> = Informer::new(
        "Alertmanager",
        scoped_api(&client, namespace),
        watcher::Config::default(),
    );
    let mut rules: Informer<PrometheusRule> = Informer::new(
        "PrometheusRule",
        scoped_api(&client, namespace),
        watcher::Config::default(),
    );
    let mut statefulsets: Informer<StatefulSet> = Informer::new(
        "StatefulSet",
        scoped_api(&client, namespace),
        watcher::Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)),
    );
    let mut rule_config_maps: Informer<ConfigMap> = Informer::new(
        "ConfigMap",
        scoped_api(&client, namespace),
        watcher::Config::default().labels(thanos::RULE_CONFIGMAP_LABEL),
    );
    let mut namespaces: Informer<Namespace> = Informer::new(
        "Namespace",
        Api::all(client.clone()),
        watcher::Config::default(),
    );

    let reconciler_config = ReconcilerConfig {
        controller_id: config.controller_id.clone(),
        workers: config.workers,
        status_poll_interval: config.status_poll_interval,
    };

    // ThanosRuler
    let thanos_metrics = ControllerMetrics::new(thanos::CONTROLLER_NAME);
    let thanos_controller = Arc::new(ThanosController::new(
        cluster.clone(),
        config.clone(),
        ThanosCaches {
            rulers: rulers.cache(),
            rules: rules.cache(),
            namespaces: namespaces.cache(),
        },
        thanos_metrics.clone(),
    ));
    let thanos_reconciler = Arc::new(ResourceReconciler::new(
        thanos_controller,
        rulers.cache(),
        thanos_metrics,
        reconciler_config.clone(),
    ));
    rulers.add_event_handler(Arc::new(ResourceHandler::new(thanos_reconciler.clone())));
    statefulsets.add_event_handler(Arc::new(StatefulSetHandler::new(thanos_reconciler.clone())));
    namespaces.add_event_handler(Arc::new(thanos::NamespaceHandler::new(
        thanos_reconciler.clone(),
    )));
    rules.add_event_handler(Arc::new(thanos::RuleHandler::new(
        thanos_reconciler.clone(),
        namespaces.cache(),
    )));
    rule_config_maps.add_event_handler(Arc::new(thanos::RuleConfigMapHandler::new(
        thanos_reconciler.clone(),
    )));

    // Alertmanager
    let am_metrics = ControllerMetrics::new(alertmanager::CONTROLLER_NAME);
    let am_controller = Arc::new(AlertmanagerController::new(
        cluster,
        config.clone(),
        alertmanagers.cache(),
        am_metrics.clone(),
    ));
    let am_reconciler = Arc::new(ResourceReconciler::new(
        am_controller,
        alertmanagers.cache(),
        am_metrics,
        reconciler_config,
    ));
    alertmanagers.add_event_handler(Arc::new(ResourceHandler::new(am_reconciler.clone())));
    statefulsets.add_event_handler(Arc::new(StatefulSetHandler::new(am_reconciler.clone())));

    info!(
        namespace = namespace.unwrap_or("<all>"),
        workers = config.workers,
        "Starting Prometheus operator"
    );

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    spawn_informer(&mut tasks, rulers.run(shutdown.clone()));
    spawn_informer(&mut tasks, alertmanagers.run(shutdown.clone()));
    spawn_informer(&mut tasks, rules.run(shutdown.clone()));
    spawn_informer(&mut tasks, statefulsets.run(shutdown.clone()));
    spawn_informer(&mut tasks, rule_config_maps.run(shutdown.clone()));
    spawn_informer(&mut tasks, namespaces.run(shutdown.clone()));
    tasks.spawn(thanos_reconciler.run(shutdown.clone()));
    tasks.spawn(am_reconciler.run(shutdown.clone()));

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| OperatorError::Internal(format!("task failed: {}", e)));
        if let Err(e) = result.and_then(|r| r) {
            error!(error = %e, "Operator task failed, shutting down");
            shutdown.cancel();
            first_error.get_or_insert(e);
        }
    }
    info!("Prometheus operator stopped");
    first_error.map_or(Ok(()), Err)
}

fn spawn_informer(tasks: &mut JoinSet<Result<()>>, informer: impl Future<Output = ()> + Send + 'static) {
    tasks.spawn(async move {
        informer.await;
        Ok(())
    });
}
