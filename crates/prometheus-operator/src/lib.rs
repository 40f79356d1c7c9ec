//! # Prometheus Operator
//!
//! Kubernetes operator that runs Thanos Ruler and Alertmanager workloads from
//! `ThanosRuler` and `Alertmanager` custom resources, and packs the
//! `PrometheusRule` objects a ruler selects into size-bounded ConfigMaps.
//!
//! ## Features
//!
//! - **Level-triggered reconciliation**: deduplicating, rate-limited work
//!   queues feed a fixed pool of workers per controller
//! - **Deterministic synthesis**: the StatefulSet, governing Service and rule
//!   ConfigMaps are pure functions of the resource and operator settings
//! - **Change detection**: an input hash annotation skips no-op updates, and
//!   rejected immutable-field updates fall back to delete-and-recreate
//! - **Rule sharding**: selected rules are validated, relabeled when label
//!   enforcement is on and split across ConfigMaps under a byte ceiling
//! - **Status reporting**: replica counts and `Available` / `Reconciled`
//!   conditions aggregated from pods and the last reconcile outcome
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use prometheus_operator::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = kube::Client::try_default().await?;
//!     run_operator(client, OperatorConfig::default(), CancellationToken::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. Informers list and watch every kind into local caches
//! 2. Event handlers turn cache changes into queue keys for the owning resource
//! 3. Workers pop keys and run one reconcile pass per key at a time
//! 4. The pass synthesizes the desired objects, compares input hashes and
//!    creates, updates or recreates the StatefulSet
//! 5. A status pass follows every sync and is repeated on a poll interval
//!    while the workload is not fully available
//!
//! ## Modules
//!
//! - [`workqueue`]: keyed queue with dirty/processing sets and backoff
//! - [`reconciler`]: worker pool, event handlers and the status poller
//! - [`thanos`] / [`alertmanager`]: per-kind controllers and synthesis
//! - [`change`]: input hashing and the create/update/recreate decision
//! - [`rules`]: rule selection, validation and ConfigMap sharding
//! - [`status`]: pod readiness aggregation and condition bookkeeping
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: monitoring.coreos.com/v1
//! kind: ThanosRuler
//! metadata:
//!   name: main
//!   namespace: monitoring
//! spec:
//!   replicas: 2
//!   queryEndpoints:
//!     - dnssrv+_http._tcp.thanos-query.monitoring.svc
//!   ruleSelector:
//!     matchLabels:
//!       role: alert-rules
//!   ruleNamespaceSelector: {}
//! ```
//!
//! ## Metrics
//!
//! - `prometheus_operator_reconcile_operations_total`
//! - `prometheus_operator_reconcile_errors_total`
//! - `prometheus_operator_reconcile_duration_seconds`
//! - `prometheus_operator_status_update_operations_total`
//! - `prometheus_operator_statefulset_delete_create_total`
//! - `prometheus_operator_triggered_total`
//! - `prometheus_operator_managed_resources`

pub mod alertmanager;
pub mod cache;
pub mod change;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod informer;
pub mod k8sutil;
pub mod operator;
pub mod reconciler;
pub mod rules;
pub mod selector;
pub mod status;
pub mod telemetry;
pub mod testing;
pub mod thanos;
pub mod workqueue;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::alertmanager::AlertmanagerController;
    pub use crate::cache::{Cache, ObjectKey};
    pub use crate::change::Decision;
    pub use crate::client::{ClusterClient, KubeClusterClient};
    pub use crate::config::OperatorConfig;
    pub use crate::controller::run_operator;
    pub use crate::crd::{
        Alertmanager, AlertmanagerSpec, PrometheusRule, PrometheusRuleSpec, ThanosRuler,
        ThanosRulerSpec, WorkloadStatus,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::reconciler::{ResourceReconciler, Syncer};
    pub use crate::thanos::ThanosController;
    pub use crate::workqueue::WorkQueue;
}
