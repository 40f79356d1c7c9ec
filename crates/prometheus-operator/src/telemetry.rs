//! Operator metrics
//!
//! Metric handles are registered with the global `metrics` recorder, which
//! `main` installs as a Prometheus exporter. Without a recorder (tests) every
//! handle is a no-op.

/// Metrics for one controller
#[derive(Clone)]
pub struct ControllerMetrics {
    controller: &'static str,
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for status update attempts
    pub status_updates: metrics::Counter,
    /// Counter for failed status updates
    pub status_update_errors: metrics::Counter,
    /// StatefulSets deleted to recover from an immutable-field update
    pub statefulset_delete_create: metrics::Counter,
}

impl ControllerMetrics {
    /// Create the metrics of `controller` (e.g. `thanos`)
    pub fn new(controller: &'static str) -> Self {
        Self {
            controller,
            reconciliations: metrics::counter!(
                "prometheus_operator_reconcile_operations_total",
                "controller" => controller
            ),
            errors: metrics::counter!(
                "prometheus_operator_reconcile_errors_total",
                "controller" => controller
            ),
            duration: metrics::histogram!(
                "prometheus_operator_reconcile_duration_seconds",
                "controller" => controller
            ),
            status_updates: metrics::counter!(
                "prometheus_operator_status_update_operations_total",
                "controller" => controller
            ),
            status_update_errors: metrics::counter!(
                "prometheus_operator_status_update_errors_total",
                "controller" => controller
            ),
            statefulset_delete_create: metrics::counter!(
                "prometheus_operator_statefulset_delete_create_total",
                "controller" => controller
            ),
        }
    }

    pub fn controller(&self) -> &'static str {
        self.controller
    }

    /// Count an event that triggered (or would trigger) a reconcile.
    pub fn triggered(&self, triggered_by: &'static str, action: &'static str) {
        metrics::counter!(
            "prometheus_operator_triggered_total",
            "controller" => self.controller,
            "triggered_by" => triggered_by,
            "action" => action
        )
        .increment(1);
    }

    /// Publish accepted/rejected counts of selected objects for one owner.
    pub fn set_selected_resources(
        &self,
        resource: &'static str,
        owner: &str,
        accepted: usize,
        rejected: usize,
    ) {
        for (state, value) in [("accepted", accepted), ("rejected", rejected)] {
            metrics::gauge!(
                "prometheus_operator_managed_resources",
                "controller" => self.controller,
                "resource" => resource,
                "owner" => owner.to_string(),
                "state" => state
            )
            .set(value as f64);
        }
    }
}
