//! Status aggregation
//!
//! Rolls the pods of a workload up into the custom resource's status:
//! replica counts, an `Available` condition derived from pod readiness, and a
//! `Reconciled` condition reporting the outcome of the last reconcile.

use crate::cache::ObjectKey;
use crate::client::ClusterClient;
use crate::crd::{statefulset_name, Condition, ConditionStatus, ConditionType, Workload, WorkloadStatus};
use crate::error::Result;
use crate::k8sutil::{deletion_in_progress, format_label_selector};
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::core::ApiResource;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Whether a pod is running and reports `Ready=True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status.conditions.as_ref().is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Image and arguments of each container, by container name
fn container_fingerprint(containers: &[Container]) -> BTreeMap<&str, (Option<&str>, &[String])> {
    containers
        .iter()
        .map(|c| {
            (
                c.name.as_str(),
                (c.image.as_deref(), c.args.as_deref().unwrap_or_default()),
            )
        })
        .collect()
}

/// A pod classified against the live pod template
#[derive(Debug, Clone)]
pub struct PodState {
    pub name: String,
    pub ready: bool,
    /// Runs the images and arguments of the current template
    pub current: bool,
    /// Messages of the pod's failing conditions
    pub messages: Vec<String>,
}

/// Classifies the pods of one StatefulSet
#[derive(Debug, Clone, Default)]
pub struct StatefulSetReporter {
    pub pods: Vec<PodState>,
}

impl StatefulSetReporter {
    pub fn new(sts: &StatefulSet, pods: &[Pod]) -> Self {
        let template = sts
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|s| container_fingerprint(&s.containers))
            .unwrap_or_default();

        let mut states: Vec<PodState> = pods
            .iter()
            .map(|pod| {
                let ready = is_pod_ready(pod);
                let current = ready
                    && pod
                        .spec
                        .as_ref()
                        .is_some_and(|s| container_fingerprint(&s.containers) == template);
                let messages = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conditions| {
                        conditions
                            .iter()
                            .filter(|c| c.status != "True")
                            .filter_map(|c| c.message.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                PodState {
                    name: pod.metadata.name.clone().unwrap_or_default(),
                    ready,
                    current,
                    messages,
                }
            })
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        Self { pods: states }
    }

    pub fn replicas(&self) -> i32 {
        self.pods.len() as i32
    }

    pub fn ready_replicas(&self) -> i32 {
        self.pods.iter().filter(|p| p.ready).count() as i32
    }

    pub fn updated_replicas(&self) -> i32 {
        self.pods.iter().filter(|p| p.current).count() as i32
    }

    pub fn unavailable_replicas(&self) -> i32 {
        self.replicas() - self.ready_replicas()
    }

    /// `Available` condition for a workload expecting `expected` replicas
    pub fn available_condition(&self, expected: i32, generation: Option<i64>) -> Condition {
        let ready = self.ready_replicas();
        let (status, reason, message) = if ready >= expected {
            (ConditionStatus::True, None, None)
        } else {
            let status = if ready == 0 {
                ConditionStatus::False
            } else {
                ConditionStatus::Degraded
            };
            let mut lines = Vec::new();
            for pod in self.pods.iter().filter(|p| !p.ready) {
                if pod.messages.is_empty() {
                    lines.push(format!("pod {}: not ready", pod.name));
                }
                for msg in &pod.messages {
                    lines.push(format!("pod {}: {}", pod.name, msg));
                }
            }
            let cause = if ready == 0 {
                "NoPodReady"
            } else {
                "SomePodsNotReady"
            };
            (
                status,
                Some(cause.to_string()),
                (!lines.is_empty()).then(|| lines.join("\n")),
            )
        };
        Condition {
            condition_type: ConditionType::Available,
            status,
            last_transition_time: Some(Utc::now().to_rfc3339()),
            reason,
            message,
            observed_generation: generation,
        }
    }
}

/// Remembers the outcome of the last reconcile of every object
#[derive(Debug, Default)]
pub struct ReconciliationTracker {
    /// `None` records success, `Some` the error message of a failure
    outcomes: DashMap<ObjectKey, Option<String>>,
}

impl ReconciliationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, key: &ObjectKey, error: Option<String>) {
        self.outcomes.insert(key.clone(), error);
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.outcomes.remove(key);
    }

    /// `Reconciled` condition for `key` at `generation`
    pub fn condition(&self, key: &ObjectKey, generation: Option<i64>) -> Condition {
        let (status, reason, message) = match self.outcomes.get(key).as_deref() {
            None => (
                ConditionStatus::Unknown,
                Some("NotFound".to_string()),
                Some(format!("object \"{}\" not found", key)),
            ),
            Some(None) => (ConditionStatus::True, None, None),
            Some(Some(err)) => (
                ConditionStatus::False,
                Some("ReconciliationFailed".to_string()),
                Some(err.clone()),
            ),
        };
        Condition {
            condition_type: ConditionType::Reconciled,
            status,
            last_transition_time: Some(Utc::now().to_rfc3339()),
            reason,
            message,
            observed_generation: generation,
        }
    }
}

/// Merge freshly computed conditions into the existing ones.
///
/// A condition whose status did not change keeps its `lastTransitionTime`.
pub fn update_conditions(existing: &[Condition], updated: Vec<Condition>) -> Vec<Condition> {
    let mut conditions: Vec<Condition> = updated
        .into_iter()
        .map(|mut condition| {
            if let Some(previous) = existing
                .iter()
                .find(|c| c.condition_type == condition.condition_type)
            {
                if previous.status == condition.status {
                    condition.last_transition_time = previous.last_transition_time.clone();
                }
            }
            condition
        })
        .collect();
    // Keep conditions of types this pass did not compute
    for previous in existing {
        if !conditions
            .iter()
            .any(|c| c.condition_type == previous.condition_type)
        {
            conditions.push(previous.clone());
        }
    }
    conditions.sort_by_key(|c| c.condition_type as u8);
    conditions
}

/// Inputs for [`build_status`]
pub struct StatusInputs<'a> {
    pub paused: bool,
    pub expected_replicas: i32,
    pub generation: Option<i64>,
    /// `None` when the StatefulSet does not exist
    pub reporter: Option<&'a StatefulSetReporter>,
    pub reconciled: Condition,
    pub previous: Option<&'a WorkloadStatus>,
}

/// Compute the status subresource of a workload.
pub fn build_status(inputs: StatusInputs<'_>) -> WorkloadStatus {
    let available = match inputs.reporter {
        Some(reporter) => reporter.available_condition(inputs.expected_replicas, inputs.generation),
        None => Condition {
            condition_type: ConditionType::Available,
            status: ConditionStatus::False,
            last_transition_time: Some(Utc::now().to_rfc3339()),
            reason: Some("StatefulSetNotFound".to_string()),
            message: None,
            observed_generation: inputs.generation,
        },
    };
    let previous_conditions = inputs
        .previous
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let reporter = inputs.reporter.cloned().unwrap_or_default();

    WorkloadStatus {
        paused: inputs.paused,
        replicas: reporter.replicas(),
        updated_replicas: reporter.updated_replicas(),
        available_replicas: reporter.ready_replicas(),
        unavailable_replicas: reporter.unavailable_replicas(),
        conditions: update_conditions(previous_conditions, vec![available, inputs.reconciled]),
    }
}

/// Whether the status poller should refresh an object with this status.
pub fn needs_status_refresh(status: Option<&WorkloadStatus>) -> bool {
    !status
        .and_then(|s| s.condition(ConditionType::Available))
        .is_some_and(|c| c.status == ConditionStatus::True)
}

/// Recompute the status of `obj` from its StatefulSet and pods and write it.
///
/// Objects being deleted are skipped, and nothing is written when the status
/// did not change.
pub async fn sync_workload_status<W: Workload>(
    client: &dyn ClusterClient,
    tracker: &ReconciliationTracker,
    obj: &W,
) -> Result<()> {
    if deletion_in_progress(obj.meta()) {
        return Ok(());
    }
    let (Some(namespace), Some(name)) = (obj.namespace(), obj.meta().name.clone()) else {
        return Ok(());
    };

    let sts = client
        .get_statefulset(&namespace, &statefulset_name::<W>(&name))
        .await?
        .filter(|sts| !deletion_in_progress(&sts.metadata));
    let reporter = match &sts {
        Some(sts) => {
            let selector = sts
                .spec
                .as_ref()
                .and_then(|spec| spec.selector.match_labels.as_ref())
                .map(format_label_selector)
                .unwrap_or_default();
            let pods = client.list_pods(&namespace, &selector).await?;
            Some(StatefulSetReporter::new(sts, &pods))
        }
        None => None,
    };

    let key = ObjectKey::new(&namespace, &name);
    let status = build_status(StatusInputs {
        paused: obj.is_paused(),
        expected_replicas: obj.desired_replicas(),
        generation: obj.meta().generation,
        reporter: reporter.as_ref(),
        reconciled: tracker.condition(&key, obj.meta().generation),
        previous: obj.workload_status(),
    });
    if obj.workload_status() == Some(&status) {
        debug!(kind = W::KIND, key = %key, "Status is unchanged");
        return Ok(());
    }

    client
        .patch_status(
            &ApiResource::erase::<W>(&()),
            &namespace,
            &name,
            serde_json::to_value(&status)?,
        )
        .await
}
