//! Event-driven reconcile loop shared by all workload controllers
//!
//! A [`ResourceReconciler`] owns two work queues. Events on the custom
//! resource or on its StatefulSet are filtered and turned into keys on the
//! reconcile queue; workers drain it through [`Syncer::sync`]. Every finished
//! reconcile, successful or not, queues the key for a status refresh, which a
//! dedicated worker performs through [`Syncer::update_status`].

use crate::cache::{Cache, ObjectKey};
use crate::crd::{owner_key_for_statefulset, Workload};
use crate::error::{OperatorError, Result};
use crate::informer::ResourceEventHandler;
use crate::k8sutil::{controller_owner_name, deletion_in_progress, is_managed_by_controller};
use crate::status::needs_status_refresh;
use crate::telemetry::ControllerMetrics;
use crate::workqueue::WorkQueue;
use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Resource, ResourceExt};
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconcile and status logic of one resource kind
#[async_trait]
pub trait Syncer: Send + Sync + 'static {
    /// Converge the cluster to the desired state of `key`.
    async fn sync(&self, key: &ObjectKey) -> Result<()>;
    /// Recompute and write the status subresource of `key`.
    async fn update_status(&self, key: &ObjectKey) -> Result<()>;
}

/// Settings of a [`ResourceReconciler`]
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub controller_id: String,
    pub workers: usize,
    pub status_poll_interval: Duration,
}

/// Queues, workers and event filters of one controller
pub struct ResourceReconciler<W: Workload> {
    syncer: Arc<dyn Syncer>,
    resources: Cache<W>,
    reconcile_queue: WorkQueue<ObjectKey>,
    status_queue: WorkQueue<ObjectKey>,
    metrics: ControllerMetrics,
    config: ReconcilerConfig,
}

impl<W: Workload> ResourceReconciler<W> {
    pub fn new(
        syncer: Arc<dyn Syncer>,
        resources: Cache<W>,
        metrics: ControllerMetrics,
        config: ReconcilerConfig,
    ) -> Self {
        let controller = metrics.controller();
        Self {
            syncer,
            resources,
            reconcile_queue: WorkQueue::new(controller),
            status_queue: WorkQueue::new(format!("{}-status", controller)),
            metrics,
            config,
        }
    }

    pub fn reconcile_queue(&self) -> &WorkQueue<ObjectKey> {
        &self.reconcile_queue
    }

    pub fn status_queue(&self) -> &WorkQueue<ObjectKey> {
        &self.status_queue
    }

    pub fn resources(&self) -> &Cache<W> {
        &self.resources
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Queue `obj` for reconciliation if this instance manages it.
    pub fn enqueue_for_reconcile(&self, obj: &W) {
        if let Some(key) = self.managed_key(obj) {
            self.reconcile_queue.add(key);
        }
    }

    /// Queue `obj` for a status refresh if this instance manages it.
    pub fn enqueue_for_status(&self, obj: &W) {
        if let Some(key) = self.managed_key(obj) {
            self.status_queue.add(key);
        }
    }

    /// Queue every cached object for which `selects` is true.
    pub fn enqueue_matching(&self, selects: impl Fn(&W) -> bool) {
        for obj in self.resources.list_all() {
            if selects(&obj) {
                self.enqueue_for_reconcile(&obj);
            }
        }
    }

    fn managed_key(&self, obj: &W) -> Option<ObjectKey> {
        if !is_managed_by_controller(obj, &self.config.controller_id) {
            return None;
        }
        ObjectKey::from_object(obj)
    }

    /// Owner of a StatefulSet generated by this controller, from the cache.
    fn owner_of(&self, sts: &StatefulSet) -> Option<Arc<W>> {
        let namespace = sts.namespace()?;
        let owner = controller_owner_name(&sts.metadata, W::KIND)?;
        let owner_key = ObjectKey::new(&namespace, owner);
        // The owner reference must agree with the naming convention
        let by_name = owner_key_for_statefulset::<W>(&ObjectKey::new(&namespace, sts.name_any()))?;
        if by_name != owner_key {
            return None;
        }
        self.resources.get_by_key(&owner_key)
    }

    async fn process_reconcile(&self, key: ObjectKey) {
        let start = Instant::now();
        self.metrics.reconciliations.increment(1);
        let result = AssertUnwindSafe(self.syncer.sync(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(OperatorError::Internal("reconcile panicked".to_string())));
        self.metrics
            .duration
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => self.reconcile_queue.forget(&key),
            Err(e) => {
                self.metrics.errors.increment(1);
                if e.is_internal() {
                    error!(controller = self.metrics.controller(), key = %key, error = %e, "Reconciliation failed on a broken invariant, dropping key");
                    self.reconcile_queue.forget(&key);
                } else if e.is_retryable() {
                    warn!(
                        controller = self.metrics.controller(),
                        key = %key,
                        retries = self.reconcile_queue.num_requeues(&key),
                        error = %e,
                        "Reconciliation failed, retrying"
                    );
                    self.reconcile_queue.add_rate_limited(key.clone());
                } else {
                    warn!(controller = self.metrics.controller(), key = %key, error = %e, "Reconciliation failed");
                    self.reconcile_queue.forget(&key);
                }
            }
        }
        self.reconcile_queue.done(&key);
        self.status_queue.add(key);
    }

    async fn process_status(&self, key: ObjectKey) {
        self.metrics.status_updates.increment(1);
        let result = AssertUnwindSafe(self.syncer.update_status(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(OperatorError::Internal("status update panicked".to_string())));
        match result {
            Ok(()) => self.status_queue.forget(&key),
            Err(e) => {
                self.metrics.status_update_errors.increment(1);
                error!(controller = self.metrics.controller(), key = %key, error = %e, "Failed to update status");
                if e.is_retryable() {
                    self.status_queue.add_rate_limited(key.clone());
                } else {
                    self.status_queue.forget(&key);
                }
            }
        }
        self.status_queue.done(&key);
    }

    /// Refresh the status of every object that is not fully available.
    pub fn poll_statuses(&self) {
        for obj in self.resources.list_all() {
            if needs_status_refresh(obj.workload_status()) {
                self.enqueue_for_status(&obj);
            }
        }
    }

    /// Run workers until `shutdown` is cancelled, then drain both queues.
    ///
    /// In-flight reconciles finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let controller = self.metrics.controller();
        tokio::select! {
            ready = self.resources.wait_until_ready() => ready?,
            _ = shutdown.cancelled() => return Ok(()),
        }
        for obj in self.resources.list_all() {
            self.enqueue_for_status(&obj);
        }
        info!(controller, workers = self.config.workers, "Starting workers");

        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers {
            let this = self.clone();
            workers.spawn(async move {
                while let Some(key) = this.reconcile_queue.get().await {
                    this.process_reconcile(key).await;
                }
            });
        }
        {
            let this = self.clone();
            workers.spawn(async move {
                while let Some(key) = this.status_queue.get().await {
                    this.process_status(key).await;
                }
            });
        }
        {
            let this = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                let mut ticker = tokio::time::interval(this.config.status_poll_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => this.poll_statuses(),
                    }
                }
            });
        }

        shutdown.cancelled().await;
        info!(controller, "Shutting down workers");
        self.reconcile_queue.shut_down_with_drain().await;
        self.status_queue.shut_down_with_drain().await;
        while workers.join_next().await.is_some() {}
        info!(controller, "Workers stopped");
        Ok(())
    }
}

/// Whether an update changed anything a reconcile looks at.
fn has_state_changed<K: Resource>(old: &K, new: &K) -> bool {
    let (old, new) = (old.meta(), new.meta());
    old.generation != new.generation || old.labels != new.labels || old.annotations != new.annotations
}

/// Forwards events on the custom resource itself
pub struct ResourceHandler<W: Workload> {
    reconciler: Arc<ResourceReconciler<W>>,
}

impl<W: Workload> ResourceHandler<W> {
    pub fn new(reconciler: Arc<ResourceReconciler<W>>) -> Self {
        Self { reconciler }
    }
}

impl<W: Workload> ResourceEventHandler<W> for ResourceHandler<W> {
    fn on_add(&self, obj: &W) {
        debug!(kind = W::KIND, name = %obj.name_any(), "Resource added");
        self.reconciler.metrics.triggered(W::KIND, "add");
        self.reconciler.enqueue_for_reconcile(obj);
    }

    fn on_update(&self, old: &W, new: &W) {
        if old.resource_version() == new.resource_version()
            || deletion_in_progress(new.meta())
            || !has_state_changed(old, new)
        {
            return;
        }
        debug!(kind = W::KIND, name = %new.name_any(), "Resource updated");
        self.reconciler.metrics.triggered(W::KIND, "update");
        self.reconciler.enqueue_for_reconcile(new);
    }

    fn on_delete(&self, obj: &W) {
        debug!(kind = W::KIND, name = %obj.name_any(), "Resource deleted");
        self.reconciler.metrics.triggered(W::KIND, "delete");
        self.reconciler.enqueue_for_reconcile(obj);
    }
}

/// Maps StatefulSet events to the owning custom resource
pub struct StatefulSetHandler<W: Workload> {
    reconciler: Arc<ResourceReconciler<W>>,
    _kind: PhantomData<W>,
}

impl<W: Workload> StatefulSetHandler<W> {
    pub fn new(reconciler: Arc<ResourceReconciler<W>>) -> Self {
        Self {
            reconciler,
            _kind: PhantomData,
        }
    }
}

impl<W: Workload> ResourceEventHandler<StatefulSet> for StatefulSetHandler<W> {
    fn on_add(&self, sts: &StatefulSet) {
        if let Some(owner) = self.reconciler.owner_of(sts) {
            self.reconciler.metrics.triggered("StatefulSet", "add");
            self.reconciler.enqueue_for_reconcile(&owner);
        }
    }

    fn on_update(&self, old: &StatefulSet, new: &StatefulSet) {
        if deletion_in_progress(&new.metadata) || old.resource_version() == new.resource_version() {
            return;
        }
        let Some(owner) = self.reconciler.owner_of(new) else {
            return;
        };
        self.reconciler.metrics.triggered("StatefulSet", "update");
        if has_state_changed(old, new) {
            self.reconciler.enqueue_for_reconcile(&owner);
        } else {
            // Only the status moved
            self.reconciler.enqueue_for_status(&owner);
        }
    }

    fn on_delete(&self, sts: &StatefulSet) {
        if let Some(owner) = self.reconciler.owner_of(sts) {
            self.reconciler.metrics.triggered("StatefulSet", "delete");
            self.reconciler.enqueue_for_reconcile(&owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ThanosRuler, ThanosRulerSpec};
    use crate::error::{api_error, OperatorError};
    use crate::operator::CONTROLLER_ID_ANNOTATION;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct RecordingSyncer {
        synced: Mutex<Vec<ObjectKey>>,
        statuses: Mutex<Vec<ObjectKey>>,
        fail_with: Mutex<Option<fn() -> OperatorError>>,
        panic_on: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Syncer for RecordingSyncer {
        async fn sync(&self, key: &ObjectKey) -> Result<()> {
            self.synced.lock().push(key.clone());
            if self.panic_on.lock().as_deref() == Some(key.name.as_str()) {
                panic!("sync of {} blew up", key);
            }
            match *self.fail_with.lock() {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        async fn update_status(&self, key: &ObjectKey) -> Result<()> {
            self.statuses.lock().push(key.clone());
            if self.panic_on.lock().as_deref() == Some(key.name.as_str()) {
                panic!("status of {} blew up", key);
            }
            Ok(())
        }
    }

    fn create_test_ruler(name: &str, generation: i64, rv: &str) -> ThanosRuler {
        let mut tr = ThanosRuler::new(name, ThanosRulerSpec::default());
        tr.metadata.namespace = Some("monitoring".to_string());
        tr.metadata.uid = Some(format!("uid-{}", name));
        tr.metadata.generation = Some(generation);
        tr.metadata.resource_version = Some(rv.to_string());
        tr
    }

    fn create_test_statefulset(owner: &str, rv: &str) -> StatefulSet {
        let mut sts = StatefulSet::default();
        sts.metadata.name = Some(format!("thanos-ruler-{}", owner));
        sts.metadata.namespace = Some("monitoring".to_string());
        sts.metadata.resource_version = Some(rv.to_string());
        sts.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "monitoring.coreos.com/v1".to_string(),
            kind: "ThanosRuler".to_string(),
            name: owner.to_string(),
            uid: format!("uid-{}", owner),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);
        sts
    }

    fn create_test_reconciler(
        rulers: Vec<ThanosRuler>,
        controller_id: &str,
    ) -> (Writer<ThanosRuler>, Arc<RecordingSyncer>, Arc<ResourceReconciler<ThanosRuler>>) {
        create_test_reconciler_with_workers(rulers, controller_id, 2)
    }

    fn create_test_reconciler_with_workers(
        rulers: Vec<ThanosRuler>,
        controller_id: &str,
        workers: usize,
    ) -> (Writer<ThanosRuler>, Arc<RecordingSyncer>, Arc<ResourceReconciler<ThanosRuler>>) {
        let mut writer = Writer::default();
        writer.apply_watcher_event(&watcher::Event::Init);
        for tr in rulers {
            writer.apply_watcher_event(&watcher::Event::InitApply(tr));
        }
        writer.apply_watcher_event(&watcher::Event::InitDone);
        let syncer = Arc::new(RecordingSyncer::default());
        let reconciler = Arc::new(ResourceReconciler::new(
            syncer.clone(),
            Cache::new(writer.as_reader()),
            ControllerMetrics::new("thanos"),
            ReconcilerConfig {
                controller_id: controller_id.to_string(),
                workers,
                status_poll_interval: Duration::from_secs(60),
            },
        ));
        (writer, syncer, reconciler)
    }

    #[test]
    fn test_update_filters() {
        let (_w, _s, reconciler) = create_test_reconciler(vec![], "");
        let handler = ResourceHandler::new(reconciler.clone());

        let old = create_test_ruler("a", 1, "1");
        // Status-only write: new resource version, same generation
        handler.on_update(&old, &create_test_ruler("a", 1, "2"));
        assert!(reconciler.reconcile_queue().is_empty());

        handler.on_update(&old, &create_test_ruler("a", 2, "3"));
        assert_eq!(reconciler.reconcile_queue().len(), 1);

        let mut deleting = create_test_ruler("b", 2, "4");
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        handler.on_update(&create_test_ruler("b", 1, "1"), &deleting);
        assert_eq!(reconciler.reconcile_queue().len(), 1);
    }

    #[test]
    fn test_add_and_delete_dedup() {
        let (_w, _s, reconciler) = create_test_reconciler(vec![], "");
        let handler = ResourceHandler::new(reconciler.clone());
        let tr = create_test_ruler("a", 1, "1");
        handler.on_add(&tr);
        handler.on_delete(&tr);
        assert_eq!(reconciler.reconcile_queue().len(), 1);
    }

    #[test]
    fn test_controller_id_filter() {
        let (_w, _s, reconciler) = create_test_reconciler(vec![], "shard-a");
        let handler = ResourceHandler::new(reconciler.clone());

        handler.on_add(&create_test_ruler("unannotated", 1, "1"));
        assert!(reconciler.reconcile_queue().is_empty());

        let mut tr = create_test_ruler("annotated", 1, "1");
        tr.metadata.annotations = Some(BTreeMap::from([(
            CONTROLLER_ID_ANNOTATION.to_string(),
            "shard-a".to_string(),
        )]));
        handler.on_add(&tr);
        assert_eq!(reconciler.reconcile_queue().len(), 1);
    }

    #[test]
    fn test_statefulset_events_resolve_owner() {
        let (_w, _s, reconciler) =
            create_test_reconciler(vec![create_test_ruler("main", 1, "1")], "");
        let handler = StatefulSetHandler::new(reconciler.clone());

        let old = create_test_statefulset("main", "10");
        let mut new = create_test_statefulset("main", "11");
        new.status = Some(Default::default());
        handler.on_update(&old, &new);
        assert!(reconciler.reconcile_queue().is_empty());
        assert_eq!(reconciler.status_queue().len(), 1);

        let mut relabelled = create_test_statefulset("main", "12");
        relabelled.metadata.labels = Some(BTreeMap::from([("x".to_string(), "y".to_string())]));
        handler.on_update(&new, &relabelled);
        assert_eq!(reconciler.reconcile_queue().len(), 1);

        // Unknown owner
        handler.on_delete(&create_test_statefulset("other", "1"));
        assert_eq!(reconciler.reconcile_queue().len(), 1);
    }

    #[tokio::test]
    async fn test_run_processes_and_drains() {
        let (_w, syncer, reconciler) =
            create_test_reconciler(vec![create_test_ruler("main", 1, "1")], "");
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(reconciler.clone().run(shutdown.clone()));

        reconciler.reconcile_queue().add(ObjectKey::new("monitoring", "main"));
        for _ in 0..100 {
            if !syncer.synced.lock().is_empty() && syncer.statuses.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(syncer.synced.lock().len(), 1);
        // Initial status pass plus the one after the reconcile
        assert!(syncer.statuses.lock().len() >= 1);
    }

    #[tokio::test]
    async fn test_failed_reconcile_is_retried() {
        let (_w, syncer, reconciler) = create_test_reconciler(vec![], "");
        *syncer.fail_with.lock() = Some(|| api_error(500, "InternalError", "boom"));
        let key = ObjectKey::new("monitoring", "main");

        reconciler.process_reconcile(key.clone()).await;
        assert_eq!(reconciler.reconcile_queue().num_requeues(&key), 1);
        assert_eq!(reconciler.status_queue().len(), 1);

        *syncer.fail_with.lock() = None;
        reconciler.process_reconcile(key.clone()).await;
        assert_eq!(reconciler.reconcile_queue().num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_retried() {
        let (_w, syncer, reconciler) = create_test_reconciler(vec![], "");
        *syncer.fail_with.lock() = Some(|| OperatorError::InvalidConfig("bad".to_string()));
        let key = ObjectKey::new("monitoring", "main");
        reconciler.process_reconcile(key.clone()).await;
        assert_eq!(reconciler.reconcile_queue().num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_panicking_sync_does_not_stall_workers() {
        let (_w, syncer, reconciler) = create_test_reconciler_with_workers(vec![], "", 1);
        *syncer.panic_on.lock() = Some("bad".to_string());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(reconciler.clone().run(shutdown.clone()));

        let good = ObjectKey::new("monitoring", "good");
        reconciler.reconcile_queue().add(ObjectKey::new("monitoring", "bad"));
        reconciler.reconcile_queue().add(good.clone());
        for _ in 0..100 {
            if syncer.synced.lock().contains(&good) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(syncer.synced.lock().contains(&good));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not return after shutdown")
            .unwrap()
            .unwrap();
        assert!(reconciler.reconcile_queue().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_status_update_releases_key() {
        let (_w, syncer, reconciler) = create_test_reconciler(vec![], "");
        *syncer.panic_on.lock() = Some("bad".to_string());
        let key = ObjectKey::new("monitoring", "bad");

        reconciler.process_reconcile(key.clone()).await;
        // Broken invariants are dropped rather than retried
        assert_eq!(reconciler.reconcile_queue().num_requeues(&key), 0);
        assert_eq!(reconciler.status_queue().len(), 1);

        let popped = reconciler.status_queue().get().await.unwrap();
        reconciler.process_status(popped).await;
        assert!(reconciler.status_queue().is_empty());
        assert_eq!(syncer.statuses.lock().len(), 1);
    }
}
