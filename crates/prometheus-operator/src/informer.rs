//! Watch loop feeding a cache and dispatching change notifications
//!
//! An [`Informer`] runs a `kube` watcher for one resource kind, applies every
//! event to a reflector store, and tells registered handlers what changed,
//! including the previous version of an updated object. Handlers are only
//! expected to enqueue keys; they run on the watch task and must not block.

use crate::cache::Cache;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callbacks invoked for changes of one resource kind
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

/// Watches one resource kind, keeping a cache and notifying handlers
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    dispatcher: Dispatcher<K>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(kind: &'static str, api: Api<K>, config: watcher::Config) -> Self {
        let writer = Writer::default();
        let cache = Cache::new(writer.as_reader());
        Self {
            api,
            config,
            writer,
            dispatcher: Dispatcher::new(kind, cache),
        }
    }

    /// Read handle on the informer's cache.
    pub fn cache(&self) -> Cache<K> {
        self.dispatcher.cache.clone()
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.dispatcher.handlers.push(handler);
    }

    /// Watch until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let Informer {
            api,
            config,
            mut writer,
            mut dispatcher,
        } = self;
        let kind = dispatcher.kind;

        info!(kind, "Starting informer");
        let mut stream = watcher::watcher(api, config).default_backoff().boxed();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => dispatcher.handle(&mut writer, event),
                    Some(Err(e)) => warn!(kind, error = %e, "Watch error, retrying"),
                    None => break,
                },
            }
        }
        info!(kind, "Informer stopped");
    }
}

/// Translates watcher events into store writes and handler callbacks
pub(crate) struct Dispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    kind: &'static str,
    cache: Cache<K>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    /// Objects seen during a re-list; `Some` between `Init` and `InitDone`
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> Dispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub(crate) fn new(kind: &'static str, cache: Cache<K>) -> Self {
        Self {
            kind,
            cache,
            handlers: Vec::new(),
            relisted: None,
        }
    }

    pub(crate) fn handle(&mut self, writer: &mut Writer<K>, event: Event<K>) {
        match &event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                writer.apply_watcher_event(&event);
            }
            Event::Apply(obj) | Event::InitApply(obj) => {
                // Read the old version before the store replaces it
                let old = self.cache.get_ref(&ObjectRef::from_obj(obj));
                if matches!(event, Event::InitApply(_)) {
                    if let Some(seen) = self.relisted.as_mut() {
                        seen.insert(ObjectRef::from_obj(obj));
                    }
                }
                writer.apply_watcher_event(&event);
                match old {
                    Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, obj)),
                    None => self.handlers.iter().for_each(|h| h.on_add(obj)),
                }
            }
            Event::Delete(obj) => {
                writer.apply_watcher_event(&event);
                self.handlers.iter().for_each(|h| h.on_delete(obj));
            }
            Event::InitDone => {
                let before = self.cache.list_all();
                writer.apply_watcher_event(&event);
                // Objects deleted while the watch was down
                if let Some(seen) = self.relisted.take() {
                    for obj in before {
                        if !seen.contains(&ObjectRef::from_obj(obj.as_ref())) {
                            debug!(kind = self.kind, name = %obj.name_any(), "Object gone after re-list");
                            self.handlers.iter().for_each(|h| h.on_delete(&obj));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
    }

    impl ResourceEventHandler<Namespace> for RecordingHandler {
        fn on_add(&self, obj: &Namespace) {
            self.events.lock().push(format!("add {}", obj.name_any()));
        }

        fn on_update(&self, old: &Namespace, new: &Namespace) {
            self.events.lock().push(format!(
                "update {} {}->{}",
                new.name_any(),
                old.resource_version().unwrap_or_default(),
                new.resource_version().unwrap_or_default()
            ));
        }

        fn on_delete(&self, obj: &Namespace) {
            self.events.lock().push(format!("delete {}", obj.name_any()));
        }
    }

    fn create_test_namespace(name: &str, rv: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn create_test_dispatcher() -> (Writer<Namespace>, Dispatcher<Namespace>, Arc<RecordingHandler>) {
        let writer = Writer::default();
        let mut dispatcher = Dispatcher::new("Namespace", Cache::new(writer.as_reader()));
        let handler = Arc::new(RecordingHandler::default());
        dispatcher.handlers.push(handler.clone());
        (writer, dispatcher, handler)
    }

    #[test]
    fn test_apply_is_add_then_update() {
        let (mut writer, mut dispatcher, handler) = create_test_dispatcher();
        dispatcher.handle(&mut writer, Event::Apply(create_test_namespace("a", "1")));
        dispatcher.handle(&mut writer, Event::Apply(create_test_namespace("a", "2")));
        dispatcher.handle(&mut writer, Event::Delete(create_test_namespace("a", "2")));

        assert_eq!(
            *handler.events.lock(),
            vec!["add a", "update a 1->2", "delete a"]
        );
        assert!(dispatcher.cache.list_all().is_empty());
    }

    #[test]
    fn test_relist_reports_vanished_objects() {
        let (mut writer, mut dispatcher, handler) = create_test_dispatcher();
        dispatcher.handle(&mut writer, Event::Apply(create_test_namespace("keep", "1")));
        dispatcher.handle(&mut writer, Event::Apply(create_test_namespace("gone", "1")));
        handler.events.lock().clear();

        dispatcher.handle(&mut writer, Event::Init);
        dispatcher.handle(&mut writer, Event::InitApply(create_test_namespace("keep", "3")));
        dispatcher.handle(&mut writer, Event::InitDone);

        assert_eq!(
            *handler.events.lock(),
            vec!["update keep 1->3", "delete gone"]
        );
        assert_eq!(dispatcher.cache.list_all().len(), 1);
    }
}
