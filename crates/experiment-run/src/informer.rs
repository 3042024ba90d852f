//! Watch-backed object cache that reports add/update/delete notifications
//!
//! kube's watcher only tells us "this object now looks like X". Routing
//! needs to know whether that is a new object, a changed one (and what it
//! looked like before), or a deletion. The reflector store holds the
//! previous snapshot, so each event is classified against it before being
//! applied.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A classified change to a cached object
#[derive(Debug, Clone)]
pub enum ObjectEvent<K> {
    /// First time this object is seen
    Added(Arc<K>),
    /// A new snapshot of an object already in the cache
    Updated {
        /// Snapshot before the change
        old: Arc<K>,
        /// Snapshot after the change
        new: Arc<K>,
    },
    /// The object is gone
    Deleted(Arc<K>),
}

/// Turns raw watcher events into [`ObjectEvent`]s against the current cache.
///
/// Objects that disappear while the watch was being re-listed never get a
/// `Delete` event from the API server; they are reported as deleted when the
/// re-list completes.
pub struct EventClassifier<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    cache: Store<K>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> EventClassifier<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Classify against the given cache reader
    pub fn new(cache: Store<K>) -> Self {
        Self {
            cache,
            relisted: None,
        }
    }

    /// Classify one watcher event. Must be called before the event is applied to the cache.
    pub fn classify(&mut self, event: &Event<K>) -> Vec<ObjectEvent<K>> {
        match event {
            Event::Apply(obj) => vec![self.applied(obj)],
            Event::InitApply(obj) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(ObjectRef::from_obj(obj));
                }
                vec![self.applied(obj)]
            }
            Event::Delete(obj) => {
                let last = self
                    .cache
                    .get(&ObjectRef::from_obj(obj))
                    .unwrap_or_else(|| Arc::new(obj.clone()));
                vec![ObjectEvent::Deleted(last)]
            }
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                self.cache
                    .state()
                    .into_iter()
                    .filter(|obj| !seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .map(ObjectEvent::Deleted)
                    .collect()
            }
        }
    }

    fn applied(&self, obj: &K) -> ObjectEvent<K> {
        let new = Arc::new(obj.clone());
        match self.cache.get(&ObjectRef::from_obj(obj)) {
            Some(old) => ObjectEvent::Updated { old, new },
            None => ObjectEvent::Added(new),
        }
    }
}

/// Watch `api`, keep `writer`'s cache current and hand every classified
/// change to `handler` until `stop` fires or the watch stream ends.
pub async fn run_informer<K, F>(
    kind: &'static str,
    api: Api<K>,
    config: watcher::Config,
    mut writer: Writer<K>,
    mut handler: F,
    stop: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: FnMut(ObjectEvent<K>) + Send,
{
    let mut classifier = EventClassifier::new(writer.as_reader());
    let mut stream = watcher::watcher(api, config).default_backoff().boxed();

    info!(kind, "Starting informer");
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                let changes = classifier.classify(&event);
                writer.apply_watcher_event(&event);
                for change in changes {
                    handler(change);
                }
            }
            Some(Err(e)) => warn!(kind, error = %e, "watch error, backing off"),
            None => {
                debug!(kind, "watch stream ended");
                break;
            }
        }
    }
    info!(kind, "Informer stopped");
}
