//! Consumer binding.
//!
//! A [`Watch`] is one consumer's view of a (handler, body) pair. It registers
//! a listener while alive, keeps a transformed snapshot of the value, and
//! answers reads with a [`Lookup`] instead of blocking: the caller decides
//! whether to await the pending fetch, surface the error, or render.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;

use super::entry::{CacheEntry, PendingFetch};
use super::error::FetchError;
use super::helpers::UseHelpers;
use super::lock::mutex_lock;
use super::notify::{Listener, ListenerId};
use super::registry::CachedHandler;

const SOURCE: &str = "cache::binding";

/// Maps a cached response to what the consumer wants to see.
pub type Transform<T> = Arc<dyn Fn(&Value, &UseHelpers) -> T + Send + Sync>;

/// Result of reading a [`Watch`].
#[derive(Debug, Clone)]
pub enum Lookup<T> {
    /// The current value, transformed.
    Ready(T),
    /// Nothing has settled yet; await this to resume.
    Pending(PendingFetch),
    /// The last fetch failed.
    Failed(FetchError),
}

impl<T> Lookup<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Lookup::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Lookup::Pending(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Lookup::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Lookup::Failed(error) => Some(error),
            _ => None,
        }
    }
}

struct Mount {
    entry: Arc<CacheEntry>,
    listener: ListenerId,
}

/// A registered consumer of one cache entry.
///
/// Dropping the watch deregisters its listener, which starts the eviction
/// grace period once no other watcher remains.
pub struct Watch<T> {
    handler: Arc<CachedHandler>,
    body: Value,
    transform: Transform<T>,
    snapshot: Arc<Mutex<Option<T>>>,
    versions: watch::Receiver<u64>,
    notify: watch::Sender<u64>,
    mount: Mutex<Mount>,
}

impl<T> Watch<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn mount(handler: Arc<CachedHandler>, body: Value, transform: Transform<T>) -> Self {
        let snapshot = Arc::new(Mutex::new(None));
        let (notify, versions) = watch::channel(0);
        let entry = handler.ensure_entry(body.clone());
        let listener = subscribe(&entry, &transform, &snapshot, &notify);

        let watch = Self {
            handler,
            body,
            transform,
            snapshot,
            versions,
            notify,
            mount: Mutex::new(Mount { entry, listener }),
        };
        watch.ensure_fetch(&watch.current());
        watch
    }

    /// Read the current value.
    ///
    /// Starts a fetch if the entry has never settled and none is running. A
    /// stored error wins over any value; an entry that has never settled
    /// hands back its in-flight fetch.
    pub fn read(&self) -> Lookup<T> {
        loop {
            let entry = self.current();
            self.ensure_fetch(&entry);

            let view = entry.view();
            if let Some(error) = view.error {
                return Lookup::Failed(error);
            }
            if !view.initialized
                && let Some(pending) = view.pending
            {
                return Lookup::Pending(pending);
            }
            if let Some(response) = view.response.as_ref() {
                return Lookup::Ready((self.transform)(response, &UseHelpers));
            }
            // Reset between the fetch check and the read.
            if let Some(pending) = self.ensure_fetch(&entry).or_else(|| entry.pending()) {
                return Lookup::Pending(pending);
            }
        }
    }

    /// Wait until a value or an error is available.
    pub async fn resolve(&self) -> Result<T, FetchError> {
        loop {
            match self.read() {
                Lookup::Ready(value) => return Ok(value),
                Lookup::Failed(error) => return Err(error),
                Lookup::Pending(pending) => pending.await,
            }
        }
    }

    /// The transformed value from the latest notification, if any.
    pub fn snapshot(&self) -> Option<T> {
        mutex_lock(&self.snapshot, SOURCE, "snapshot").clone()
    }

    /// Wait for the next notification to this watch.
    pub async fn changed(&mut self) {
        // The sender lives in `self`, so the channel never closes here.
        let _ = self.versions.changed().await;
    }

    /// Number of notifications received so far.
    pub fn version(&self) -> u64 {
        *self.versions.borrow()
    }

    /// The entry this watch is registered on.
    pub fn entry(&self) -> Arc<CacheEntry> {
        Arc::clone(&mutex_lock(&self.mount, SOURCE, "entry").entry)
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn handler(&self) -> &str {
        self.handler.name()
    }

    // A reset drops every listener, and a cache-wide reset also removes the
    // entry from its handler. Either way, register again on the live entry.
    fn current(&self) -> Arc<CacheEntry> {
        let live = self.handler.ensure_entry(self.body.clone());
        let mut mount = mutex_lock(&self.mount, SOURCE, "current");
        if Arc::ptr_eq(&mount.entry, &live) && live.has_listener(mount.listener) {
            return live;
        }
        let stale = std::mem::replace(&mut mount.entry, Arc::clone(&live));
        stale.deregister_listener(mount.listener);
        mount.listener = subscribe(&live, &self.transform, &self.snapshot, &self.notify);
        live
    }

    fn ensure_fetch(&self, entry: &Arc<CacheEntry>) -> Option<PendingFetch> {
        let handler = Arc::clone(&self.handler);
        let body = self.body.clone();
        entry.request_if_idle(move || handler.fetch(body))
    }
}

fn subscribe<T>(
    entry: &Arc<CacheEntry>,
    transform: &Transform<T>,
    snapshot: &Arc<Mutex<Option<T>>>,
    notify: &watch::Sender<u64>,
) -> ListenerId
where
    T: Clone + Send + 'static,
{
    if let Some(response) = entry.response() {
        *mutex_lock(snapshot, SOURCE, "subscribe") = Some(transform(&response, &UseHelpers));
    }
    let transform = Arc::clone(transform);
    let snapshot = Arc::clone(snapshot);
    let notify = notify.clone();
    let listener: Listener = Arc::new(move |value: Option<&Value>| {
        let next = value.map(|value| transform(value, &UseHelpers));
        *mutex_lock(&snapshot, SOURCE, "listener") = next;
        notify.send_modify(|version| *version += 1);
    });
    entry.register_listener(listener)
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        let mount = mutex_lock(&self.mount, SOURCE, "drop");
        mount.entry.deregister_listener(mount.listener);
    }
}

impl<T> fmt::Debug for Watch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("handler", &self.handler.name())
            .field("body", &self.body)
            .field("version", &*self.versions.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::handler::Handler;
    use crate::cache::registry::Registry;

    fn identity() -> Transform<Value> {
        Arc::new(|value: &Value, _: &UseHelpers| value.clone())
    }

    fn registry_with(handler: Handler) -> Registry {
        Registry::new([("todos", handler)], &CacheConfig::default())
    }

    fn todos(registry: &Registry) -> Arc<CachedHandler> {
        Arc::clone(registry.cached("todos", "test").expect("cached handler"))
    }

    #[tokio::test]
    async fn first_read_is_pending_then_ready() {
        let registry = registry_with(Handler::cached(|_| async { Ok(json!([1, 2])) }));
        let watch = Watch::mount(todos(&registry), json!({}), identity());

        let Lookup::Pending(pending) = watch.read() else {
            panic!("expected pending");
        };
        pending.await;

        assert_eq!(watch.read().ready(), Some(json!([1, 2])));
        assert_eq!(watch.snapshot(), Some(json!([1, 2])));
        assert_eq!(watch.version(), 1);
    }

    #[tokio::test]
    async fn overlapping_watches_fetch_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = registry_with(Handler::cached(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!("v")) }
        }));

        let a = Watch::mount(todos(&registry), json!({"k": 1}), identity());
        let b = Watch::mount(todos(&registry), json!({"k": 1}), identity());
        assert!(a.read().is_pending());
        assert!(b.read().is_pending());

        assert_eq!(b.resolve().await, Ok(json!("v")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a.entry(), &b.entry()));
        assert_eq!(a.entry().listener_count(), 2);
    }

    #[tokio::test]
    async fn error_is_surfaced_over_stale_value() {
        let fail = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::clone(&fail);
        let registry = registry_with(Handler::cached(move |_| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Ok(json!("ok"))
                } else {
                    Err(FetchError::new("boom"))
                }
            }
        }));
        let handler = todos(&registry);
        let watch = Watch::mount(Arc::clone(&handler), json!({}), identity());
        assert_eq!(watch.resolve().await, Ok(json!("ok")));

        watch
            .entry()
            .make_request(handler.fetch(json!({})))
            .await;

        let lookup = watch.read();
        assert_eq!(lookup.error(), Some(&FetchError::new("boom")));
        assert_eq!(watch.entry().response(), Some(json!("ok")));
    }

    #[tokio::test]
    async fn transform_applies_to_reads_and_snapshots() {
        let registry = registry_with(Handler::cached(|_| async {
            Ok(json!([{"id": "a", "n": 1}, {"id": "b", "n": 2}]))
        }));
        let transform: Transform<usize> =
            Arc::new(|value: &Value, helpers: &UseHelpers| helpers.mapify(value).len());
        let watch = Watch::mount(todos(&registry), json!({}), transform);

        assert_eq!(watch.resolve().await, Ok(2));
        assert_eq!(watch.snapshot(), Some(2));
    }

    #[tokio::test]
    async fn drop_deregisters() {
        let registry = registry_with(Handler::cached(|_| async { Ok(json!(1)) }));
        let watch = Watch::mount(todos(&registry), json!({}), identity());
        let entry = watch.entry();
        assert!(entry.is_active());

        drop(watch);
        assert!(!entry.is_active());
        assert!(entry.eviction_scheduled());
    }

    #[tokio::test]
    async fn changed_wakes_on_notification() {
        let (tx, rx) = oneshot::channel::<Value>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let registry = registry_with(Handler::cached(move |_| {
            let rx = rx.lock().unwrap().take();
            async move {
                match rx {
                    Some(rx) => rx.await.map_err(|_| FetchError::new("closed")),
                    None => Ok(json!("again")),
                }
            }
        }));
        let mut watch = Watch::mount(todos(&registry), json!({}), identity());

        tx.send(json!("first")).unwrap();
        watch.changed().await;

        assert_eq!(watch.snapshot(), Some(json!("first")));
    }

    #[tokio::test]
    async fn remounts_after_reset() {
        let registry = registry_with(Handler::cached(|_| async { Ok(json!(1)) }));
        let handler = todos(&registry);
        let watch = Watch::mount(Arc::clone(&handler), json!({}), identity());
        assert_eq!(watch.resolve().await, Ok(json!(1)));

        for entry in handler.drain() {
            entry.reset();
        }
        assert_eq!(watch.snapshot(), None);

        assert_eq!(watch.resolve().await, Ok(json!(1)));
        assert!(watch.entry().is_active());
        assert_eq!(handler.len(), 1);
    }
}
