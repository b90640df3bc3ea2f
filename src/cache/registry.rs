//! Handler registry.
//!
//! Built once from the declared handlers. Cached handlers own the mapping
//! from body key to [`CacheEntry`], filled lazily on first access.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::entry::{ActivateFn, CacheEntry, EntryOptions, FetchFuture};
use super::handler::{ActionFn, Definition, FetchFn, Handler, HandlerKind, WatchFn};
use super::keys::BodyKey;
use super::setter::{ScopedSetter, Setter};

pub const METRIC_ENTRY_CREATED_TOTAL: &str = "rcache_entry_created_total";

/// A cached-fetch handler and its entries.
pub(crate) struct CachedHandler {
    name: Arc<str>,
    fetch: FetchFn,
    on_watch: Option<WatchFn>,
    cache_timeout: Duration,
    entries: DashMap<BodyKey, Arc<CacheEntry>>,
}

impl CachedHandler {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the fetch function for `body`.
    pub(crate) fn fetch(&self, body: Value) -> FetchFuture {
        (self.fetch)(body)
    }

    /// The entry for `body`, created if this is the first access.
    pub(crate) fn ensure_entry(self: &Arc<Self>, body: Value) -> Arc<CacheEntry> {
        let key = BodyKey::of(&body);
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let options = EntryOptions {
                    cache_timeout: self.cache_timeout,
                    on_active: self.activation(&body),
                };
                let entry = CacheEntry::new(Arc::clone(&self.name), body, options);
                counter!(METRIC_ENTRY_CREATED_TOTAL, "handler" => self.name.to_string())
                    .increment(1);
                debug!(handler = %self.name, body_key = %entry.key(), "Entry created");
                vacant.insert(Arc::clone(&entry));
                entry
            }
        }
    }

    // The hook holds the handler weakly; the handler owns the entry that owns
    // the hook.
    fn activation(self: &Arc<Self>, body: &Value) -> Option<ActivateFn> {
        self.on_watch.as_ref()?;
        let handler: Weak<Self> = Arc::downgrade(self);
        let body = body.clone();
        Some(Box::new(move || {
            let handler = handler.upgrade()?;
            let hook = handler.on_watch.as_ref()?;
            hook(body.clone(), ScopedSetter::new(&handler))
        }))
    }

    pub(crate) fn get_entry(&self, body: &Value) -> Option<Arc<CacheEntry>> {
        self.entries
            .get(&BodyKey::of(body))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the current entries, so callers never hold a map shard
    /// while calling into an entry.
    pub(crate) fn entries(&self) -> Vec<Arc<CacheEntry>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry from the map and return them.
    pub(crate) fn drain(&self) -> Vec<Arc<CacheEntry>> {
        let mut drained = Vec::with_capacity(self.entries.len());
        self.entries.retain(|_, entry| {
            drained.push(Arc::clone(entry));
            false
        });
        drained
    }
}

impl fmt::Debug for CachedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedHandler")
            .field("name", &self.name)
            .field("entries", &self.len())
            .field("watches", &self.on_watch.is_some())
            .finish()
    }
}

pub(crate) struct ActionHandler {
    run: ActionFn,
}

impl ActionHandler {
    pub(crate) fn run(&self, body: Value, setter: Setter) -> FetchFuture {
        (self.run)(body, setter)
    }
}

enum Registered {
    Action(ActionHandler),
    Cached(Arc<CachedHandler>),
}

impl Registered {
    fn kind(&self) -> HandlerKind {
        match self {
            Registered::Action(_) => HandlerKind::Action,
            Registered::Cached(_) => HandlerKind::Cached,
        }
    }
}

/// Every handler of one cache instance, by name.
pub(crate) struct Registry {
    handlers: BTreeMap<Arc<str>, Registered>,
}

impl Registry {
    pub(crate) fn new<I, N>(handlers: I, config: &CacheConfig) -> Self
    where
        I: IntoIterator<Item = (N, Handler)>,
        N: Into<String>,
    {
        let mut registered = BTreeMap::new();
        for (name, handler) in handlers {
            let name: Arc<str> = Arc::from(name.into());
            let entry = match handler.0 {
                Definition::Action { run } => Registered::Action(ActionHandler { run }),
                Definition::Cached { fetch, on_watch } => {
                    Registered::Cached(Arc::new(CachedHandler {
                        name: Arc::clone(&name),
                        fetch,
                        on_watch,
                        cache_timeout: config.cache_timeout,
                        entries: DashMap::new(),
                    }))
                }
            };
            if let Some(previous) = registered.insert(Arc::clone(&name), entry) {
                warn!(
                    handler = %name,
                    replaced = ?previous.kind(),
                    "Handler declared twice; keeping the later definition"
                );
            }
        }
        Self {
            handlers: registered,
        }
    }

    /// The cached handler called `name`, warning when there is none.
    pub(crate) fn cached(&self, name: &str, op: &'static str) -> Option<&Arc<CachedHandler>> {
        match self.handlers.get(name) {
            Some(Registered::Cached(handler)) => Some(handler),
            Some(Registered::Action(_)) => {
                warn!(handler = name, op, "Handler is an action, not a cached fetch");
                None
            }
            None => {
                warn!(handler = name, op, "Unknown handler");
                None
            }
        }
    }

    /// The action called `name`, warning when there is none.
    pub(crate) fn action(&self, name: &str, op: &'static str) -> Option<&ActionHandler> {
        match self.handlers.get(name) {
            Some(Registered::Action(handler)) => Some(handler),
            Some(Registered::Cached(_)) => {
                warn!(handler = name, op, "Handler is a cached fetch, not an action");
                None
            }
            None => {
                warn!(handler = name, op, "Unknown handler");
                None
            }
        }
    }

    /// Every cached handler, in name order.
    pub(crate) fn cached_handlers(&self) -> impl Iterator<Item = &Arc<CachedHandler>> {
        self.handlers.values().filter_map(|handler| match handler {
            Registered::Cached(handler) => Some(handler),
            Registered::Action(_) => None,
        })
    }

    pub(crate) fn kind(&self, name: &str) -> Option<HandlerKind> {
        self.handlers.get(name).map(Registered::kind)
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|name| name.as_ref())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.handlers
                    .iter()
                    .map(|(name, handler)| (name, handler.kind())),
            )
            .finish()
    }
}
