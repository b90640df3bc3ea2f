//! Consumer-facing cache handle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use super::binding::{Transform, Watch};
use super::config::CacheConfig;
use super::entry::{CacheEntry, PendingFetch};
use super::error::FetchError;
use super::handler::{Handler, HandlerKind};
use super::helpers::UseHelpers;
use super::keys::default_body;
use super::registry::Registry;
use super::setter::Setter;

/// One independent cache: its handlers, their entries and timers.
///
/// Cloning is cheap and every clone shares the same state. Every operation
/// that names an unknown handler logs a warning and returns `None`.
#[derive(Clone)]
pub struct RequestCache {
    registry: Arc<Registry>,
}

impl RequestCache {
    pub fn new<I, N>(handlers: I, config: CacheConfig) -> Self
    where
        I: IntoIterator<Item = (N, Handler)>,
        N: Into<String>,
    {
        let registry = Registry::new(handlers, &config);
        info!(
            handlers = registry.names().count(),
            cache_timeout = ?config.cache_timeout,
            "Request cache created"
        );
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn builder() -> RequestCacheBuilder {
        RequestCacheBuilder::default()
    }

    /// Watch the cached value of `name` for `body` (`{}` when absent).
    pub fn watch(&self, name: &str, body: Option<Value>) -> Option<Watch<Value>> {
        self.watch_with(name, body, |value: &Value, _: &UseHelpers| value.clone())
    }

    /// Watch the cached value, mapped through `transform` on every read and
    /// every notification.
    pub fn watch_with<T, F>(&self, name: &str, body: Option<Value>, transform: F) -> Option<Watch<T>>
    where
        T: Clone + Send + 'static,
        F: Fn(&Value, &UseHelpers) -> T + Send + Sync + 'static,
    {
        let handler = self.registry.cached(name, "watch")?;
        let transform: Transform<T> = Arc::new(transform);
        Some(Watch::mount(
            Arc::clone(handler),
            body.unwrap_or_else(default_body),
            transform,
        ))
    }

    /// Run the action `name` with a setter over this cache. The action's
    /// result is passed through untouched.
    pub async fn dispatch(
        &self,
        name: &str,
        body: Option<Value>,
    ) -> Option<Result<Value, FetchError>> {
        let run = self
            .registry
            .action(name, "dispatch")?
            .run(body.unwrap_or_else(default_body), self.setter());
        debug!(handler = name, "Action dispatched");
        Some(run.await)
    }

    /// Fetch `body` again, even if a fetch is already running. Creates the
    /// entry if this body has never been seen.
    pub fn reload(&self, name: &str, body: Option<Value>) -> Option<PendingFetch> {
        let handler = self.registry.cached(name, "reload")?;
        let body = body.unwrap_or_else(default_body);
        let entry = handler.ensure_entry(body.clone());
        Some(entry.make_request(handler.fetch(body)))
    }

    /// Warm the cache for `body` without watching it.
    ///
    /// Starts a fetch only when the entry has never settled and none is
    /// running. Returns the fetch that will fill the entry, or `None` when
    /// the entry already holds a result.
    pub fn preload(&self, name: &str, body: Option<Value>) -> Option<PendingFetch> {
        let handler = self.registry.cached(name, "preload")?;
        let body = body.unwrap_or_else(default_body);
        let entry = handler.ensure_entry(body.clone());
        let fetcher = Arc::clone(handler);
        entry
            .request_if_idle(move || fetcher.fetch(body))
            .or_else(|| entry.pending().filter(|_| !entry.initialized()))
    }

    /// The entry for `body`, without creating it.
    pub fn entry(&self, name: &str, body: Option<Value>) -> Option<Arc<CacheEntry>> {
        self.registry
            .cached(name, "entry")?
            .get_entry(&body.unwrap_or_else(default_body))
    }

    /// Every entry currently held for `name`.
    pub fn entries(&self, name: &str) -> Option<Vec<Arc<CacheEntry>>> {
        Some(self.registry.cached(name, "entries")?.entries())
    }

    pub fn kind(&self, name: &str) -> Option<HandlerKind> {
        self.registry.kind(name)
    }

    /// A generic setter over every cached handler.
    pub fn setter(&self) -> Setter {
        Setter::new(Arc::clone(&self.registry))
    }

    pub fn actions(&self) -> CacheActions {
        CacheActions {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCache")
            .field("handlers", &self.registry)
            .finish()
    }
}

/// Imperative operations over whole handlers.
#[derive(Clone)]
pub struct CacheActions {
    registry: Arc<Registry>,
}

impl CacheActions {
    /// Refetch every body known under `name`. Returns how many fetches started.
    pub fn reload_all(&self, name: &str) -> Option<usize> {
        let handler = self.registry.cached(name, "reload_all")?;
        let entries = handler.entries();
        for entry in &entries {
            entry.make_request(handler.fetch(entry.body().clone()));
        }
        debug!(handler = name, entries = entries.len(), "Reloaded all entries");
        Some(entries.len())
    }

    /// Empty every cached handler immediately. Each removed entry runs its
    /// watch cleanup and notifies its listeners with `None`. Returns how many
    /// entries were removed.
    pub fn reset_all(&self) -> usize {
        let mut removed = 0;
        for handler in self.registry.cached_handlers() {
            for entry in handler.drain() {
                entry.reset();
                removed += 1;
            }
        }
        info!(entries = removed, "Reset all cached entries");
        removed
    }
}

impl fmt::Debug for CacheActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheActions").finish_non_exhaustive()
    }
}

/// Collects handler declarations for a [`RequestCache`].
#[derive(Default)]
pub struct RequestCacheBuilder {
    handlers: Vec<(String, Handler)>,
    config: CacheConfig,
}

impl RequestCacheBuilder {
    pub fn handler(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.handlers.push((name.into(), handler));
        self
    }

    pub fn cached<F, Fut>(self, name: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        self.handler(name, Handler::cached(fetch))
    }

    pub fn action<F, Fut>(self, name: impl Into<String>, run: F) -> Self
    where
        F: Fn(Value, Setter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        self.handler(name, Handler::action(run))
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache_timeout(mut self, timeout: Duration) -> Self {
        self.config.cache_timeout = timeout;
        self
    }

    pub fn build(self) -> RequestCache {
        RequestCache::new(self.handlers, self.config)
    }
}
