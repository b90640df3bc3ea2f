//! Cache entry state machine.
//!
//! One entry holds the cached result for one (handler, body key) pair:
//!
//! - fetch state: `Idle -> Pending -> Resolved | Errored`, where a reload moves
//!   back to `Pending` while the previous response or error stays readable;
//! - watch state: the number of registered listeners, which drives the
//!   `on_watch` session and the eviction timer.
//!
//! Listeners are always called after the state lock is released, so they may
//! call back into the cache.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::error::FetchError;
use super::keys::BodyKey;
use super::lock::mutex_lock;
use super::notify::{Listener, ListenerId, Notifier, notify_all};
use super::runtime::spawn_detached;

const SOURCE: &str = "cache::entry";

pub const METRIC_FETCH_TOTAL: &str = "rcache_fetch_total";
pub const METRIC_EVICTION_TOTAL: &str = "rcache_eviction_total";

/// Future produced by a fetch function.
pub type FetchFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// Returned by an `on_watch` hook; runs when the entry is evicted or reset.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Called when a watch session opens on the entry.
pub(crate) type ActivateFn = Box<dyn Fn() -> Option<Cleanup> + Send + Sync>;

/// Incremented on every reset. Settlements that started under an older epoch
/// are ignored.
pub(crate) type Epoch = u64;

/// Observable fetch state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// No fetch has settled and none is running.
    Idle,
    /// A fetch is in flight. A previous response or error may still be visible.
    Pending,
    /// The last settled fetch succeeded.
    Resolved,
    /// The last settled fetch failed.
    Errored,
}

/// Handle to an in-flight fetch.
///
/// Completes once the fetch has settled and the entry has been updated.
/// Cloning is cheap; every clone completes together.
#[derive(Clone)]
pub struct PendingFetch {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl PendingFetch {
    fn new(task: BoxFuture<'static, ()>) -> Self {
        Self {
            inner: task.shared(),
        }
    }

    /// Whether the fetch has already settled.
    pub fn is_settled(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl Future for PendingFetch {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for PendingFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingFetch")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Options an entry is created with.
pub(crate) struct EntryOptions {
    pub cache_timeout: Duration,
    pub on_active: Option<ActivateFn>,
}

/// Consistent copy of the readable fields, taken under one lock.
#[derive(Debug, Clone)]
pub struct EntryView {
    pub response: Option<Value>,
    pub initialized: bool,
    pub error: Option<FetchError>,
    pub pending: Option<PendingFetch>,
}

struct InFlight {
    id: u64,
    handle: PendingFetch,
}

struct EvictionTimer {
    id: u64,
    task: JoinHandle<()>,
}

impl EvictionTimer {
    fn cancel(self) {
        self.task.abort();
    }
}

// An open session means `on_active` has run and its cleanup is owed.
struct WatchSession {
    cleanup: Option<Cleanup>,
}

#[derive(Default)]
struct EntryState {
    response: Option<Value>,
    initialized: bool,
    pending: Option<InFlight>,
    error: Option<FetchError>,
    notifier: Notifier,
    watchers: usize,
    session: Option<WatchSession>,
    eviction: Option<EvictionTimer>,
    epoch: Epoch,
    fetch_seq: u64,
    timer_seq: u64,
}

impl EntryState {
    // Returns the cleanup and listeners, which must run outside the lock.
    fn clear(&mut self) -> Cleared {
        if let Some(timer) = self.eviction.take() {
            timer.cancel();
        }
        self.response = None;
        self.initialized = false;
        self.pending = None;
        self.error = None;
        self.watchers = 0;
        self.epoch += 1;
        Cleared {
            cleanup: self.session.take().and_then(|session| session.cleanup),
            listeners: self.notifier.drain(),
        }
    }
}

struct Cleared {
    cleanup: Option<Cleanup>,
    listeners: Vec<Listener>,
}

impl Cleared {
    fn finish(self) {
        if let Some(cleanup) = self.cleanup {
            cleanup();
        }
        notify_all(&self.listeners, None);
    }
}

/// One cached result for one exact (handler, body) pair.
pub struct CacheEntry {
    handler: Arc<str>,
    body: Value,
    key: BodyKey,
    options: EntryOptions,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub(crate) fn new(handler: Arc<str>, body: Value, options: EntryOptions) -> Arc<Self> {
        let key = BodyKey::of(&body);
        Arc::new(Self {
            handler,
            body,
            key,
            options,
            state: Mutex::new(EntryState::default()),
        })
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn key(&self) -> &BodyKey {
        &self.key
    }

    pub fn response(&self) -> Option<Value> {
        mutex_lock(&self.state, SOURCE, "response").response.clone()
    }

    pub fn initialized(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "initialized").initialized
    }

    pub fn error(&self) -> Option<FetchError> {
        mutex_lock(&self.state, SOURCE, "error").error.clone()
    }

    /// Handle to the fetch currently tracked, if any.
    pub fn pending(&self) -> Option<PendingFetch> {
        mutex_lock(&self.state, SOURCE, "pending")
            .pending
            .as_ref()
            .map(|in_flight| in_flight.handle.clone())
    }

    pub fn view(&self) -> EntryView {
        let state = mutex_lock(&self.state, SOURCE, "view");
        EntryView {
            response: state.response.clone(),
            initialized: state.initialized,
            error: state.error.clone(),
            pending: state
                .pending
                .as_ref()
                .map(|in_flight| in_flight.handle.clone()),
        }
    }

    pub fn status(&self) -> EntryStatus {
        let state = mutex_lock(&self.state, SOURCE, "status");
        if state.pending.is_some() {
            EntryStatus::Pending
        } else if !state.initialized {
            EntryStatus::Idle
        } else if state.error.is_some() {
            EntryStatus::Errored
        } else {
            EntryStatus::Resolved
        }
    }

    /// Whether at least one listener is registered.
    pub fn is_active(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_active").watchers > 0
    }

    pub fn listener_count(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "listener_count")
            .notifier
            .len()
    }

    /// Whether `id` is still registered. A reset drops every listener.
    pub fn has_listener(&self, id: ListenerId) -> bool {
        mutex_lock(&self.state, SOURCE, "has_listener")
            .notifier
            .contains(id)
    }

    pub fn eviction_scheduled(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "eviction_scheduled")
            .eviction
            .is_some()
    }

    /// Track `fetch` as the entry's current fetch.
    ///
    /// The fetch is spawned on the ambient runtime. Calling this again before
    /// it settles is allowed: the new fetch becomes the tracked one, but the
    /// old one is not cancelled and still writes its result when it settles.
    /// Whichever settles last determines the visible state.
    pub fn make_request(self: &Arc<Self>, fetch: FetchFuture) -> PendingFetch {
        let mut state = mutex_lock(&self.state, SOURCE, "make_request");
        let handle = self.start(&mut state, fetch);
        drop(state);

        spawn_detached(handle.clone(), "make_request");
        handle
    }

    /// Start a fetch only if the entry has never settled and none is running.
    ///
    /// The check and the slot reservation happen under one lock, so concurrent
    /// callers produce at most one fetch. `fetch` is only called when a fetch
    /// starts, and only once the fetch is first polled, after the lock is
    /// released.
    pub fn request_if_idle<F>(self: &Arc<Self>, fetch: F) -> Option<PendingFetch>
    where
        F: FnOnce() -> FetchFuture + Send + 'static,
    {
        let mut state = mutex_lock(&self.state, SOURCE, "request_if_idle");
        if state.initialized || state.pending.is_some() {
            return None;
        }
        let handle = self.start(&mut state, async move { fetch().await }.boxed());
        drop(state);

        spawn_detached(handle.clone(), "request_if_idle");
        Some(handle)
    }

    fn start(self: &Arc<Self>, state: &mut EntryState, fetch: FetchFuture) -> PendingFetch {
        state.fetch_seq += 1;
        let id = state.fetch_seq;
        let epoch = state.epoch;

        let entry = Arc::downgrade(self);
        let handle = PendingFetch::new(
            async move {
                let outcome = fetch.await;
                if let Some(entry) = entry.upgrade() {
                    entry.settle(epoch, id, outcome);
                }
            }
            .boxed(),
        );

        if let Some(previous) = state.pending.replace(InFlight {
            id,
            handle: handle.clone(),
        }) {
            debug!(
                handler = %self.handler,
                body_key = %self.key,
                superseded = previous.id,
                fetch = id,
                "Fetch started while another is in flight"
            );
        } else {
            debug!(handler = %self.handler, body_key = %self.key, fetch = id, "Fetch started");
        }
        handle
    }

    fn settle(&self, epoch: Epoch, id: u64, outcome: Result<Value, FetchError>) {
        let mut state = mutex_lock(&self.state, SOURCE, "settle");
        if state.epoch != epoch {
            trace!(
                handler = %self.handler,
                body_key = %self.key,
                fetch = id,
                "Ignoring settlement of a fetch started before reset"
            );
            return;
        }
        if state
            .pending
            .as_ref()
            .is_some_and(|in_flight| in_flight.id == id)
        {
            state.pending = None;
        }
        state.initialized = true;

        match outcome {
            Ok(value) => {
                counter!(METRIC_FETCH_TOTAL, "handler" => self.handler.to_string(), "outcome" => "ok")
                    .increment(1);
                state.error = None;
                state.response = Some(value.clone());
                let listeners = state.notifier.snapshot();
                drop(state);

                debug!(handler = %self.handler, body_key = %self.key, fetch = id, "Fetch resolved");
                notify_all(&listeners, Some(&value));
            }
            Err(error) => {
                counter!(METRIC_FETCH_TOTAL, "handler" => self.handler.to_string(), "outcome" => "error")
                    .increment(1);
                warn!(
                    handler = %self.handler,
                    body_key = %self.key,
                    fetch = id,
                    error = %error,
                    "Fetch failed"
                );
                state.error = Some(error);
            }
        }
    }

    /// Replace the response without fetching and notify every listener.
    pub fn set_response(&self, value: Value) {
        let mut state = mutex_lock(&self.state, SOURCE, "set_response");
        state.response = Some(value.clone());
        let listeners = state.notifier.snapshot();
        drop(state);

        notify_all(&listeners, Some(&value));
    }

    /// Register a listener.
    ///
    /// Cancels a scheduled eviction. If no watch session is open, opens one
    /// and runs the entry's `on_active` hook, keeping its cleanup until the
    /// entry is evicted or reset.
    pub fn register_listener(self: &Arc<Self>, listener: Listener) -> ListenerId {
        let mut state = mutex_lock(&self.state, SOURCE, "register_listener");
        if let Some(timer) = state.eviction.take() {
            trace!(handler = %self.handler, body_key = %self.key, "Eviction cancelled");
            timer.cancel();
        }
        let id = state.notifier.subscribe(listener);
        state.watchers += 1;

        let opens_session = state.session.is_none();
        if opens_session {
            state.session = Some(WatchSession { cleanup: None });
        }
        let epoch = state.epoch;
        drop(state);

        if opens_session {
            self.activate(epoch);
        }
        id
    }

    fn activate(&self, epoch: Epoch) {
        let Some(on_active) = self.options.on_active.as_ref() else {
            return;
        };
        debug!(handler = %self.handler, body_key = %self.key, "Watch session opened");
        let cleanup = on_active();

        let mut state = mutex_lock(&self.state, SOURCE, "activate");
        if state.epoch == epoch
            && let Some(session) = state.session.as_mut()
        {
            session.cleanup = cleanup;
            return;
        }
        drop(state);

        // Reset while the hook ran; the session it belonged to is gone.
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    /// Deregister a listener. When the last one leaves, schedule eviction
    /// after the configured timeout.
    pub fn deregister_listener(self: &Arc<Self>, id: ListenerId) {
        let mut state = mutex_lock(&self.state, SOURCE, "deregister_listener");
        if !state.notifier.unsubscribe(id) {
            return;
        }
        state.watchers = state.watchers.saturating_sub(1);
        if state.watchers == 0 {
            self.schedule_eviction(&mut state);
        }
    }

    fn schedule_eviction(self: &Arc<Self>, state: &mut EntryState) {
        if let Some(timer) = state.eviction.take() {
            timer.cancel();
        }
        state.timer_seq += 1;
        let id = state.timer_seq;
        let timeout = self.options.cache_timeout;
        let entry: Weak<Self> = Arc::downgrade(self);

        let task = spawn_detached(
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(entry) = entry.upgrade() {
                    entry.evict(id);
                }
            },
            "schedule_eviction",
        );
        if let Some(task) = task {
            debug!(
                handler = %self.handler,
                body_key = %self.key,
                timeout = ?timeout,
                "Eviction scheduled"
            );
            state.eviction = Some(EvictionTimer { id, task });
        }
    }

    fn evict(&self, timer: u64) {
        let mut state = mutex_lock(&self.state, SOURCE, "evict");
        if state.eviction.as_ref().is_none_or(|t| t.id != timer) {
            return;
        }
        // This is the running timer; detach it so clearing does not abort it.
        state.eviction = None;
        if state.watchers > 0 {
            return;
        }
        let cleared = state.clear();
        drop(state);

        counter!(METRIC_EVICTION_TOTAL, "handler" => self.handler.to_string()).increment(1);
        debug!(handler = %self.handler, body_key = %self.key, "Entry evicted");
        cleared.finish();
    }

    /// Return to `Idle`: run the watch cleanup, notify every listener with
    /// `None`, then drop all listeners and any scheduled eviction.
    pub fn reset(&self) {
        let cleared = mutex_lock(&self.state, SOURCE, "reset").clear();
        debug!(handler = %self.handler, body_key = %self.key, "Entry reset");
        cleared.finish();
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("handler", &self.handler)
            .field("key", &self.key)
            .field("status", &self.status())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
