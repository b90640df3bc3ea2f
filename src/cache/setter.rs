//! Setter protocol.
//!
//! A setter walks initialized entries and hands each one's body and current
//! response to a callback. The callback answers with a new value, or with one
//! of two sentinels: [`SetResult::Reload`] refetches the entry in place and
//! [`SetResult::Noop`] leaves it alone.

use std::fmt;
use std::sync::{Arc, Weak};

use metrics::counter;
use serde_json::Value;
use tracing::{debug, trace};

use super::helpers::SetHelpers;
use super::registry::{CachedHandler, Registry};

pub const METRIC_SETTER_APPLY_TOTAL: &str = "rcache_setter_apply_total";

/// What a setter callback wants done with one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SetResult {
    /// Replace the response and notify listeners.
    Value(Value),
    /// Refetch the entry's body with the handler's fetch function.
    Reload,
    /// Leave the entry untouched.
    Noop,
}

impl From<Value> for SetResult {
    fn from(value: Value) -> Self {
        SetResult::Value(value)
    }
}

/// Setter handed to actions; reaches every cached handler of the cache.
#[derive(Clone)]
pub struct Setter {
    registry: Arc<Registry>,
}

impl Setter {
    pub const RELOAD: SetResult = SetResult::Reload;
    pub const NOOP: SetResult = SetResult::Noop;

    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Run `update` over every initialized entry of the handler `name`.
    ///
    /// An unknown name, or one naming an action, logs a warning and does nothing.
    pub fn set<F>(&self, name: &str, mut update: F)
    where
        F: FnMut(&Value, Option<&Value>, &SetHelpers) -> SetResult,
    {
        if let Some(handler) = self.registry.cached(name, "set") {
            apply(handler, &mut update, Compare::Always);
        }
    }

    /// Run `update` over every initialized entry of every cached handler.
    pub fn set_all<F>(&self, mut update: F)
    where
        F: FnMut(&Value, Option<&Value>, &SetHelpers) -> SetResult,
    {
        for handler in self.registry.cached_handlers() {
            apply(handler, &mut update, Compare::Always);
        }
    }
}

impl fmt::Debug for Setter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setter").finish_non_exhaustive()
    }
}

/// Setter bound to one cached handler, handed to its `on_watch` hook.
///
/// Holds the handler weakly: once the cache is dropped, `set` does nothing.
#[derive(Clone)]
pub struct ScopedSetter {
    handler: Weak<CachedHandler>,
}

impl ScopedSetter {
    pub const RELOAD: SetResult = SetResult::Reload;
    pub const NOOP: SetResult = SetResult::Noop;

    pub(crate) fn new(handler: &Arc<CachedHandler>) -> Self {
        Self {
            handler: Arc::downgrade(handler),
        }
    }

    /// Run `update` over every initialized entry of the bound handler.
    ///
    /// A returned value equal to the current response is not applied, so
    /// listeners are not notified of a change that did not happen.
    pub fn set<F>(&self, mut update: F)
    where
        F: FnMut(&Value, Option<&Value>, &SetHelpers) -> SetResult,
    {
        match self.handler.upgrade() {
            Some(handler) => apply(&handler, &mut update, Compare::SkipEqual),
            None => trace!("Scoped setter outlived its cache"),
        }
    }
}

impl fmt::Debug for ScopedSetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSetter")
            .field("live", &(self.handler.strong_count() > 0))
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Compare {
    Always,
    SkipEqual,
}

fn apply<F>(handler: &Arc<CachedHandler>, update: &mut F, compare: Compare)
where
    F: FnMut(&Value, Option<&Value>, &SetHelpers) -> SetResult,
{
    for entry in handler.entries() {
        let view = entry.view();
        if !view.initialized {
            continue;
        }
        let result = match update(entry.body(), view.response.as_ref(), &SetHelpers) {
            SetResult::Noop => "noop",
            SetResult::Reload => {
                entry.make_request(handler.fetch(entry.body().clone()));
                "reload"
            }
            SetResult::Value(value) => {
                if compare == Compare::SkipEqual && view.response.as_ref() == Some(&value) {
                    "unchanged"
                } else {
                    entry.set_response(value);
                    "value"
                }
            }
        };
        counter!(
            METRIC_SETTER_APPLY_TOTAL,
            "handler" => handler.name().to_string(),
            "result" => result
        )
        .increment(1);
        debug!(handler = handler.name(), body_key = %entry.key(), result, "Setter applied");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::handler::Handler;
    use crate::cache::notify::Listener;

    struct Fixture {
        registry: Arc<Registry>,
        fetches: Arc<Mutex<Vec<Value>>>,
    }

    fn fixture() -> Fixture {
        let fetches = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&fetches);
        let registry = Arc::new(Registry::new(
            [
                (
                    "todos",
                    Handler::cached(move |body: Value| {
                        log.lock().unwrap().push(body);
                        async { Ok(json!([{"id": 1, "name": "a"}])) }
                    }),
                ),
                ("users", Handler::cached(|_| async { Ok(json!(["u"])) })),
            ],
            &CacheConfig::default(),
        ));
        Fixture { registry, fetches }
    }

    fn recorder() -> (Listener, Arc<Mutex<Vec<Option<Value>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |value: Option<&Value>| {
            sink.lock().unwrap().push(value.cloned());
        });
        (listener, seen)
    }

    fn handler(fixture: &Fixture, name: &str) -> Arc<CachedHandler> {
        Arc::clone(fixture.registry.cached(name, "test").expect("cached handler"))
    }

    #[tokio::test]
    async fn insert_helper_round_trips_to_listeners() {
        let fixture = fixture();
        let todos = handler(&fixture, "todos");
        let entry = todos.ensure_entry(json!({}));
        entry.make_request(todos.fetch(json!({}))).await;
        let (listener, seen) = recorder();
        entry.register_listener(listener);

        Setter::new(Arc::clone(&fixture.registry)).set("todos", |_, items, helpers| {
            let items = items.cloned().unwrap_or_else(|| json!([]));
            helpers.insert(&items, json!({"id": 2, "name": "b"})).into()
        });

        let expected = json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]);
        assert_eq!(entry.response(), Some(expected.clone()));
        assert_eq!(*seen.lock().unwrap(), vec![Some(expected)]);
    }

    #[tokio::test]
    async fn reload_sentinel_refetches_with_the_entry_body() {
        let fixture = fixture();
        let todos = handler(&fixture, "todos");
        let entry = todos.ensure_entry(json!({"id": 1}));
        entry.make_request(todos.fetch(json!({"id": 1}))).await;
        fixture.fetches.lock().unwrap().clear();

        Setter::new(Arc::clone(&fixture.registry)).set("todos", |_, _, _| Setter::RELOAD);

        assert_eq!(*fixture.fetches.lock().unwrap(), vec![json!({"id": 1})]);
        let pending = entry.pending().expect("reload in flight");
        pending.await;
        assert!(entry.pending().is_none());
    }

    #[tokio::test]
    async fn uninitialized_entries_are_skipped() {
        let fixture = fixture();
        let todos = handler(&fixture, "todos");
        todos.ensure_entry(json!({"id": 1}));
        let calls = AtomicUsize::new(0);

        Setter::new(Arc::clone(&fixture.registry)).set_all(|_, _, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Setter::NOOP
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_all_visits_every_cached_handler() {
        let fixture = fixture();
        for name in ["todos", "users"] {
            let handler = handler(&fixture, name);
            let entry = handler.ensure_entry(json!({}));
            entry.make_request(handler.fetch(json!({}))).await;
        }
        let mut visited = Vec::new();

        Setter::new(Arc::clone(&fixture.registry)).set_all(|_, response, _| {
            visited.push(response.cloned());
            SetResult::Noop
        });

        assert_eq!(visited.len(), 2);
    }

    #[tokio::test]
    async fn noop_leaves_entry_untouched() {
        let fixture = fixture();
        let users = handler(&fixture, "users");
        let entry = users.ensure_entry(json!({}));
        entry.make_request(users.fetch(json!({}))).await;
        let (listener, seen) = recorder();
        entry.register_listener(listener);

        Setter::new(Arc::clone(&fixture.registry)).set("users", |_, _, _| Setter::NOOP);

        assert_eq!(entry.response(), Some(json!(["u"])));
        assert!(seen.lock().unwrap().is_empty());
        assert!(entry.pending().is_none());
    }

    #[tokio::test]
    async fn generic_setter_notifies_even_when_unchanged() {
        let fixture = fixture();
        let users = handler(&fixture, "users");
        let entry = users.ensure_entry(json!({}));
        entry.make_request(users.fetch(json!({}))).await;
        let (listener, seen) = recorder();
        entry.register_listener(listener);

        Setter::new(Arc::clone(&fixture.registry)).set("users", |_, current, _| {
            SetResult::Value(current.cloned().unwrap_or_default())
        });

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scoped_setter_skips_equal_values() {
        let fixture = fixture();
        let users = handler(&fixture, "users");
        let entry = users.ensure_entry(json!({}));
        entry.make_request(users.fetch(json!({}))).await;
        let (listener, seen) = recorder();
        entry.register_listener(listener);
        let scoped = ScopedSetter::new(&users);

        scoped.set(|_, current, _| {
            SetResult::Value(current.cloned().unwrap_or_default())
        });
        assert!(seen.lock().unwrap().is_empty());

        scoped.set(|_, _, _| json!(["v"]).into());
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(["v"]))]);
    }

    #[test]
    fn unknown_handler_is_a_noop() {
        let fixture = fixture();
        let mut called = false;
        Setter::new(Arc::clone(&fixture.registry)).set("missing", |_, _, _| {
            called = true;
            Setter::NOOP
        });
        assert!(!called);
    }

    #[test]
    fn scoped_setter_outliving_its_handler_does_nothing() {
        let scoped = {
            let fixture = fixture();
            ScopedSetter::new(&handler(&fixture, "users"))
        };
        let mut called = false;
        scoped.set(|_, _, _| {
            called = true;
            ScopedSetter::NOOP
        });
        assert!(!called);
    }
}
