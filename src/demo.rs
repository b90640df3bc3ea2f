//! Scripted walk through the cache lifecycle against an in-memory todo store.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rcache::cache::{
    CacheConfig, Cleanup, FetchError, Handler, Lookup, RequestCache, Setter, fetch_error,
};
use rcache::config::DemoSettings;
use rcache::error::AppError;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::info;

const EVICTION_MARGIN: Duration = Duration::from_millis(20);

#[derive(Clone)]
struct TodoStore {
    items: Arc<Mutex<Vec<Value>>>,
    next_id: Arc<AtomicU64>,
    fetches: Arc<AtomicUsize>,
    latency: Duration,
}

impl TodoStore {
    fn seeded(latency: Duration) -> Self {
        let items = vec![
            json!({"id": 1, "title": "Read the cache docs", "done": false}),
            json!({"id": 2, "title": "Wire up the fetcher", "done": true}),
        ];
        Self {
            next_id: Arc::new(AtomicU64::new(items.len() as u64 + 1)),
            items: Arc::new(Mutex::new(items)),
            fetches: Arc::new(AtomicUsize::new(0)),
            latency,
        }
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn with_items<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> Result<R, FetchError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| FetchError::new("todo store lock poisoned"))?;
        Ok(f(&mut items))
    }

    async fn list(&self, done: Option<bool>) -> Result<Value, FetchError> {
        sleep(self.latency).await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.with_items(|items| {
            Value::Array(
                items
                    .iter()
                    .filter(|todo| done.is_none_or(|done| todo["done"] == done))
                    .cloned()
                    .collect(),
            )
        })
    }

    async fn get(&self, id: Value) -> Result<Value, FetchError> {
        sleep(self.latency).await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.with_items(|items| items.iter().find(|todo| todo["id"] == id).cloned())?
            .ok_or_else(|| fetch_error(format!("todo {id} not found")))
    }

    fn add(&self, title: &str) -> Result<Value, FetchError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let todo = json!({"id": id, "title": title, "done": false});
        self.with_items(|items| items.push(todo.clone()))?;
        Ok(todo)
    }

    fn toggle(&self, id: &Value) -> Result<bool, FetchError> {
        self.with_items(|items| {
            let todo = items.iter_mut().find(|todo| todo["id"] == *id)?;
            let done = !todo["done"].as_bool().unwrap_or(false);
            todo["done"] = Value::Bool(done);
            Some(done)
        })?
        .ok_or_else(|| fetch_error(format!("todo {id} not found")))
    }
}

fn build_cache(store: &TodoStore, config: CacheConfig) -> RequestCache {
    let list = store.clone();
    let single = store.clone();
    let adder = store.clone();
    let toggler = store.clone();

    RequestCache::builder()
        .config(config)
        .cached("todos", move |body: Value| {
            let store = list.clone();
            async move { store.list(body.get("done").and_then(Value::as_bool)).await }
        })
        .handler(
            "todo",
            Handler::cached(move |body: Value| {
                let store = single.clone();
                async move { store.get(body["id"].clone()).await }
            })
            .on_watch(|body, _| {
                info!(todo = %body, "Watching todo");
                Some(Box::new(move || info!(todo = %body, "Stopped watching todo")) as Cleanup)
            }),
        )
        .action("add_todo", move |body: Value, setter: Setter| {
            let store = adder.clone();
            async move {
                let title = body
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FetchError::new("title is required"))?;
                let todo = store.add(title)?;
                setter.set("todos", |filter, items, helpers| {
                    match (items, filter.get("done").and_then(Value::as_bool)) {
                        (Some(items), None | Some(false)) => {
                            helpers.insert(items, todo.clone()).into()
                        }
                        _ => Setter::NOOP,
                    }
                });
                Ok(todo)
            }
        })
        .action("toggle_todo", move |body: Value, setter: Setter| {
            let store = toggler.clone();
            async move {
                let id = body["id"].clone();
                let done = store.toggle(&id)?;
                setter.set("todos", |filter, items, helpers| match (filter.get("done"), items) {
                    (None, Some(items)) => helpers.update(items, &id, &json!({"done": done})).into(),
                    _ => Setter::RELOAD,
                });
                setter.set("todo", |todo, _, _| {
                    if todo["id"] == id {
                        Setter::RELOAD
                    } else {
                        Setter::NOOP
                    }
                });
                Ok(json!({"id": id, "done": done}))
            }
        })
        .build()
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, AppError> {
    value.ok_or_else(|| AppError::unexpected(format!("demo handler `{what}` is not registered")))
}

fn list_len(value: &Value) -> usize {
    value.as_array().map_or(0, Vec::len)
}

pub async fn run(config: CacheConfig, demo: &DemoSettings) -> Result<(), AppError> {
    let store = TodoStore::seeded(demo.fetch_latency);
    let timeout = config.cache_timeout;
    let cache = build_cache(&store, config);

    let mut all = required(cache.watch("todos", None), "todos")?;
    match all.read() {
        Lookup::Pending(_) => info!("First read is pending"),
        other => info!(ready = other.is_ready(), "First read settled immediately"),
    }
    let todos = all.resolve().await?;
    info!(count = list_len(&todos), "Todos loaded");

    let again = required(cache.watch("todos", Some(json!({}))), "todos")?;
    info!(
        ready = again.read().is_ready(),
        fetches = store.fetch_count(),
        "Second watcher shares the entry"
    );

    let open = required(
        cache.watch_with("todos", Some(json!({"done": false})), |value, _| {
            list_len(value)
        }),
        "todos",
    )?;
    info!(open = open.resolve().await?, "Open todos loaded");

    let added = required(
        cache
            .dispatch("add_todo", Some(json!({"title": "Write the changelog"})))
            .await,
        "add_todo",
    )??;
    all.changed().await;
    info!(
        todo = %added,
        count = all.snapshot().as_ref().map_or(0, list_len),
        open = open.snapshot().unwrap_or_default(),
        fetches = store.fetch_count(),
        "Todo added without refetching"
    );

    let toggled = required(
        cache.dispatch("toggle_todo", Some(json!({"id": 1}))).await,
        "toggle_todo",
    )??;
    if let Some(pending) = open.entry().pending() {
        pending.await;
    }
    info!(
        toggled = %toggled,
        open = open.read().ready().unwrap_or_default(),
        "Filtered list reloaded after toggle"
    );

    let first = required(cache.watch("todo", Some(json!({"id": 1}))), "todo")?;
    info!(todo = %first.resolve().await?, "Single todo loaded");

    let reloaded = required(cache.actions().reload_all("todos"), "todos")?;
    for entry in cache.entries("todos").unwrap_or_default() {
        if let Some(pending) = entry.pending() {
            pending.await;
        }
    }
    info!(reloaded, fetches = store.fetch_count(), "Reloaded every todo list");

    if cache.watch("missing", None).is_none() {
        info!("Unknown handler ignored");
    }

    let entry = first.entry();
    drop(first);
    sleep(timeout + EVICTION_MARGIN).await;
    info!(status = ?entry.status(), "Todo entry after grace period");

    drop((all, again, open));
    let removed = cache.actions().reset_all();
    info!(removed, fetches = store.fetch_count(), "Demo finished");
    Ok(())
}
