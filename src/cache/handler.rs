//! Handler declarations.
//!
//! A handler is either an action (a side-effecting function that may patch
//! cached state through a [`Setter`]) or a cached fetch (a function whose
//! results are cached per body key, optionally with an `on_watch` hook).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use super::entry::{Cleanup, FetchFuture};
use super::error::FetchError;
use super::setter::{ScopedSetter, Setter};

pub(crate) type FetchFn = Arc<dyn Fn(Value) -> FetchFuture + Send + Sync>;
pub(crate) type ActionFn = Arc<dyn Fn(Value, Setter) -> FetchFuture + Send + Sync>;
pub(crate) type WatchFn = Arc<dyn Fn(Value, ScopedSetter) -> Option<Cleanup> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Action,
    Cached,
}

/// A named handler definition, before it is registered with a cache.
#[derive(Clone)]
pub struct Handler(pub(crate) Definition);

#[derive(Clone)]
pub(crate) enum Definition {
    Action {
        run: ActionFn,
    },
    Cached {
        fetch: FetchFn,
        on_watch: Option<WatchFn>,
    },
}

impl Handler {
    /// Declare an action.
    pub fn action<F, Fut>(run: F) -> Self
    where
        F: Fn(Value, Setter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self(Definition::Action {
            run: Arc::new(move |body, setter| run(body, setter).boxed()),
        })
    }

    /// Declare a cached fetch.
    pub fn cached<F, Fut>(fetch: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self(Definition::Cached {
            fetch: Arc::new(move |body| fetch(body).boxed()),
            on_watch: None,
        })
    }

    /// Attach a hook that runs when a body key gains its first watcher.
    ///
    /// The returned cleanup runs when that entry is evicted or reset.
    /// Ignored on actions.
    pub fn on_watch<F>(self, hook: F) -> Self
    where
        F: Fn(Value, ScopedSetter) -> Option<Cleanup> + Send + Sync + 'static,
    {
        match self.0 {
            Definition::Cached { fetch, .. } => Self(Definition::Cached {
                fetch,
                on_watch: Some(Arc::new(hook)),
            }),
            action @ Definition::Action { .. } => {
                warn!("on_watch hook ignored on an action handler");
                Self(action)
            }
        }
    }

    pub fn kind(&self) -> HandlerKind {
        match self.0 {
            Definition::Action { .. } => HandlerKind::Action,
            Definition::Cached { .. } => HandlerKind::Cached,
        }
    }

    pub fn watches(&self) -> bool {
        matches!(
            self.0,
            Definition::Cached {
                on_watch: Some(_),
                ..
            }
        )
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("kind", &self.kind())
            .field("watches", &self.watches())
            .finish()
    }
}
