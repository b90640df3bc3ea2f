//! Reactive request cache.
//!
//! Sits between consumers and asynchronous fetch functions:
//!
//! - **Entries**: one per (handler, body key), deduplicating fetches and
//!   holding the last response or error
//! - **Watches**: consumers register on an entry; once the last one leaves,
//!   the entry is evicted after a grace period
//! - **Setters**: patch cached responses in place, or refetch them, without
//!   going through a consumer
//!
//! ## Configuration
//!
//! The grace period is read from `rcache.toml`:
//!
//! ```toml
//! [cache]
//! timeout_ms = 200
//! ```

mod binding;
mod client;
mod config;
mod entry;
mod error;
mod handler;
mod helpers;
mod keys;
mod lock;
mod notify;
mod registry;
mod runtime;
mod setter;

pub use binding::{Lookup, Transform, Watch};
pub use client::{CacheActions, RequestCache, RequestCacheBuilder};
pub use config::{CacheConfig, DEFAULT_CACHE_TIMEOUT_MS};
pub use entry::{CacheEntry, Cleanup, EntryStatus, EntryView, FetchFuture, PendingFetch};
pub use error::{FetchError, fetch_error};
pub use handler::{Handler, HandlerKind};
pub use helpers::{DEFAULT_ID_FIELD, SetHelpers, UseHelpers};
pub use keys::{BodyKey, default_body};
pub use notify::{Listener, ListenerId};
pub use setter::{ScopedSetter, SetResult, Setter};

/// Metric names emitted by the cache, for exporters and tests.
pub mod metric_names {
    pub use super::entry::{METRIC_EVICTION_TOTAL, METRIC_FETCH_TOTAL};
    pub use super::registry::METRIC_ENTRY_CREATED_TOTAL;
    pub use super::setter::METRIC_SETTER_APPLY_TOTAL;
}
