//! Reactive request cache: deduplicated fetches, watcher tracking, eviction
//! of unwatched results, and in-place patching of cached values.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
