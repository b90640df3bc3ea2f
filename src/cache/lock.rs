use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock an entry's state, recovering the guard if a listener or hook panicked
/// while another thread held it.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "entry state may be stale after panic in another thread",
                "Recovered from poisoned cache entry lock"
            );
            lock.clear_poison();
            poisoned.into_inner()
        }
    }
}
