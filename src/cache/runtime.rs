use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

/// Spawn `task` on the ambient tokio runtime, if there is one.
pub(crate) fn spawn_detached<F>(task: F, op: &'static str) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(task)),
        Err(_) => {
            warn!(
                op,
                hint = "call from within a tokio runtime",
                "No tokio runtime available; task not spawned"
            );
            None
        }
    }
}
