// Named deferred tasks (room teardown, delayed cleanup).
//
// Scheduling under an existing name replaces the pending task, so a
// re-join during a teardown grace period cancels the teardown by
// scheduling nothing and calling `cancel`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
pub struct TimerRegistry {
    handles: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any pending timer with the
    /// same id.
    pub async fn schedule<F>(&self, id: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = self.handles.clone();
        let timer_id = id.to_string();

        let handle = tokio::spawn({
            let registry = registry.clone();
            let timer_id = timer_id.clone();
            async move {
                tokio::time::sleep(delay).await;
                // Deregister before running so the task can reschedule itself.
                registry.lock().await.remove(&timer_id);
                task.await;
            }
        });

        let mut guard = self.handles.lock().await;
        if let Some(previous) = guard.insert(timer_id, handle) {
            previous.abort();
        }
    }

    /// Abort a pending timer. Returns true when one was pending.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.handles.lock().await.remove(id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn is_scheduled(&self, id: &str) -> bool {
        self.handles.lock().await.contains_key(id)
    }

    /// Abort everything; used on shutdown.
    pub async fn cancel_all(&self) {
        for (_, handle) in self.handles.lock().await.drain() {
            handle.abort();
        }
    }
}
