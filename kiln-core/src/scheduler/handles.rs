//! In-flight execution handles.

use std::collections::HashMap;
use std::sync::Mutex;

/// Tracks tokio abort handles for running generation tasks, keyed by task
/// id.  The reaper uses this to cut a hung worker call loose when it
/// force-fails a stale task; a cancelled execution drops its queue slot and
/// lane guard on the way out.
pub struct TaskManager {
    handles: Mutex<HashMap<String, tokio::task::AbortHandle>>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handles.lock().map(|h| h.len()).unwrap_or(0);
        write!(f, "TaskManager({count} handles)")
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: impl Into<String>, handle: tokio::task::AbortHandle) {
        if let Ok(mut map) = self.handles.lock() {
            map.insert(id.into(), handle);
        }
    }

    /// Abort and remove a task's execution.  Returns `true` if the handle
    /// was found.
    pub fn cancel(&self, id: &str) -> bool {
        if let Ok(mut map) = self.handles.lock() {
            if let Some(h) = map.remove(id) {
                h.abort();
                return true;
            }
        }
        false
    }

    pub fn remove(&self, id: &str) {
        if let Ok(mut map) = self.handles.lock() {
            map.remove(id);
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
