//! In-flight task registry
//!
//! Best-effort local duplicate suppression. The broker remains the arbiter
//! of ownership; this only keeps one worker from claiming the same offer
//! twice. Check and insert happen under one lock.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ProcessingSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ProcessingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically mark `task_id` as in flight. Returns `None` if it already is.
    /// The id is released when the returned guard drops.
    pub fn try_begin(&self, task_id: &str) -> Option<ProcessingGuard> {
        let inserted = self.inner.lock().insert(task_id.to_string());
        inserted.then(|| ProcessingGuard {
            set: Arc::clone(&self.inner),
            task_id: task_id.to_string(),
        })
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Sorted ids currently in flight
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug)]
pub struct ProcessingGuard {
    set: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl ProcessingGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.task_id);
    }
}
