//! Invalidation watchers: one-shot callbacks that fire when a watched
//! revision is invalidated by a commit. Watchers are notified after the
//! commit releases its locks; a callback is free to re-enter the
//! evaluation API (typically to re-evaluate and re-subscribe).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct InvalidationWatcher {
    fired: AtomicBool,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl InvalidationWatcher {
    pub fn new(callback: Box<dyn FnOnce() + Send>) -> InvalidationWatcher {
        InvalidationWatcher {
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Claim the watcher; true exactly once.
    pub(crate) fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    /// Run the callback. Call with no locks held.
    pub(crate) fn notify(&self) {
        let cb = self.callback.lock().take();
        if let Some(cb) = cb {
            cb();
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> InvalidationWatcher {
        InvalidationWatcher::new(Box::new(|| {}))
    }
}
