//! Approximate LRU over discardable invocations.
//!
//! One mutex guards a single vector ordered roughly oldest-first; each
//! invocation remembers its slot index so membership checks and
//! removals are O(1). `record_use` only *tries* the lock -- a contended
//! touch is simply dropped, recency here is advisory -- and promotes an
//! entry by swapping it a random distance toward the recent end, which
//! converges on LRU order without per-use list surgery.

use oorandom::Rand64;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::memo::invocation::Invocation;

const NOT_IN_LRU: usize = usize::MAX;

pub(crate) struct LruIndex {
    index: AtomicUsize,
}

impl Default for LruIndex {
    fn default() -> Self {
        LruIndex {
            index: AtomicUsize::new(NOT_IN_LRU),
        }
    }
}

impl LruIndex {
    fn load(&self) -> Option<usize> {
        match self.index.load(Ordering::Acquire) {
            NOT_IN_LRU => None,
            i => Some(i),
        }
    }

    fn store(&self, i: usize) {
        self.index.store(i, Ordering::Release);
    }

    fn clear(&self) {
        self.index.store(NOT_IN_LRU, Ordering::Release);
    }
}

pub(crate) struct Lru {
    data: Mutex<LruData>,
}

struct LruData {
    /// Oldest near index 0, most recently used near the back.
    entries: Vec<Arc<Invocation>>,
    rng: Rand64,
}

impl Default for Lru {
    fn default() -> Self {
        Lru {
            data: Mutex::new(LruData {
                entries: Vec::new(),
                rng: Rand64::new(0x5eed_cafe),
            }),
        }
    }
}

impl Lru {
    /// Note a use. Never blocks: if the list is contended the touch is
    /// dropped.
    pub fn record_use(&self, inv: &Arc<Invocation>) {
        let mut data = match self.data.try_lock() {
            Some(d) => d,
            None => return,
        };
        match inv.lru_index.load() {
            None => {
                inv.lru_index.store(data.entries.len());
                data.entries.push(inv.clone());
            }
            Some(i) => {
                let len = data.entries.len();
                if i + 1 >= len {
                    return; // already at the recent end
                }
                // Promote by a random hop toward the back.
                let target = i + 1 + (data.rng.rand_u64() as usize) % (len - i - 1);
                data.entries.swap(i, target);
                data.entries[i].lru_index.store(i);
                data.entries[target].lru_index.store(target);
            }
        }
    }

    pub fn insert(&self, inv: &Arc<Invocation>) {
        let mut data = self.data.lock();
        if inv.lru_index.load().is_none() {
            inv.lru_index.store(data.entries.len());
            data.entries.push(inv.clone());
        }
    }

    pub fn remove(&self, inv: &Arc<Invocation>) {
        let mut data = self.data.lock();
        if let Some(i) = inv.lru_index.load() {
            if i < data.entries.len() && Arc::ptr_eq(&data.entries[i], inv) {
                data.entries.swap_remove(i);
                if i < data.entries.len() {
                    data.entries[i].lru_index.store(i);
                }
            }
            inv.lru_index.clear();
        }
    }

    /// Pop the (approximately) least recently used entry.
    pub fn take_oldest(&self) -> Option<Arc<Invocation>> {
        let mut data = self.data.lock();
        if data.entries.is_empty() {
            return None;
        }
        let victim = data.entries.swap_remove(0);
        victim.lru_index.clear();
        if !data.entries.is_empty() {
            data.entries[0].lru_index.store(0);
        }
        Some(victim)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.lock().entries.len()
    }
}
