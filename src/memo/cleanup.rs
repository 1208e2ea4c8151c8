//! Per-TxnId buckets of invocations whose revision tails need trimming
//! once the oldest visible txn moves past them. Inserts ride the shared
//! side of a reader-writer lock (plus a per-bucket push mutex), so the
//! hot path never contends with drains; a drain takes the write lock,
//! swaps bucket contents out, and runs each invocation's cleanup with
//! no list locks held.

use lock_api::RwLockUpgradableReadGuard;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::memo::invocation::Invocation;
use crate::txn::TxnId;

#[derive(Default)]
pub(crate) struct CleanupLists {
    map: RwLock<FxHashMap<u64, Arc<Bucket>>>,
}

#[derive(Default)]
struct Bucket {
    invs: Mutex<Vec<Arc<Invocation>>>,
}

impl CleanupLists {
    /// Queue `inv` for cleanup once `txn` is no longer visible.
    pub fn insert(&self, txn: TxnId, inv: Arc<Invocation>) {
        let map = self.map.upgradable_read();
        if let Some(bucket) = map.get(&txn.as_u64()) {
            bucket.invs.lock().push(inv);
            return;
        }
        let mut map = RwLockUpgradableReadGuard::upgrade(map);
        map.entry(txn.as_u64())
            .or_default()
            .invs
            .lock()
            .push(inv);
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Pull out every invocation whose bucket txn is now invisible
    /// (`bucket txn <= oldest_visible` means no task can read a
    /// revision ending there any more).
    pub fn drain_up_to(&self, oldest_visible: TxnId) -> Vec<Arc<Invocation>> {
        let buckets: Vec<Arc<Bucket>> = {
            let mut map = self.map.write();
            let keys: Vec<u64> = map
                .keys()
                .filter(|k| **k <= oldest_visible.as_u64())
                .copied()
                .collect();
            keys.iter().filter_map(|k| map.remove(k)).collect()
        };
        let mut out = Vec::new();
        for bucket in buckets {
            out.append(&mut bucket.invs.lock());
        }
        out
    }
}
