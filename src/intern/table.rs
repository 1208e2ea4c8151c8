//! The process-global intern table: a lock-striped open hash keyed by
//! content hash. Buckets hold the addresses of canonical objects; all
//! revival/removal races are resolved under the owning bucket's lock.

use parking_lot::Mutex;
use std::sync::OnceLock;

use crate::obstack::ObjAddr;

const BUCKET_COUNT: usize = 256;

struct InternTable {
    buckets: Vec<Mutex<Vec<ObjAddr>>>,
}

static TABLE: OnceLock<InternTable> = OnceLock::new();

fn table() -> &'static InternTable {
    TABLE.get_or_init(|| InternTable {
        buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
    })
}

/// Run `f` with the bucket for `hash` locked.
pub(crate) fn with_bucket<R>(hash: u64, f: impl FnOnce(&mut Vec<ObjAddr>) -> R) -> R {
    let t = table();
    let mut bucket = t.buckets[hash as usize & (BUCKET_COUNT - 1)].lock();
    f(&mut bucket)
}

#[cfg(test)]
pub(crate) fn for_each_entry(mut f: impl FnMut(ObjAddr)) {
    for b in &table().buckets {
        for &addr in b.lock().iter() {
            f(addr);
        }
    }
}
