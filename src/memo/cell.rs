//! Cells: user-writable memoization roots, plus the keyed reactive
//! global cache built on top of them.
//!
//! A cell is an invocation with no thunk, pre-populated with a single
//! revision holding its initial value. Writes flow through
//! [`Transaction`](crate::memo::transaction::Transaction), so a batch
//! of cell updates becomes visible atomically.

use std::sync::Arc;

use crate::builtins::CELL_KEY_TYPE;
use crate::intern::IObjRef;
use crate::memo::context::Context;
use crate::memo::invocation::Invocation;
use crate::memo::transaction::write_through;
use crate::memo::watcher::InvalidationWatcher;
use crate::memo::{Runtime, Subscriber};
use crate::obstack::{write_ref_slot, Obstack};
use crate::txn::{Lifespan, TxnId};
use crate::value::MemoValue;

#[derive(Clone)]
pub struct Cell {
    inv: Arc<Invocation>,
}

impl Cell {
    /// A fresh cell with its own unique key.
    pub fn new(initial: MemoValue) -> Cell {
        let id = Runtime::global().next_cell_id();
        Cell::with_key(id, None, initial)
    }

    fn with_key(id: u64, key_obj: Option<&IObjRef>, initial: MemoValue) -> Cell {
        let key = intern_cell_key(id, key_obj);
        let inv = Invocation::intern(key);
        if inv.head().is_none() {
            // First sight of this key: seed the current value. The
            // seed begins at the newest visible txn (never the pure
            // txn, which would forbid subscribers).
            let begin = Runtime::global().newest_visible_txn();
            inv.install_revision(Lifespan::new(begin, TxnId::NEVER), initial);
        }
        Cell { inv }
    }

    /// Read the cell inside an evaluation, recording the dependency.
    pub fn get(&self, ctx: &Arc<Context>) -> MemoValue {
        ctx.evaluate(&self.inv)
    }

    /// Read the cell from the host at an explicit txn.
    pub fn get_at(&self, txn: TxnId) -> MemoValue {
        crate::memo::evaluate_sync_at(&self.inv, txn)
            .unwrap_or_else(|exn| exn)
    }

    /// Assign; becomes visible at the commit's TxnId (or the ambient
    /// transaction's, inside `with_transaction`).
    pub fn set(&self, value: MemoValue) -> Option<TxnId> {
        write_through(&self.inv, value)
    }

    /// Watch the revision serving `txn`; `callback` fires (once) after
    /// the first commit that invalidates it.
    pub fn subscribe_invalidation(
        &self,
        txn: TxnId,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Option<()> {
        let head = self.inv.head()?;
        let mut h = head.state.lock();
        if h.begin <= txn && txn < h.end {
            let watcher = Arc::new(InvalidationWatcher::new(callback));
            h.subs.insert(Subscriber::Watcher(watcher));
            Some(())
        } else {
            None
        }
    }
}

fn intern_cell_key(id: u64, key_obj: Option<&IObjRef>) -> IObjRef {
    let mut ob = Obstack::new();
    let addr = ob.alloc_object(&CELL_KEY_TYPE, 0);
    unsafe {
        *(addr as *mut u64) = id;
        if let Some(k) = key_obj {
            write_ref_slot(addr, 1, k.addr());
        }
    }
    ob.intern(addr)
    // `ob` drops here; the interned key stays alive through the
    // returned reference.
}

/// `Reactive_nextReactiveGlobalCacheID`.
pub fn next_reactive_global_cache_id() -> u64 {
    Runtime::global().next_reactive_id()
}

/// `Reactive_reactiveGlobalCacheGet`: the cell for `(id, key)`,
/// created empty (Undef) on first touch.
pub fn reactive_global_cache_cell(id: u64, key: &str) -> Cell {
    let rt = Runtime::global();
    rt.reactive_cell(id, key, || {
        let key_obj = crate::intern::intern_string(key);
        Cell::with_key(id, Some(&key_obj), MemoValue::Undef)
    })
}

pub fn reactive_global_cache_get(id: u64, key: &str, ctx: &Arc<Context>) -> MemoValue {
    reactive_global_cache_cell(id, key).get(ctx)
}

pub fn reactive_global_cache_set(id: u64, key: &str, value: MemoValue) -> Option<TxnId> {
    reactive_global_cache_cell(id, key).set(value)
}
