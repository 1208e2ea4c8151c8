//! The memoization graph: invocations, revisions, contexts,
//! transactions, and the process-wide runtime state that ties them
//! together.

pub mod cell;
pub(crate) mod cleanup;
pub mod context;
pub mod invocation;
pub(crate) mod lru;
pub(crate) mod refresher;
pub mod revision;
pub mod transaction;
pub mod watcher;

pub use cell::{
    next_reactive_global_cache_id, reactive_global_cache_cell, reactive_global_cache_get,
    reactive_global_cache_set, Cell,
};
pub use context::Context;
pub use invocation::Invocation;
pub use revision::Revision;
pub use transaction::{with_transaction, Transaction};
pub use watcher::InvalidationWatcher;

pub(crate) use revision::Subscriber;

use crossbeam_utils::CachePadded;
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::intern::IObjRef;
use crate::process::current_process;
use crate::txn::{AtomicTxnId, TxnId};
use crate::value::MemoValue;

/// Something waiting on an evaluation: a dependent context, a root
/// driver, an awaitable, a refresher probe, or the deserializer's
/// replay. Delivery happens with no graph locks held.
pub trait Caller: Send + Sync {
    /// The txn this caller reads at.
    fn query_txn(&self) -> TxnId;

    /// An input revision was chosen for this caller. Called before
    /// `deliver`; dependents record it in their context.
    fn add_dependency(&self, rev: &Arc<Revision>);

    /// The final value (or exception payload) for this caller's txn.
    fn deliver(&self, value: &MemoValue);
}

/// Process-wide runtime state. Three singletons live here: the
/// invocation registry (keyed by canonical key identity), the LRU of
/// discardable entries, and the cleanup lists -- plus the transaction
/// clock. Initialization is lazy on first use.
pub struct Runtime {
    pub(crate) txn_mutex: Mutex<()>,
    newest: CachePadded<AtomicTxnId>,
    oldest: CachePadded<AtomicTxnId>,
    invocations: Mutex<FxHashMap<usize, Arc<Invocation>>>,
    pub(crate) lru: lru::Lru,
    pub(crate) cleanups: cleanup::CleanupLists,
    /// Query txns of currently running tasks, with multiplicity.
    active: Mutex<BTreeMap<u64, usize>>,
    next_cell: AtomicU64,
    next_reactive: AtomicU64,
    reactive: Mutex<FxHashMap<(u64, String), Cell>>,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    pub fn global() -> &'static Runtime {
        RUNTIME.get_or_init(|| {
            crate::builtins::register_builtin_types();
            Runtime {
                txn_mutex: Mutex::new(()),
                // The clock starts at FIRST so that seeded cell
                // revisions never begin at the reserved pure txn.
                newest: CachePadded::new(AtomicTxnId::new(TxnId::FIRST)),
                oldest: CachePadded::new(AtomicTxnId::new(TxnId::FIRST)),
                invocations: Mutex::new(FxHashMap::default()),
                lru: lru::Lru::default(),
                cleanups: cleanup::CleanupLists::default(),
                active: Mutex::new(BTreeMap::new()),
                next_cell: AtomicU64::new(1),
                next_reactive: AtomicU64::new(1),
                reactive: Mutex::new(FxHashMap::default()),
            }
        })
    }

    /// Latest committed txn; the default read point.
    pub fn newest_visible_txn(&self) -> TxnId {
        self.newest.load()
    }

    /// Inclusive lower bound on any running task's query txn.
    pub fn oldest_visible_txn(&self) -> TxnId {
        self.oldest.load()
    }

    pub(crate) fn publish_commit(&self, txn: TxnId) {
        self.newest.store_monotonic(txn);
        self.advance_oldest();
    }

    /// Recompute the oldest-visible bound and run any cleanups that
    /// became eligible. Called whenever a task retires or a commit
    /// publishes.
    fn advance_oldest(&self) {
        let oldest = {
            let active = self.active.lock();
            match active.keys().next() {
                Some(&t) => TxnId::from_u64(t),
                None => self.newest.load(),
            }
        };
        self.oldest.store_monotonic(oldest);
        let oldest = self.oldest.load();
        let eligible = self.cleanups.drain_up_to(oldest);
        if !eligible.is_empty() {
            debug!("cleanup drain at {:?}: {} invocations", oldest, eligible.len());
        }
        for inv in eligible {
            inv.cleanup(oldest);
        }
    }

    /// Mark a task as reading at `txn` for its lifetime. The caller is
    /// responsible for picking a txn that is still visible; revisions
    /// older than the oldest registered task may be trimmed at any
    /// time.
    pub fn begin_task(&self, txn: TxnId) -> TaskGuard {
        *self.active.lock().entry(txn.as_u64()).or_insert(0) += 1;
        TaskGuard { txn }
    }

    pub(crate) fn invocation_for_key(&self, key: IObjRef) -> Arc<Invocation> {
        let mut map = self.invocations.lock();
        map.entry(key.addr())
            .or_insert_with(|| Invocation::new(key))
            .clone()
    }

    pub(crate) fn forget_invocation(&self, key: &IObjRef) {
        self.invocations.lock().remove(&key.addr());
    }

    /// Every currently registered invocation, for serialization.
    pub(crate) fn all_invocations(&self) -> Vec<Arc<Invocation>> {
        self.invocations.lock().values().cloned().collect()
    }

    pub(crate) fn next_cell_id(&self) -> u64 {
        self.next_cell.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_reactive_id(&self) -> u64 {
        self.next_reactive.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn reactive_cell(&self, id: u64, key: &str, make: impl FnOnce() -> Cell) -> Cell {
        let mut map = self.reactive.lock();
        if let Some(cell) = map.get(&(id, key.to_string())) {
            return cell.clone();
        }
        let cell = make();
        map.insert((id, key.to_string()), cell.clone());
        cell
    }

    /// Discard one entry from the cold end of the LRU. The embedder
    /// decides when memory pressure warrants calling this.
    pub fn discard_lru_entry(&self) -> bool {
        while let Some(victim) = self.lru.take_oldest() {
            if victim.evict() {
                return true;
            }
        }
        false
    }

    /// Teardown: drop all memoized state and release every reference
    /// the graph held. Interned objects survive only while external
    /// references keep them alive.
    pub fn purge(&self) {
        let invocations = {
            let mut map = self.invocations.lock();
            let all: Vec<Arc<Invocation>> = map.values().cloned().collect();
            map.clear();
            all
        };
        self.reactive.lock().clear();
        while self.lru.take_oldest().is_some() {}
        for inv in invocations {
            let _ = inv.evict();
        }
        let _ = self.cleanups.drain_up_to(TxnId::NEVER);
        crate::intern::drain_deferred_decrefs();
    }
}

/// While alive, revisions visible to `txn` are protected from cleanup.
pub struct TaskGuard {
    txn: TxnId,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let rt = Runtime::global();
        {
            let mut active = rt.active.lock();
            if let Some(count) = active.get_mut(&self.txn.as_u64()) {
                *count -= 1;
                if *count == 0 {
                    active.remove(&self.txn.as_u64());
                }
            }
        }
        rt.advance_oldest();
    }
}

/// Evaluate `inv` at `txn`, driving this thread's process until the
/// value arrives. `Err` carries an exception payload.
pub fn evaluate_sync_at(inv: &Arc<Invocation>, txn: TxnId) -> Result<MemoValue, MemoValue> {
    struct RootCaller {
        txn: TxnId,
        slot: Arc<Mutex<Option<MemoValue>>>,
        wake: crate::process::UnownedProcess,
    }
    impl Caller for RootCaller {
        fn query_txn(&self) -> TxnId {
            self.txn
        }
        fn add_dependency(&self, _rev: &Arc<Revision>) {}
        fn deliver(&self, value: &MemoValue) {
            *self.slot.lock() = Some(value.clone());
            self.wake.poke();
        }
    }

    let rt = Runtime::global();
    let _task = rt.begin_task(txn);
    let process = current_process();
    let slot = Arc::new(Mutex::new(None));
    inv.async_evaluate(Arc::new(RootCaller {
        txn,
        slot: slot.clone(),
        wake: process.unowned(),
    }));
    loop {
        if let Some(v) = slot.lock().take() {
            return if v.is_exception() { Err(v) } else { Ok(v) };
        }
        process.run_exactly_one_task_sleeping_if_necessary();
    }
}

/// Evaluate at the newest visible txn.
pub fn evaluate_sync(inv: &Arc<Invocation>) -> Result<MemoValue, MemoValue> {
    let txn = Runtime::global().newest_visible_txn();
    evaluate_sync_at(inv, txn)
}

/// `memoizeCall`: bind an awaitable to a freshly built (still
/// uninterned) invocation key. The key subgraph is interned, the
/// canonical invocation is resolved, and the awaitable completes when
/// the evaluation protocol delivers.
pub fn memoize_call(
    aw: &crate::awaitable::AwaitableRef,
    obstack: &mut crate::obstack::Obstack,
    key_addr: crate::obstack::ObjAddr,
    txn: TxnId,
) -> Arc<Invocation> {
    struct AwaitableCaller {
        txn: TxnId,
        aw: crate::awaitable::AwaitableRef,
        _task: TaskGuard,
    }
    impl Caller for AwaitableCaller {
        fn query_txn(&self) -> TxnId {
            self.txn
        }
        fn add_dependency(&self, _rev: &Arc<Revision>) {}
        fn deliver(&self, value: &MemoValue) {
            self.aw.finish(value.clone());
        }
    }

    let key = obstack.intern(key_addr);
    let inv = Invocation::intern(key);
    let task = Runtime::global().begin_task(txn);
    inv.async_evaluate(Arc::new(AwaitableCaller {
        txn,
        aw: aw.clone(),
        _task: task,
    }));
    inv
}
