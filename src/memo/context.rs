//! The per-evaluation scratchpad: which txn we are computing at, which
//! dependencies the user code has observed so far (in observation
//! order), and which callers are waiting on the result.

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use crate::memo::invocation::Invocation;
use crate::memo::revision::Revision;
use crate::memo::Caller;
use crate::process::current_process;
use crate::txn::TxnId;
use crate::value::MemoValue;

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

pub struct Context {
    pub(crate) query_txn: TxnId,
    pub(crate) owner: Arc<Invocation>,
    pub(crate) placeholder: Arc<Revision>,
    state: Mutex<CtxState>,
}

struct CtxState {
    /// Dependencies keyed by revision identity, in first-observation
    /// order. The order is what the trace preserves.
    deps: FxIndexMap<usize, Arc<Revision>>,
    callers: Vec<Arc<dyn Caller>>,
    done: bool,
}

impl Context {
    pub(crate) fn new(
        query_txn: TxnId,
        owner: Arc<Invocation>,
        placeholder: Arc<Revision>,
    ) -> Arc<Context> {
        Arc::new(Context {
            query_txn,
            owner,
            placeholder,
            state: Mutex::new(CtxState {
                deps: FxIndexMap::default(),
                callers: Vec::new(),
                done: false,
            }),
        })
    }

    pub fn query_txn(&self) -> TxnId {
        self.query_txn
    }

    /// The invocation being computed; thunks read their arguments from
    /// its key.
    pub fn invocation(&self) -> &Arc<Invocation> {
        &self.owner
    }

    /// Record that this evaluation observed `rev`. Idempotent per
    /// revision; the first observation fixes the position.
    pub fn add_dependency(&self, rev: &Arc<Revision>) {
        let mut st = self.state.lock();
        if st.done {
            return;
        }
        st.deps
            .entry(Arc::as_ptr(rev) as usize)
            .or_insert_with(|| rev.clone());
    }

    /// Queue a caller for delivery. False once the context completed;
    /// the caller must re-enter the lookup protocol.
    pub(crate) fn add_caller(&self, caller: Arc<dyn Caller>) -> bool {
        let mut st = self.state.lock();
        if st.done {
            return false;
        }
        st.callers.push(caller);
        true
    }

    /// Close the context: no more callers or dependencies accepted.
    /// Returns the dependencies in observation order plus the waiting
    /// callers.
    pub(crate) fn complete(&self) -> (Vec<Arc<Revision>>, Vec<Arc<dyn Caller>>) {
        let mut st = self.state.lock();
        debug_assert!(!st.done, "context completed twice");
        st.done = true;
        let deps = st.deps.drain(..).map(|(_, r)| r).collect();
        let callers = std::mem::take(&mut st.callers);
        (deps, callers)
    }

    /// Evaluate `inv` as a dependency of this context and block until
    /// its value arrives, driving this thread's process queue in the
    /// meantime. This is how generated code reads memoized inputs and
    /// cells.
    pub fn evaluate(self: &Arc<Self>, inv: &Arc<Invocation>) -> MemoValue {
        struct DepCaller {
            ctx: Arc<Context>,
            slot: Arc<Mutex<Option<MemoValue>>>,
            wake: crate::process::UnownedProcess,
        }
        impl Caller for DepCaller {
            fn query_txn(&self) -> TxnId {
                self.ctx.query_txn
            }
            fn add_dependency(&self, rev: &Arc<Revision>) {
                self.ctx.add_dependency(rev);
            }
            fn deliver(&self, value: &MemoValue) {
                *self.slot.lock() = Some(value.clone());
                self.wake.poke();
            }
        }

        let process = current_process();
        let slot = Arc::new(Mutex::new(None));
        inv.async_evaluate(Arc::new(DepCaller {
            ctx: self.clone(),
            slot: slot.clone(),
            wake: process.unowned(),
        }));
        loop {
            if let Some(v) = slot.lock().take() {
                return v;
            }
            process.run_exactly_one_task_sleeping_if_necessary();
        }
    }

    /// Deliver the computed value (or exception payload) and replace
    /// the placeholder. Must be called exactly once per context.
    pub fn evaluate_done(self: &Arc<Self>, value: MemoValue) {
        crate::memo::invocation::finish_evaluation(&self.owner, self, value);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context(at {:?})", self.query_txn)
    }
}
