//! Refreshers: extend a stale head's lifespan forward without
//! re-running the user thunk.
//!
//! The head's trace knows which inputs went inactive. Each of those is
//! re-evaluated at the query txn through the ordinary lookup protocol;
//! if every input comes back as the *same revision identity* (possibly
//! itself extended by a merge downstream), the head's value is still
//! correct and its end moves forward to the minimum of the inputs'
//! ends. Any identity change means the value may differ, and the
//! refresher falls back to re-running the thunk (plan B). Concurrent
//! callers share one refresher.

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::memo::invocation::Invocation;
use crate::memo::revision::{RevState, Revision};
use crate::memo::Caller;
use crate::txn::TxnId;

pub(crate) struct Refresher {
    inv: Arc<Invocation>,
    target: Arc<Revision>,
    query_txn: TxnId,
    state: Mutex<RefState>,
}

struct RefState {
    callers: Vec<Arc<dyn Caller>>,
    inputs: Vec<RefreshInput>,
    pending: usize,
    failed: bool,
    finished: bool,
}

struct RefreshInput {
    traced: Arc<Revision>,
    inactive: bool,
    delivered: Option<Arc<Revision>>,
    done: bool,
}

impl Refresher {
    /// Snapshot the head's trace under the owning invocation's lock
    /// (`st` is the head's state, already locked by the caller).
    pub(crate) fn new(
        inv: Arc<Invocation>,
        target: Arc<Revision>,
        query_txn: TxnId,
        st: &RevState,
    ) -> Arc<Refresher> {
        let inputs = st
            .trace
            .edges
            .iter()
            .enumerate()
            .map(|(i, edge)| RefreshInput {
                traced: edge.input.clone(),
                inactive: st.trace.is_inactive(i as u32),
                delivered: None,
                done: false,
            })
            .collect();
        Arc::new(Refresher {
            inv,
            target,
            query_txn,
            state: Mutex::new(RefState {
                callers: Vec::new(),
                inputs,
                pending: 0,
                failed: false,
                finished: false,
            }),
        })
    }

    /// False once finished; late callers re-enter the lookup.
    pub(crate) fn add_caller(&self, caller: Arc<dyn Caller>) -> bool {
        let mut st = self.state.lock();
        if st.finished {
            return false;
        }
        st.callers.push(caller);
        true
    }

    /// Kick off the re-evaluation of every inactive input. Call with
    /// no locks held.
    pub(crate) fn start(self: &Arc<Self>) {
        let snapshot: Vec<(usize, Arc<Revision>, bool)> = {
            let st = self.state.lock();
            st.inputs
                .iter()
                .enumerate()
                .map(|(i, input)| (i, input.traced.clone(), input.inactive))
                .collect()
        };

        // Resolve input owners without holding our own lock; revision
        // locks stay leaves.
        let mut work: Vec<(usize, Arc<Invocation>)> = Vec::new();
        let mut settled: Vec<(usize, bool)> = Vec::new();
        for (i, traced, inactive) in snapshot {
            if !inactive {
                settled.push((i, false));
                continue;
            }
            match traced.state.lock().owner.clone() {
                Some(owner) => work.push((i, owner)),
                // The input was evicted; its history cannot be
                // consulted, so the refresh cannot succeed.
                None => settled.push((i, true)),
            }
        }
        {
            let mut st = self.state.lock();
            for (i, failed) in &settled {
                st.inputs[*i].done = true;
                if *failed {
                    st.failed = true;
                }
            }
            st.pending = work.len();
        }
        debug!(
            "refresher for {:?} at {:?}: {} inputs to revalidate",
            self.inv, self.query_txn, work.len()
        );
        if work.is_empty() {
            self.finish();
            return;
        }
        for (index, owner) in work {
            let caller: Arc<dyn Caller> = Arc::new(InputCaller {
                refresher: self.clone(),
                index,
            });
            owner.async_evaluate(caller);
        }
    }

    fn note_input(&self, index: usize, rev: &Arc<Revision>) {
        let mut st = self.state.lock();
        if !st.finished {
            st.inputs[index].delivered = Some(rev.clone());
        }
    }

    fn input_done(self: &Arc<Self>, index: usize) {
        let finished = {
            let mut st = self.state.lock();
            if st.finished || st.inputs[index].done {
                return;
            }
            st.inputs[index].done = true;
            st.pending -= 1;
            let input = &st.inputs[index];
            let same_identity = match &input.delivered {
                Some(delivered) => Arc::ptr_eq(delivered, &input.traced),
                None => false,
            };
            if !same_identity {
                st.failed = true;
            }
            st.pending == 0
        };
        if finished {
            self.finish();
        }
    }

    fn finish(self: &Arc<Self>) {
        let (callers, failed, inputs): (Vec<Arc<dyn Caller>>, bool, Vec<(Arc<Revision>, usize)>) = {
            let mut st = self.state.lock();
            debug_assert_eq!(st.pending, 0);
            st.finished = true;
            let callers = std::mem::take(&mut st.callers);
            let inputs = st
                .inputs
                .iter()
                .enumerate()
                .map(|(i, input)| (input.traced.clone(), i))
                .collect();
            (callers, st.failed, inputs)
        };

        if failed {
            debug!("refresher for {:?}: plan B (rerun thunk)", self.inv);
            // The trace no longer describes a refreshable value.
            self.target.clear_trace();
            self.target.state.lock().refresher = None;
            for caller in callers {
                self.inv.async_evaluate(caller);
            }
            return;
        }

        // Every input kept its identity: the head's value is valid up
        // to where the inputs are. Extending the end re-sorts the
        // owner's list.
        let mut new_end = TxnId::NEVER;
        let mut inactive = 0u64;
        for (traced, i) in &inputs {
            let s = traced.lifespan();
            if s.end != TxnId::NEVER {
                new_end = new_end.min(s.end);
                inactive |= 1u64 << *i;
            }
        }
        {
            let mut inv_st = self.inv.state.lock();
            {
                let mut t = self.target.state.lock();
                if new_end > t.end {
                    t.end = new_end;
                }
                if t.trace.edges.len() == inputs.len() {
                    t.trace.inactive = inactive;
                }
                t.refresher = None;
            }
            crate::memo::invocation::normalize_order(&mut inv_st);
        }
        debug!(
            "refresher for {:?}: extended to {:?}",
            self.inv, new_end
        );

        let span = self.target.lifespan();
        let value = self.target.value();
        for caller in callers {
            if span.contains(caller.query_txn()) {
                caller.add_dependency(&self.target);
                caller.deliver(&value);
            } else {
                self.inv.async_evaluate(caller);
            }
        }
    }
}

struct InputCaller {
    refresher: Arc<Refresher>,
    index: usize,
}

impl Caller for InputCaller {
    fn query_txn(&self) -> TxnId {
        self.refresher.query_txn
    }

    fn add_dependency(&self, rev: &Arc<Revision>) {
        self.refresher.note_input(self.index, rev);
    }

    fn deliver(&self, _value: &crate::value::MemoValue) {
        self.refresher.input_done(self.index);
    }
}
