//! Invocations and the evaluation protocol.
//!
//! An invocation is one `(function, arguments)` cache entry: an
//! interned key plus a history of revisions sorted by `end` descending.
//! One mutex per invocation guards the list; while it is held we may
//! also lock revisions *owned by this invocation* (they are covered),
//! but never a revision of another invocation -- cross-invocation edges
//! are touched child-first with no other lock held.

use log::{debug, info};
use std::sync::Arc;

use crate::intern::IObjRef;
use crate::memo::context::Context;
use crate::memo::lru::LruIndex;
use crate::memo::refresher::Refresher;
use crate::memo::revision::{Revision, Subscriber, Trace, TraceEdge, MAX_TRACE_SIZE};
use crate::memo::{Caller, Runtime};
use crate::process::current_process;
use crate::txn::{Lifespan, TxnId};
use crate::type_desc::EvalHook;
use crate::value::MemoValue;
use parking_lot::Mutex;

/// Which list owns the invocation's lifecycle right now.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum OwningList {
    None,
    Lru,
    Cleanup,
}

pub struct Invocation {
    /// The interned `(function, arguments)` key. Identity-equivalent
    /// after interning: equal keys are pointer-equal.
    key: IObjRef,
    pub(crate) state: Mutex<InvState>,
    pub(crate) lru_index: LruIndex,
}

pub(crate) struct InvState {
    /// Sorted by `end` descending; index 0 is the head (newest).
    pub revisions: Vec<Arc<Revision>>,
    pub owning_list: OwningList,
}

impl Invocation {
    pub(crate) fn new(key: IObjRef) -> Arc<Invocation> {
        Arc::new(Invocation {
            key,
            state: Mutex::new(InvState {
                revisions: Vec::new(),
                owning_list: OwningList::None,
            }),
            lru_index: LruIndex::default(),
        })
    }

    /// Look up (or create) the canonical invocation for an interned
    /// key. Because keys are interned, equality is pointer equality.
    pub fn intern(key: IObjRef) -> Arc<Invocation> {
        Runtime::global().invocation_for_key(key)
    }

    pub fn key(&self) -> &IObjRef {
        &self.key
    }

    fn evaluate_hook(&self) -> Option<EvalHook> {
        self.key.ty().evaluate
    }

    /// Discardable entries can be recomputed from their key; cells
    /// cannot.
    pub(crate) fn is_discardable(&self) -> bool {
        self.evaluate_hook().is_some()
    }

    /// The number of revisions currently held. Test and introspection
    /// aid.
    pub fn revision_count(&self) -> usize {
        self.state.lock().revisions.len()
    }

    /// The lifespans currently held, newest first.
    pub fn revision_spans(&self) -> Vec<crate::txn::Lifespan> {
        let revisions = self.state.lock().revisions.clone();
        revisions.iter().map(|r| r.lifespan()).collect()
    }

    /// The lookup protocol: find or create the revision covering the caller's txn.
    pub fn async_evaluate(self: &Arc<Self>, caller: Arc<dyn Caller>) {
        let txn = caller.query_txn();
        debug_assert!(txn != TxnId::NEVER);
        if self.is_discardable() {
            Runtime::global().lru.record_use(self);
        }

        loop {
            enum Action {
                Deliver(Arc<Revision>, MemoValue),
                DeliverBare(MemoValue),
                Queued,
                Refresh(Arc<Refresher>),
                Compute(Arc<Context>),
                RetryLookup,
            }

            let action = {
                let mut st = self.state.lock();

                // First revision whose lifespan could contain txn, and
                // the tightest begin above txn (placeholder ceiling).
                let mut found: Option<Arc<Revision>> = None;
                let mut next_begin = TxnId::NEVER;
                for rev in st.revisions.iter() {
                    let begin = rev.state.lock().begin;
                    if begin <= txn {
                        found = Some(rev.clone());
                        break;
                    }
                    next_begin = begin;
                }

                match found {
                    Some(rev) => {
                        let mut r = rev.state.lock();
                        if r.end > txn {
                            if r.value.is_placeholder() {
                                let ctx = r
                                    .context
                                    .clone()
                                    .expect("placeholder without context");
                                drop(r);
                                if ctx.add_caller(caller.clone()) {
                                    debug!("{:?}: queued on in-flight context", self);
                                    Action::Queued
                                } else {
                                    // Completed between our lookup and
                                    // the registration; go around.
                                    Action::RetryLookup
                                }
                            } else {
                                info!("{:?}: memoized hit at {:?}", self, txn);
                                Action::Deliver(rev.clone(), r.value.clone())
                            }
                        } else if Revision::can_refresh(&r) {
                            if let Some(refresher) = &r.refresher {
                                if refresher.add_caller(caller.clone()) {
                                    Action::Queued
                                } else {
                                    Action::RetryLookup
                                }
                            } else {
                                let refresher =
                                    Refresher::new(self.clone(), rev.clone(), txn, &r);
                                r.refresher = Some(refresher.clone());
                                let queued = refresher.add_caller(caller.clone());
                                debug_assert!(queued);
                                Action::Refresh(refresher)
                            }
                        } else {
                            drop(r);
                            self.start_compute(&mut st, txn, next_begin, &caller)
                                .map_or(Action::DeliverBare(MemoValue::Undef), Action::Compute)
                        }
                    }
                    None => self
                        .start_compute(&mut st, txn, next_begin, &caller)
                        .map_or(Action::DeliverBare(MemoValue::Undef), Action::Compute),
                }
            };

            match action {
                Action::Deliver(rev, value) => {
                    caller.add_dependency(&rev);
                    caller.deliver(&value);
                    return;
                }
                Action::DeliverBare(value) => {
                    // No thunk and no covering revision: nothing to
                    // recompute from.
                    caller.deliver(&value);
                    return;
                }
                Action::Queued => return,
                Action::Refresh(refresher) => {
                    refresher.start();
                    return;
                }
                Action::Compute(ctx) => {
                    let hook = self.evaluate_hook().expect("compute without hook");
                    info!("{:?}: executing thunk at {:?}", self, txn);
                    current_process().schedule(Box::new(move || hook(&ctx)));
                    return;
                }
                Action::RetryLookup => continue,
            }
        }
    }

    /// A cache miss: insert a placeholder spanning up to the next
    /// newer revision and hand back the context to compute under.
    fn start_compute(
        self: &Arc<Self>,
        st: &mut InvState,
        txn: TxnId,
        next_begin: TxnId,
        caller: &Arc<dyn Caller>,
    ) -> Option<Arc<Context>> {
        self.evaluate_hook()?;
        let span = Lifespan::new(txn, next_begin);
        let placeholder = Revision::new(span, MemoValue::Context, Some(self.clone()));
        let ctx = Context::new(txn, self.clone(), placeholder.clone());
        placeholder.state.lock().context = Some(ctx.clone());
        insert_sorted(st, placeholder);
        let queued = ctx.add_caller(caller.clone());
        debug_assert!(queued);
        debug!("{:?}: placeholder installed over {:?}", self, span);
        Some(ctx)
    }

    /// Trim tail revisions that no running task can see any more.
    /// Invoked from cleanup-list drains.
    pub(crate) fn cleanup(self: &Arc<Self>, oldest_visible: TxnId) {
        let (detached, reregister_at) = {
            let mut st = self.state.lock();
            let mut detached = Vec::new();
            while st.revisions.len() > 1 {
                let tail = st.revisions.last().expect("nonempty");
                let tr = tail.state.lock();
                if tr.end > oldest_visible || tr.value.is_placeholder() {
                    break;
                }
                drop(tr);
                detached.push(st.revisions.pop().expect("nonempty"));
            }
            let reregister_at = st
                .revisions
                .last()
                .map(|tail| tail.state.lock().end)
                .filter(|end| *end != TxnId::NEVER);
            if reregister_at.is_none() {
                st.owning_list = OwningList::None;
            }
            (detached, reregister_at)
        };

        for rev in &detached {
            rev.clear_trace();
            rev.state.lock().owner = None;
        }
        match reregister_at {
            Some(end) => Runtime::global().cleanups.insert(end, self.clone()),
            None => {
                if self.is_discardable() {
                    Runtime::global().lru.insert(self);
                    self.state.lock().owning_list = OwningList::Lru;
                }
            }
        }
    }

    /// Detach the whole revision list (LRU eviction). The invocation
    /// disappears from the registry; revisions survive only as long as
    /// their subscribers hold them.
    pub(crate) fn evict(self: &Arc<Self>) -> bool {
        let revisions = {
            let mut st = self.state.lock();
            if st.owning_list == OwningList::Cleanup {
                return false; // cleanup owns it right now
            }
            st.owning_list = OwningList::None;
            std::mem::take(&mut st.revisions)
        };
        // Refreshers can hold callers whose drops re-enter the runtime;
        // collect them under the lock, drop them after.
        let mut orphaned_refreshers = Vec::new();
        for rev in &revisions {
            rev.clear_trace();
            let mut r = rev.state.lock();
            r.owner = None;
            orphaned_refreshers.push(r.refresher.take());
        }
        drop(orphaned_refreshers);
        Runtime::global().forget_invocation(&self.key);
        debug!("{:?}: evicted ({} revisions)", self, revisions.len());
        true
    }

    /// Install a pre-populated revision (cell initialization and cache
    /// deserialization go through this).
    pub(crate) fn install_revision(
        self: &Arc<Self>,
        span: Lifespan,
        value: MemoValue,
    ) -> Arc<Revision> {
        let rev = Revision::new(span, value, Some(self.clone()));
        let mut st = self.state.lock();
        insert_sorted(&mut st, rev.clone());
        rev
    }

    /// Current head revision, if any.
    pub(crate) fn head(&self) -> Option<Arc<Revision>> {
        self.state.lock().revisions.first().cloned()
    }

    /// Snapshot the head's value and the invocations its trace inputs
    /// belong to. `None` while the head is in flight (or absent).
    pub(crate) fn serial_snapshot(&self) -> Option<(MemoValue, Vec<Arc<Invocation>>)> {
        let head = self.head()?;
        let (value, inputs): (MemoValue, Vec<Arc<Revision>>) = {
            let st = head.state.lock();
            if st.value.is_placeholder() {
                return None;
            }
            (
                st.value.clone(),
                st.trace.edges.iter().map(|e| e.input.clone()).collect(),
            )
        };
        let mut targets = Vec::new();
        for input in inputs {
            if let Some(owner) = input.state.lock().owner.clone() {
                targets.push(owner);
            }
        }
        Some((value, targets))
    }

    /// Open a context without scheduling any thunk: the memo-cache
    /// deserializer replays recorded dependencies through it and then
    /// calls `evaluate_done`, reusing the normal insertion logic.
    pub(crate) fn begin_replay(self: &Arc<Self>, txn: TxnId) -> Arc<Context> {
        let mut st = self.state.lock();
        let mut next_begin = TxnId::NEVER;
        for rev in st.revisions.iter() {
            let begin = rev.state.lock().begin;
            if begin <= txn {
                break;
            }
            next_begin = begin;
        }
        let span = Lifespan::new(txn, next_begin);
        let placeholder = Revision::new(span, MemoValue::Context, Some(self.clone()));
        let ctx = Context::new(txn, self.clone(), placeholder.clone());
        placeholder.state.lock().context = Some(ctx.clone());
        insert_sorted(&mut st, placeholder);
        ctx
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invocation({:?})", self.key)
    }
}

/// Insert keeping the end-descending order.
fn insert_sorted(st: &mut InvState, rev: Arc<Revision>) {
    let end = rev.state.lock().end;
    let at = st
        .revisions
        .iter()
        .position(|r| r.state.lock().end <= end)
        .unwrap_or(st.revisions.len());
    st.revisions.insert(at, rev);
}

/// Replace a completed context's placeholder with a concrete
/// revision and deliver to everyone who queued up.
pub(crate) fn finish_evaluation(inv: &Arc<Invocation>, ctx: &Arc<Context>, value: MemoValue) {
    let (deps, callers) = ctx.complete();
    debug!(
        "{:?}: finishing at {:?} with {} deps, {} callers",
        inv,
        ctx.query_txn,
        deps.len(),
        callers.len()
    );

    // Candidate lifespan: intersection of the dependencies' current
    // spans; pure when there are none.
    let mut span = Some(Lifespan::pure());
    for d in &deps {
        span = span.and_then(|s| s.intersect(&d.lifespan()));
    }

    let final_rev = {
        let mut st = inv.state.lock();
        if let Some(i) = st
            .revisions
            .iter()
            .position(|r| Arc::ptr_eq(r, &ctx.placeholder))
        {
            st.revisions.remove(i);
        }
        {
            let mut ph = ctx.placeholder.state.lock();
            ph.owner = None;
            ph.context = None;
        }
        span.and_then(|span| insert_revision_locked(inv, &mut st, span, value.clone()))
    };

    // A merged-away neighbor may still hold a trace; release its
    // subscription edges now that no graph lock is held.
    if let Some((_, displaced)) = &final_rev {
        for rev in displaced {
            rev.clear_trace();
        }
    }
    let final_rev = final_rev.map(|(rev, _)| rev);

    if let Some(final_rev) = &final_rev {
        let is_head = {
            let st = inv.state.lock();
            st.revisions
                .first()
                .map_or(false, |r| Arc::ptr_eq(r, final_rev))
        };
        if is_head {
            // The trace always describes the newest computation: clear
            // whatever the merged-into revision carried, then install
            // the fresh edges. The displaced second entry (the old
            // head, if any) loses its trace per the head-only rule.
            final_rev.clear_trace();
            if !value.is_placeholder() {
                install_trace(final_rev, &deps);
            }
            let second = { inv.state.lock().revisions.get(1).cloned() };
            if let Some(second) = second {
                second.clear_trace();
            }
        }
        register_cleanup_if_needed(inv);
    }

    // Delivery happens with no graph locks held; callers are free to
    // re-enter the evaluation API.
    for caller in callers {
        match &final_rev {
            Some(rev) if rev.lifespan().contains(caller.query_txn()) => {
                caller.add_dependency(rev);
                caller.deliver(&value);
            }
            _ => {
                debug!("{:?}: caller outside final lifespan, retrying", inv);
                inv.async_evaluate(caller);
            }
        }
    }
    crate::intern::drain_deferred_decrefs();
}

/// List surgery under the invocation lock: resolve placeholder
/// overlaps, merge with touching equal-valued neighbors, or insert
/// fresh. Returns the surviving revision plus any revisions displaced
/// by merging (whose traces the caller must release outside the lock),
/// or `None` when the candidate span was swallowed by concurrent
/// truncations.
fn insert_revision_locked(
    inv: &Arc<Invocation>,
    st: &mut InvState,
    mut span: Lifespan,
    value: MemoValue,
) -> Option<(Arc<Revision>, Vec<Arc<Revision>>)> {
    // On the merge and shadowed paths below `value` is dropped right
    // here, under the invocation lock (and sometimes a revision lock
    // too). A final decref there could cascade into a finalizer inside
    // the lock hierarchy, so park one reference; the caller's
    // drain_deferred_decrefs runs after unlock and does the last
    // release.
    if let Some(payload) = value.iobj() {
        crate::intern::defer_decref(payload.clone());
    }

    // Pass 1: clear the span of overlaps.
    let mut remove: Vec<usize> = Vec::new();
    for (i, rev) in st.revisions.iter().enumerate() {
        let mut r = rev.state.lock();
        let overlaps = r.begin < span.end && span.begin < r.end;
        if !overlaps {
            continue;
        }
        if r.value.is_placeholder() {
            // Truncate the placeholder to the part that still contains
            // its own query txn; drop it entirely when the candidate
            // covers that too.
            let q = r
                .context
                .as_ref()
                .map(|c| c.query_txn)
                .unwrap_or(r.begin);
            if span.contains(q) {
                remove.push(i);
                r.owner = None;
            } else if q < span.begin {
                r.end = span.begin;
            } else {
                r.begin = span.end;
            }
        } else {
            // A concrete revision always wins the range it already
            // covers; shrink the candidate around it.
            if r.begin <= span.begin {
                if r.end >= span.end {
                    // Fully covered: someone beat us to it.
                    return if r.value == value {
                        Some((rev.clone(), Vec::new()))
                    } else {
                        debug!("{:?}: candidate fully shadowed", inv);
                        None
                    };
                }
                span.begin = r.end;
            } else {
                span.end = r.begin;
            }
            if span.begin >= span.end {
                return None;
            }
        }
    }
    for i in remove.into_iter().rev() {
        st.revisions.remove(i);
    }
    normalize_order(st);

    // Pass 2: merge with touching neighbors of equal value. Extending
    // the older neighbor preserves its identity, which is what lets a
    // refresher upstream treat the recompute as a non-change.
    let mut above: Option<Arc<Revision>> = None;
    let mut below: Option<Arc<Revision>> = None;
    for rev in st.revisions.iter() {
        let r = rev.state.lock();
        if r.value.is_placeholder() || r.value != value {
            continue;
        }
        if r.begin == span.end {
            above = Some(rev.clone());
        } else if r.end == span.begin {
            below = Some(rev.clone());
        }
    }

    let mut displaced: Vec<Arc<Revision>> = Vec::new();
    let final_rev = match (above, below) {
        (Some(above), Some(below)) => {
            let above_end = above.state.lock().end;
            below.state.lock().end = above_end;
            let i = st
                .revisions
                .iter()
                .position(|r| Arc::ptr_eq(r, &above))
                .expect("merge neighbor vanished");
            st.revisions.remove(i);
            above.state.lock().owner = None;
            displaced.push(above);
            below
        }
        (Some(above), None) => {
            above.state.lock().begin = span.begin;
            above
        }
        (None, Some(below)) => {
            below.state.lock().end = span.end;
            below
        }
        (None, None) => {
            let rev = Revision::new(span, value, Some(inv.clone()));
            st.revisions.push(rev.clone());
            rev
        }
    };
    normalize_order(st);
    Some((final_rev, displaced))
}

/// Re-establish the end-descending order after span surgery.
pub(crate) fn normalize_order(st: &mut InvState) {
    let mut keyed: Vec<(TxnId, Arc<Revision>)> = st
        .revisions
        .drain(..)
        .map(|r| {
            let end = r.state.lock().end;
            (end, r)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.cmp(&a.0));
    st.revisions = keyed.into_iter().map(|(_, r)| r).collect();
}

/// Subscribe `target` to every (non-pure) dependency and install the
/// resulting trace, then re-check the inputs: anything that was
/// truncated while we were wiring up truncates the target too, so a
/// late invalidation cannot be missed.
pub(crate) fn install_trace(target: &Arc<Revision>, deps: &[Arc<Revision>]) {
    let tracked: Vec<Arc<Revision>> = deps
        .iter()
        .filter(|d| d.lifespan().begin != TxnId::PURE)
        .cloned()
        .collect();
    if tracked.is_empty() {
        return;
    }
    let inputs = collapse_fan_in(&tracked);

    let mut edges: Vec<TraceEdge> = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        let sub_index = input.state.lock().subs.insert(Subscriber::Revision {
            rev: Arc::downgrade(target),
            trace_index: i as u32,
        });
        edges.push(TraceEdge {
            input: input.clone(),
            sub_index,
        });
    }

    let mut inactive = 0u64;
    let mut truncate_to = TxnId::NEVER;
    for (i, edge) in edges.iter().enumerate() {
        let s = edge.input.lifespan();
        if s.end != TxnId::NEVER {
            inactive |= 1u64 << i;
            truncate_to = truncate_to.min(s.end);
        }
    }

    let mut st = target.state.lock();
    st.trace = Trace {
        edges: edges.into(),
        inactive,
    };
    if truncate_to < st.end {
        st.end = truncate_to.max(st.begin.next());
    }
}

/// Fan-in beyond the trace width goes through anonymous tree nodes:
/// each chunk of inputs hangs off a fresh ownerless revision which then
/// stands in for the chunk.
fn collapse_fan_in(inputs: &[Arc<Revision>]) -> Vec<Arc<Revision>> {
    if inputs.len() <= MAX_TRACE_SIZE {
        return inputs.to_vec();
    }
    let mut level: Vec<Arc<Revision>> = Vec::new();
    for chunk in inputs.chunks(MAX_TRACE_SIZE) {
        let mut span = Some(Lifespan::pure());
        for d in chunk {
            span = span.and_then(|s| s.intersect(&d.lifespan()));
        }
        let span = span.unwrap_or(Lifespan::new(TxnId::FIRST, TxnId::FIRST.next()));
        let node = Revision::new(span, MemoValue::Undef, None);
        install_trace(&node, chunk);
        level.push(node);
    }
    collapse_fan_in(&level)
}

/// Register for tail trimming once the tail's end txn ages out.
pub(crate) fn register_cleanup_if_needed(inv: &Arc<Invocation>) {
    let register_at = {
        let mut st = inv.state.lock();
        if st.owning_list == OwningList::Cleanup {
            return;
        }
        let tail_end = st
            .revisions
            .last()
            .map(|tail| tail.state.lock().end)
            .filter(|end| *end != TxnId::NEVER);
        if tail_end.is_some() {
            st.owning_list = OwningList::Cleanup;
        }
        tail_end
    };
    if let Some(end) = register_at {
        Runtime::global().cleanups.insert(end, inv.clone());
    }
}
