//! Revisions: one cached `(value, lifespan)` per entry of an
//! invocation's history, plus the dependency edges between them.
//!
//! Edge bookkeeping is symmetric: a trace edge in a consumer stores the
//! index of its paired slot in the input's subscription set, and that
//! slot stores the edge's index back, so either side can disconnect in
//! O(1) without searching.
//!
//! Locking: a revision's mutable state sits behind its own mutex, which
//! is a leaf in the lock hierarchy -- never acquire a second revision or
//! invocation mutex while holding one. Invalidation walks upward
//! (children before parents) through a worklist that re-acquires fresh
//! locks at every step.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

use crate::memo::invocation::Invocation;
use crate::memo::watcher::InvalidationWatcher;
use crate::memo::Context;
use crate::txn::{Lifespan, TxnId};
use crate::value::MemoValue;

/// Inputs per trace node. Wider fan-in goes through intermediate
/// anonymous revisions that act as tree nodes.
pub const MAX_TRACE_SIZE: usize = 64;

pub struct Revision {
    pub(crate) state: Mutex<RevState>,
}

pub(crate) struct RevState {
    pub begin: TxnId,
    pub end: TxnId,
    pub value: MemoValue,
    /// Backlink to the owning invocation. Detached in O(1) when the
    /// owner evicts this revision, which breaks the ownership cycle.
    pub owner: Option<Arc<Invocation>>,
    /// Present while this revision is a placeholder.
    pub context: Option<Arc<Context>>,
    pub trace: Trace,
    pub subs: SubscriptionSet,
    pub refresher: Option<Arc<crate::memo::refresher::Refresher>>,
}

impl Revision {
    pub(crate) fn new(
        span: Lifespan,
        value: MemoValue,
        owner: Option<Arc<Invocation>>,
    ) -> Arc<Revision> {
        Arc::new(Revision {
            state: Mutex::new(RevState {
                begin: span.begin,
                end: span.end,
                value,
                owner,
                context: None,
                trace: Trace::default(),
                subs: SubscriptionSet::default(),
                refresher: None,
            }),
        })
    }

    pub fn lifespan(&self) -> Lifespan {
        let st = self.state.lock();
        Lifespan::new(st.begin, st.end)
    }

    pub fn value(&self) -> MemoValue {
        self.state.lock().value.clone()
    }

    pub fn is_placeholder(&self) -> bool {
        self.state.lock().value.is_placeholder()
    }

    /// Whether a refresher could extend this revision without a rerun:
    /// it has a concrete value and still carries its trace.
    pub(crate) fn can_refresh(st: &RevState) -> bool {
        !st.value.is_placeholder() && !st.trace.is_empty()
    }

    /// Disconnect this revision's trace, unsubscribing every edge.
    /// Returns the edges so the caller can drop them lock-free.
    pub(crate) fn clear_trace(self: &Arc<Self>) -> Vec<TraceEdge> {
        let trace = {
            let mut st = self.state.lock();
            std::mem::take(&mut st.trace)
        };
        for edge in trace.edges.iter() {
            edge.input.state.lock().subs.remove(edge.sub_index);
        }
        trace.edges.into_vec()
    }
}

impl std::fmt::Debug for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        write!(
            f,
            "Revision[{:?}..{:?}] = {:?}",
            st.begin, st.end, st.value
        )
    }
}

/// A single dependency edge: strong reference to the input revision and
/// the index of our paired slot in its subscription set.
pub(crate) struct TraceEdge {
    pub input: Arc<Revision>,
    pub sub_index: u32,
}

/// The set of inputs one revision depended on, in observation order.
/// One inline slot covers the common single-input case; the `inactive`
/// bitmask records which inputs are known to no longer extend to
/// `TxnId::NEVER`.
#[derive(Default)]
pub(crate) struct Trace {
    pub edges: SmallVec<[TraceEdge; 1]>,
    pub inactive: u64,
}

impl Trace {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn mark_inactive(&mut self, index: u32) {
        debug_assert!((index as usize) < MAX_TRACE_SIZE);
        self.inactive |= 1u64 << index;
    }

    pub fn mark_active(&mut self, index: u32) {
        self.inactive &= !(1u64 << index);
    }

    pub fn is_inactive(&self, index: u32) -> bool {
        self.inactive & (1u64 << index) != 0
    }
}

/// One reverse edge out of an input revision.
pub(crate) enum Subscriber {
    /// A consumer revision; `trace_index` points back at the paired
    /// edge in its trace.
    Revision {
        rev: Weak<Revision>,
        trace_index: u32,
    },
    /// An invalidation watcher installed by the reactive API.
    Watcher(Arc<InvalidationWatcher>),
}

/// Reverse edges. One inline slot, freelist reuse for the rest; slot
/// indices stay stable so trace edges can address them directly.
#[derive(Default)]
pub(crate) struct SubscriptionSet {
    slots: SmallVec<[Option<Subscriber>; 1]>,
    free: SmallVec<[u32; 2]>,
}

impl SubscriptionSet {
    pub fn insert(&mut self, sub: Subscriber) -> u32 {
        if let Some(i) = self.free.pop() {
            debug_assert!(self.slots[i as usize].is_none());
            self.slots[i as usize] = Some(sub);
            i
        } else {
            self.slots.push(Some(sub));
            (self.slots.len() - 1) as u32
        }
    }

    pub fn remove(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            if slot.take().is_some() {
                self.free.push(index);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Snapshot the live subscribers (dead weak refs are skipped).
    pub fn snapshot(&self) -> Vec<SubscriberRef> {
        let mut out = Vec::new();
        for slot in self.slots.iter() {
            match slot {
                Some(Subscriber::Revision { rev, trace_index }) => {
                    if let Some(rev) = rev.upgrade() {
                        out.push(SubscriberRef::Revision {
                            rev,
                            trace_index: *trace_index,
                        });
                    }
                }
                Some(Subscriber::Watcher(w)) => {
                    out.push(SubscriberRef::Watcher(w.clone()));
                }
                None => {}
            }
        }
        out
    }
}

pub(crate) enum SubscriberRef {
    Revision { rev: Arc<Revision>, trace_index: u32 },
    Watcher(Arc<InvalidationWatcher>),
}

/// Truncate `rev`'s lifespan to end at `txn` and propagate the
/// invalidation to its subscribers.
///
/// The worklist discipline keeps the lock order child-before-parent:
/// each pop locks exactly one revision, snapshots its subscribers,
/// unlocks, and then touches each subscriber under that subscriber's
/// own (fresh) lock.
pub(crate) fn invalidate(rev: &Arc<Revision>, txn: TxnId, fired_watchers: &mut Vec<Arc<InvalidationWatcher>>) {
    let mut work: Vec<Arc<Revision>> = vec![rev.clone()];
    while let Some(r) = work.pop() {
        let subscribers = {
            let st = r.state.lock();
            st.subs.snapshot()
        };
        for sub in subscribers {
            match sub {
                SubscriberRef::Revision { rev: parent, trace_index } => {
                    let mut push = false;
                    {
                        let mut st = parent.state.lock();
                        st.trace.mark_inactive(trace_index);
                        if st.end == TxnId::NEVER {
                            st.end = txn;
                            push = true;
                        }
                        // A subscriber that cannot be refreshed (a
                        // placeholder, or one whose value is gone)
                        // passes the invalidation straight through to
                        // its own dependents.
                        if !Revision::can_refresh(&st) {
                            push = true;
                        }
                    }
                    if push {
                        work.push(parent);
                    }
                }
                SubscriberRef::Watcher(w) => {
                    if w.fire() {
                        fired_watchers.push(w);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_slots_recycle() {
        let mut subs = SubscriptionSet::default();
        let w = Arc::new(InvalidationWatcher::for_tests());
        let a = subs.insert(Subscriber::Watcher(w.clone()));
        let b = subs.insert(Subscriber::Watcher(w.clone()));
        assert_ne!(a, b);
        subs.remove(a);
        let c = subs.insert(Subscriber::Watcher(w));
        assert_eq!(a, c);
        assert_eq!(subs.snapshot().len(), 2);
    }

    #[test]
    fn trace_inactive_bits() {
        let mut t = Trace::default();
        assert!(!t.is_inactive(3));
        t.mark_inactive(3);
        assert!(t.is_inactive(3));
        t.mark_active(3);
        assert!(!t.is_inactive(3));
    }
}
