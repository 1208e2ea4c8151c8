//! Transactions: batched cell assignments that become visible
//! atomically at one freshly-allocated TxnId.

use log::debug;
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::sync::Arc;

use crate::memo::invocation::{register_cleanup_if_needed, Invocation};
use crate::memo::revision::{invalidate, Revision};
use crate::memo::watcher::InvalidationWatcher;
use crate::memo::Runtime;
use crate::txn::{Lifespan, TxnId};
use crate::value::MemoValue;

#[derive(Default)]
pub struct Transaction {
    writes: Vec<(Arc<Invocation>, MemoValue)>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::default()
    }

    /// Queue an assignment. The last write to a given invocation wins.
    pub fn set(&mut self, target: &Arc<Invocation>, value: MemoValue) {
        self.writes.push((target.clone(), value));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Make every queued assignment visible at one new TxnId.
    /// Returns `None` when nothing effectively changed -- a no-op batch
    /// does not consume a TxnId.
    pub fn commit(self) -> Option<TxnId> {
        let rt = Runtime::global();
        let guard = rt.txn_mutex.lock();
        let begin = rt.newest_visible_txn().next();

        let mut fired_watchers: Vec<Arc<InvalidationWatcher>> = Vec::new();
        let mut changed = false;
        let mut seen: FxHashSet<usize> = FxHashSet::default();

        // Latest assignment per invocation wins: walk in reverse and
        // skip anything already handled.
        for (inv, value) in self.writes.iter().rev() {
            if !seen.insert(Arc::as_ptr(inv) as usize) {
                continue;
            }

            let truncated: Option<Arc<Revision>> = {
                let mut st = inv.state.lock();
                let head = st.revisions.first().cloned();
                match head {
                    Some(head) => {
                        let mut h = head.state.lock();
                        if h.end == TxnId::NEVER && h.value == *value {
                            debug!("{:?}: coalesced non-change", inv);
                            None
                        } else {
                            if h.end > begin {
                                h.end = begin;
                            }
                            drop(h);
                            let fresh =
                                Revision::new(Lifespan::new(begin, TxnId::NEVER), value.clone(), Some(inv.clone()));
                            st.revisions.insert(0, fresh);
                            changed = true;
                            Some(head)
                        }
                    }
                    None => {
                        let fresh =
                            Revision::new(Lifespan::new(begin, TxnId::NEVER), value.clone(), Some(inv.clone()));
                        st.revisions.insert(0, fresh);
                        changed = true;
                        None
                    }
                }
            };

            if let Some(old_head) = truncated {
                // Propagate child-first with no invocation lock held.
                invalidate(&old_head, begin, &mut fired_watchers);
                register_cleanup_if_needed(inv);
            }
        }

        if !changed {
            drop(guard);
            return None;
        }

        rt.publish_commit(begin);
        drop(guard);
        debug!("committed {:?}", begin);

        // Watchers run with no locks held and may re-enter evaluation.
        for w in fired_watchers {
            w.notify();
        }
        crate::intern::drain_deferred_decrefs();
        Some(begin)
    }
}

thread_local! {
    static CURRENT_TXN: RefCell<Option<Transaction>> = RefCell::new(None);
}

/// Run `f` with a transaction collecting every cell write made through
/// the reactive API on this thread, then commit the batch as one txn.
pub fn with_transaction<R>(f: impl FnOnce() -> R) -> (R, Option<TxnId>) {
    let prev = CURRENT_TXN.with(|t| t.borrow_mut().replace(Transaction::new()));
    let result = f();
    let txn = CURRENT_TXN
        .with(|t| std::mem::replace(&mut *t.borrow_mut(), prev))
        .expect("transaction vanished mid-scope");
    (result, txn.commit())
}

/// Route one write through the ambient transaction when there is one,
/// or commit it immediately.
pub(crate) fn write_through(target: &Arc<Invocation>, value: MemoValue) -> Option<TxnId> {
    let deferred = CURRENT_TXN.with(|t| {
        let mut cur = t.borrow_mut();
        match &mut *cur {
            Some(txn) => {
                txn.set(target, value.clone());
                true
            }
            None => false,
        }
    });
    if deferred {
        None
    } else {
        let mut txn = Transaction::new();
        txn.set(target, value);
        txn.commit()
    }
}
