//! Awaitables: the bridge between generated async code and the memo
//! graph.
//!
//! The continuation word is a tagged value: one of the terminal
//! sentinels (value ready / exception ready), or the head of a linked
//! list of suspended waiters. Suspension pushes onto the list with a
//! compare-exchange; completion swaps the terminal sentinel in and
//! posts a single wake task that walks whatever list it captured. No
//! coroutine machinery is required: a waiter is just a task.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{DomainError, RuntimeError};
use crate::process::{current_process, Task};
use crate::value::MemoValue;

const PENDING: usize = 0;
const VALUE_READY: usize = 1;
const EXCEPTION_READY: usize = 2;
// Any other word value is a `*mut WaiterNode`.

struct WaiterNode {
    task: Task,
    next: usize,
}

pub struct Awaitable {
    word: AtomicUsize,
    result: Mutex<Option<MemoValue>>,
}

pub type AwaitableRef = Arc<Awaitable>;

impl Awaitable {
    pub fn new() -> AwaitableRef {
        Arc::new(Awaitable {
            word: AtomicUsize::new(PENDING),
            result: Mutex::new(None),
        })
    }

    fn is_terminal(word: usize) -> bool {
        word == VALUE_READY || word == EXCEPTION_READY
    }

    /// The completed result: `Ok` for a value, `Err` for an exception
    /// payload. `None` while still pending.
    pub fn poll(&self) -> Option<Result<MemoValue, MemoValue>> {
        let word = self.word.load(Ordering::Acquire);
        if !Self::is_terminal(word) {
            return None;
        }
        let value = self
            .result
            .lock()
            .clone()
            .expect("terminal awaitable without result");
        Some(if word == VALUE_READY {
            Ok(value)
        } else {
            Err(value)
        })
    }

    /// Register `waiter` to run once this awaitable completes. If it
    /// is already complete the waiter is returned to the caller to run
    /// inline -- an `await` on a finished awaitable never suspends.
    pub fn suspend(&self, waiter: Task) -> Result<(), Task> {
        let mut node = Box::new(WaiterNode {
            task: waiter,
            next: PENDING,
        });
        let mut head = self.word.load(Ordering::Acquire);
        loop {
            if Self::is_terminal(head) {
                return Err(node.task);
            }
            node.next = head;
            let ptr = Box::into_raw(node);
            match self.word.compare_exchange_weak(
                head,
                ptr as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => {
                    node = unsafe { Box::from_raw(ptr) };
                    head = observed;
                }
            }
        }
    }

    /// Complete with `value` (an exception payload completes
    /// exceptionally) and post one wake task for the captured waiters.
    pub fn finish(&self, value: MemoValue) {
        let terminal = if value.is_exception() {
            EXCEPTION_READY
        } else {
            VALUE_READY
        };
        *self.result.lock() = Some(value);
        let head = self.word.swap(terminal, Ordering::AcqRel);
        debug_assert!(!Self::is_terminal(head), "awaitable finished twice");
        if head == PENDING {
            return;
        }
        current_process().schedule(Box::new(move || {
            let mut node_ptr = head;
            while node_ptr != PENDING {
                let node = unsafe { Box::from_raw(node_ptr as *mut WaiterNode) };
                node_ptr = node.next;
                (node.task)();
            }
        }));
    }
}

impl Drop for Awaitable {
    fn drop(&mut self) {
        // An abandoned pending awaitable still owns its waiter list.
        let mut node_ptr = *self.word.get_mut();
        while node_ptr != PENDING && !Self::is_terminal(node_ptr) {
            let node = unsafe { Box::from_raw(node_ptr as *mut WaiterNode) };
            node_ptr = node.next;
        }
    }
}

/// `await` on an awaitable that must already be complete.
pub fn awaitable_ready_or_throw(aw: &AwaitableRef) -> Result<MemoValue, MemoValue> {
    aw.poll().expect("awaitable is not ready")
}

/// Drive the current process until `aw` completes, then return its
/// result. This is the synchronous face of `await` for host callers.
pub fn awaitable_sync_or_throw(aw: &AwaitableRef) -> Result<MemoValue, MemoValue> {
    loop {
        if let Some(r) = aw.poll() {
            return r;
        }
        let p = current_process();
        p.run_exactly_one_task_sleeping_if_necessary();
    }
}

/// Complete `aw` exceptionally with a domain error reified as a value.
pub fn awaitable_throw(aw: &AwaitableRef, err: DomainError) {
    let payload = crate::intern::intern_string(&err.to_string());
    aw.finish(MemoValue::Exception(payload));
}

/// Unwrap an awaitable result for a host caller, converting an
/// exception payload into a printable runtime error.
pub fn result_or_error(r: Result<MemoValue, MemoValue>) -> Result<MemoValue, RuntimeError> {
    r.map_err(|exn| {
        let msg = match &exn {
            MemoValue::Exception(payload) => crate::intern::string_value(payload).to_string(),
            other => format!("{:?}", other),
        };
        RuntimeError::InvariantViolation(format!("uncaught exception: {}", msg))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn finished_awaitable_never_suspends() {
        let aw = Awaitable::new();
        aw.finish(MemoValue::Int(9));
        match aw.suspend(Box::new(|| {})) {
            Ok(()) => panic!("suspended on a complete awaitable"),
            Err(_inline) => {}
        }
        assert_eq!(aw.poll(), Some(Ok(MemoValue::Int(9))));
    }

    #[test]
    fn waiters_run_after_finish() {
        let aw = Awaitable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            if aw
                .suspend(Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .is_err()
            {
                panic!("still pending");
            }
        }
        aw.finish(MemoValue::Int(1));
        current_process().run_ready_tasks();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exceptions_travel_the_error_arm() {
        let aw = Awaitable::new();
        awaitable_throw(&aw, DomainError::DivisionByZero);
        match aw.poll() {
            Some(Err(MemoValue::Exception(payload))) => {
                assert_eq!(crate::intern::string_value(&payload), "division by zero");
            }
            other => panic!("unexpected poll result: {:?}", other.is_some()),
        }
    }
}
