//! Processes: the unit of single-threaded execution.
//!
//! A process owns one obstack and one MPSC task queue. Any thread may
//! post to the queue; only the owning thread drains it, so within a
//! process all work is strictly sequential and the obstack needs no
//! synchronization. A thread hosts one process at a time through the
//! thread-local switcher; deferred callbacks are expressed as tasks so
//! they run after the poster has released its locks.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use crate::obstack::Obstack;

pub type Task = Box<dyn FnOnce() + Send>;

/// The cross-thread half of a process: the queue and its wakeup.
struct ProcessShared {
    queue: Mutex<VecDeque<Task>>,
    ready: Condvar,
}

impl ProcessShared {
    fn post(&self, task: Task) {
        self.queue.lock().push_back(task);
        self.ready.notify_one();
    }
}

pub struct Process {
    shared: Arc<ProcessShared>,
    obstack: RefCell<Obstack>,
}

impl Process {
    pub fn new() -> Rc<Process> {
        Rc::new(Process {
            shared: Arc::new(ProcessShared {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }),
            obstack: RefCell::new(Obstack::new()),
        })
    }

    /// Enqueue a task. Callable from any thread holding a handle.
    pub fn schedule(&self, task: Task) {
        self.shared.post(task);
    }

    /// A weak handle for posting back to this process without keeping
    /// it alive.
    pub fn unowned(&self) -> UnownedProcess {
        UnownedProcess {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Run queued tasks until the queue is empty.
    pub fn run_ready_tasks(&self) {
        loop {
            let task = self.shared.queue.lock().pop_front();
            match task {
                Some(t) => t(),
                None => return,
            }
        }
    }

    /// Run exactly one task, blocking until one arrives.
    pub fn run_exactly_one_task_sleeping_if_necessary(&self) {
        let task = {
            let mut q = self.shared.queue.lock();
            while q.is_empty() {
                self.shared.ready.wait(&mut q);
            }
            q.pop_front().expect("woken with empty queue")
        };
        task();
    }

    /// Borrow the process obstack. Owner-thread only.
    pub fn with_obstack<R>(&self, f: impl FnOnce(&mut Obstack) -> R) -> R {
        f(&mut self.obstack.borrow_mut())
    }
}

/// Weak posting handle; see [`Process::unowned`].
#[derive(Clone)]
pub struct UnownedProcess {
    shared: Weak<ProcessShared>,
}

impl UnownedProcess {
    /// Post a task; false if the process is gone.
    pub fn schedule(&self, task: Task) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.post(task);
                true
            }
            None => false,
        }
    }

    /// Post an empty task purely to wake a sleeping drain loop.
    pub fn poke(&self) -> bool {
        self.schedule(Box::new(|| {}))
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Process>>> = RefCell::new(None);
}

/// The process this thread is hosting, created lazily.
pub fn current_process() -> Rc<Process> {
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        match &*cur {
            Some(p) => p.clone(),
            None => {
                let p = Process::new();
                *cur = Some(p.clone());
                p
            }
        }
    })
}

/// Host `process` on this thread for the duration of `f`, restoring the
/// previous process afterwards (including on unwind).
pub fn with_process<R>(process: Rc<Process>, f: impl FnOnce(&Process) -> R) -> R {
    let prev = CURRENT.with(|c| c.borrow_mut().replace(process.clone()));
    let _restore = scopeguard::guard(prev, |prev| {
        CURRENT.with(|c| *c.borrow_mut() = prev);
    });
    f(&process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_in_post_order() {
        let p = Process::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = log.clone();
            p.schedule(Box::new(move || log.lock().push(i)));
        }
        p.run_ready_tasks();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn unowned_posting_crosses_threads() {
        let p = Process::new();
        let unowned = p.unowned();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let t = std::thread::spawn(move || {
            assert!(unowned.schedule(Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })));
        });
        t.join().unwrap();
        p.run_exactly_one_task_sleeping_if_necessary();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unowned_survives_process_death() {
        let p = Process::new();
        let unowned = p.unowned();
        drop(p);
        assert!(!unowned.poke());
    }
}
