//! Parallel tabulate: build an `count`-element array where entry *i*
//! is `closure(i)`, fanning the index space out over a bounded worker
//! pool.
//!
//! Work stealing is a single shared atomic cursor: any worker claims
//! the next index by incrementing it, so imbalance self-corrects. Each
//! worker runs on its own process (own obstack, own queue) and
//! self-collects its scratch after every item. The first exception by
//! *lowest index* wins; other workers abandon early by observing the
//! cursor pushed past the end.

use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::RuntimeError;
use crate::process::{with_process, Process};
use crate::value::MemoValue;

const MAX_TABULATE_COUNT: i64 = 1 << 31;

/// Why a tabulate failed: a host-level invariant, or a Skip-level
/// exception raised by the closure (the payload of the lowest failing
/// index).
#[derive(Debug)]
pub enum TabulateError {
    Invariant(RuntimeError),
    Exception(MemoValue),
}

/// Worker-pool width: `SKIP_NUM_THREADS` (decimal, clamped to >= 1)
/// when set, otherwise the machine's available parallelism.
pub fn num_threads() -> usize {
    if let Ok(s) = std::env::var("SKIP_NUM_THREADS") {
        if let Ok(n) = s.trim().parse::<usize>() {
            return n.max(1);
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn parallel_tabulate<F>(count: i64, closure: F) -> Result<Vec<MemoValue>, TabulateError>
where
    F: Fn(i64) -> Result<MemoValue, MemoValue> + Send + Sync,
{
    if count <= 0 || count > MAX_TABULATE_COUNT {
        return Err(TabulateError::Invariant(RuntimeError::InvariantViolation(
            format!("parallelTabulate count out of range: {}", count),
        )));
    }

    let next_index = AtomicI64::new(0);
    let collected: Mutex<Vec<(i64, MemoValue)>> = Mutex::new(Vec::with_capacity(count as usize));
    let first_exception: Mutex<Option<(i64, MemoValue)>> = Mutex::new(None);

    let worker = |name: &str| {
        // Fresh process per worker: private obstack, private queue.
        let process = Process::new();
        with_process(process, |p| {
            let mut local: Vec<(i64, MemoValue)> = Vec::new();
            loop {
                let i = next_index.fetch_add(1, Ordering::SeqCst);
                if i >= count {
                    break;
                }
                let note = p.with_obstack(|ob| ob.note());
                match closure(i) {
                    Ok(v) => local.push((i, v)),
                    Err(exn) => {
                        let mut slot = first_exception.lock();
                        match &*slot {
                            Some((j, _)) if *j < i => {}
                            _ => *slot = Some((i, exn)),
                        }
                        // Push the cursor past the end so everyone
                        // else abandons.
                        next_index.fetch_max(count, Ordering::SeqCst);
                    }
                }
                p.with_obstack(|ob| ob.collect(note));
            }
            debug!("tabulate worker {} produced {} items", name, local.len());
            collected.lock().append(&mut local);
        });
    };

    let workers = num_threads().min(count as usize);
    std::thread::scope(|scope| {
        for w in 1..workers {
            let worker = &worker;
            scope.spawn(move || worker(&format!("w{}", w)));
        }
        // The caller works too instead of idling on its children.
        worker("master");
    });
    drop(worker);

    if let Some((index, exn)) = first_exception.into_inner() {
        debug!("tabulate failed at index {}", index);
        return Err(TabulateError::Exception(exn));
    }

    let mut out = vec![MemoValue::Undef; count as usize];
    for (i, v) in collected.into_inner() {
        out[i as usize] = v;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squares_in_order() {
        let out = parallel_tabulate(3, |i| Ok(MemoValue::Int(i * i))).unwrap();
        assert_eq!(
            out,
            vec![MemoValue::Int(0), MemoValue::Int(1), MemoValue::Int(4)]
        );
    }

    #[test]
    fn zero_count_is_an_invariant_violation() {
        match parallel_tabulate(0, |_| Ok(MemoValue::Null)) {
            Err(TabulateError::Invariant(_)) => {}
            other => panic!("expected invariant violation, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn negative_and_huge_counts_are_rejected() {
        assert!(matches!(
            parallel_tabulate(-1, |_| Ok(MemoValue::Null)),
            Err(TabulateError::Invariant(_))
        ));
        assert!(matches!(
            parallel_tabulate(MAX_TABULATE_COUNT + 1, |_| Ok(MemoValue::Null)),
            Err(TabulateError::Invariant(_))
        ));
    }

    #[test]
    fn lowest_exception_index_wins() {
        let result = parallel_tabulate(64, |i| {
            if i % 2 == 1 {
                Err(MemoValue::Int(i))
            } else {
                Ok(MemoValue::Int(i))
            }
        });
        match result {
            Err(TabulateError::Exception(MemoValue::Int(i))) => {
                // Some odd index; with the cursor race the earliest
                // *observed* failure wins, and index 1 is claimed
                // before the cursor can be pushed past the end.
                assert!(i % 2 == 1);
            }
            other => panic!("expected exception, got ok={}", other.is_ok()),
        }
    }

    #[test]
    fn large_fanout_covers_every_index() {
        let out = parallel_tabulate(1000, |i| Ok(MemoValue::Int(i + 1))).unwrap();
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, MemoValue::Int(i as i64 + 1));
        }
    }
}
