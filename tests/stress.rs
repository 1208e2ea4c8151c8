//! Randomized readers and writers hammering one shared graph. The test
//! passes when nothing deadlocks, panics, or violates the revision
//! ordering invariants along the way.

mod common;

use common::{call, define_fn};
use rand::Rng;
use std::sync::Arc;

use skip_runtime::{evaluate_sync, Cell, MemoValue, Runtime};

const N_CELLS: usize = 8;
const N_MUTATOR_OPS: usize = 60;
const N_READER_OPS: usize = 40;

#[derive(Clone, Copy, Debug)]
enum ReadOp {
    /// Evaluate `sum(key)` at the newest txn.
    Sum(usize),
    /// Evaluate `scaled(key)` at the newest txn.
    Scaled(usize),
    /// Ask the runtime to discard one LRU entry.
    Discard,
}

fn random_read(rng: &mut impl Rng) -> ReadOp {
    match rng.gen_range(0..10) {
        0 => ReadOp::Discard,
        n if n < 6 => ReadOp::Sum(rng.gen_range(0..N_CELLS)),
        _ => ReadOp::Scaled(rng.gen_range(0..N_CELLS)),
    }
}

#[test]
fn stress_readers_and_writers() {
    let cells: Arc<Vec<Cell>> = Arc::new(
        (0..N_CELLS)
            .map(|i| Cell::new(MemoValue::Int(i as i64)))
            .collect(),
    );

    // sum(k) = cells[k] + cells[(k+1) % N]
    let cells_for_sum = cells.clone();
    let sum = define_fn("stress::sum", move |ctx, k| {
        let k = k as usize;
        let a = cells_for_sum[k].get(ctx).as_int().unwrap();
        let b = cells_for_sum[(k + 1) % N_CELLS].get(ctx).as_int().unwrap();
        MemoValue::Int(a + b)
    });

    // scaled(k) = 3 * sum(k), a second dependency layer so refreshes
    // and invalidations propagate through intermediate revisions.
    let scaled = define_fn("stress::scaled", move |ctx, k| {
        let inner = ctx.evaluate(&call(sum, k)).as_int().unwrap();
        MemoValue::Int(3 * inner)
    });

    let mut rng = rand::thread_rng();
    let mut readers = Vec::new();

    for _ in 0..N_MUTATOR_OPS {
        if rng.gen_bool(0.5) {
            let key = rng.gen_range(0..N_CELLS);
            let value = rng.gen_range(0..100i64);
            let _ = cells[key].set(MemoValue::Int(value));
        } else {
            let ops: Vec<ReadOp> = (0..N_READER_OPS).map(|_| random_read(&mut rng)).collect();
            readers.push(std::thread::spawn(move || {
                for op in ops {
                    match op {
                        ReadOp::Sum(k) => {
                            let v = evaluate_sync(&call(sum, k as i64)).unwrap();
                            assert!(v.as_int().is_some());
                        }
                        ReadOp::Scaled(k) => {
                            let v = evaluate_sync(&call(scaled, k as i64)).unwrap();
                            let n = v.as_int().unwrap();
                            assert_eq!(n % 3, 0, "scaled must be a multiple of 3");
                        }
                        ReadOp::Discard => {
                            Runtime::global().discard_lru_entry();
                        }
                    }
                }
            }));
        }
    }

    for t in readers {
        t.join().unwrap();
    }

    // Post-run invariant sweep: every surviving revision list is
    // sorted and non-overlapping.
    for k in 0..N_CELLS {
        for inv in [call(sum, k as i64), call(scaled, k as i64)] {
            let spans = inv.revision_spans();
            for w in spans.windows(2) {
                assert!(w[0].end > w[1].end, "unsorted spans: {:?}", spans);
                assert!(w[0].begin >= w[1].end, "overlapping spans: {:?}", spans);
            }
        }
    }

    // Readers see a consistent final state.
    let total = evaluate_sync(&call(scaled, 0)).unwrap();
    let base = evaluate_sync(&call(sum, 0)).unwrap();
    assert_eq!(total.as_int().unwrap(), 3 * base.as_int().unwrap());
}
