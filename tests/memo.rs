//! End-to-end behavior of the memoization graph: hits, invalidation,
//! refresh, MVCC reads, transactions, watchers.

mod common;

use common::{call, define_fn, eval};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use skip_runtime::{
    evaluate_sync_at, with_transaction, Cell, MemoValue, Runtime, TxnId,
};

#[test]
fn pure_function_memoizes_without_new_revisions() {
    let f = define_fn("tests::double", |_ctx, x| MemoValue::Int(x * 2));
    assert_eq!(eval(f, 21), MemoValue::Int(42));

    let inv = call(f, 21);
    assert_eq!(inv.revision_count(), 1);
    assert_eq!(eval(f, 21), MemoValue::Int(42));
    assert_eq!(inv.revision_count(), 1, "second hit must not allocate");

    // A pure value spans all of time.
    let spans = inv.revision_spans();
    assert_eq!(spans[0].begin, TxnId::PURE);
    assert_eq!(spans[0].end, TxnId::NEVER);
}

#[test]
fn cell_write_invalidates_dependent() {
    let c = Cell::new(MemoValue::Int(1));
    let c2 = c.clone();
    let f = define_fn("tests::twice_cell", move |ctx, _| {
        let v = c2.get(ctx).as_int().unwrap();
        MemoValue::Int(2 * v)
    });

    assert_eq!(eval(f, 0), MemoValue::Int(2));

    let t = c.set(MemoValue::Int(5)).expect("commit produced no txn");

    // The dependent's now-stale revision was truncated at the commit.
    let inv = call(f, 0);
    let spans = inv.revision_spans();
    assert!(
        spans.iter().any(|s| s.end == t),
        "expected a revision ending at {:?}, got {:?}",
        t,
        spans
    );

    assert_eq!(eval(f, 0), MemoValue::Int(10));
}

#[test]
fn sum_of_two_cells_tracks_the_changed_one() {
    let a = Cell::new(MemoValue::Int(1));
    let b = Cell::new(MemoValue::Int(2));
    let (a2, b2) = (a.clone(), b.clone());
    let g = define_fn("tests::sum_ab", move |ctx, _| {
        let x = a2.get(ctx).as_int().unwrap();
        let y = b2.get(ctx).as_int().unwrap();
        MemoValue::Int(x + y)
    });

    assert_eq!(eval(g, 0), MemoValue::Int(3));

    // Pin the pre-commit txn so cleanup cannot trim the old revision
    // before we look at it.
    let rt = Runtime::global();
    let guard = rt.begin_task(rt.newest_visible_txn());
    let t1 = a.set(MemoValue::Int(10)).expect("commit");
    assert_eq!(eval(g, 0), MemoValue::Int(12));

    let spans = call(g, 0).revision_spans();
    assert!(spans.iter().any(|s| s.end == t1), "spans: {:?}", spans);
    drop(guard);
}

#[test]
fn no_op_transaction_produces_no_txn() {
    let c = Cell::new(MemoValue::Int(3));
    // Re-assigning the current value coalesces away: no TxnId is
    // consumed.
    assert_eq!(c.set(MemoValue::Int(3)), None);
    assert!(c.set(MemoValue::Int(4)).is_some());
    assert_eq!(c.set(MemoValue::Int(4)), None);
}

#[test]
fn with_transaction_batches_writes_atomically() {
    let a = Cell::new(MemoValue::Int(0));
    let b = Cell::new(MemoValue::Int(0));
    let (a2, b2) = (a.clone(), b.clone());
    let diff = define_fn("tests::diff_ab", move |ctx, _| {
        let x = a2.get(ctx).as_int().unwrap();
        let y = b2.get(ctx).as_int().unwrap();
        MemoValue::Int(x - y)
    });

    assert_eq!(eval(diff, 0), MemoValue::Int(0));

    let ((), txn) = with_transaction(|| {
        let _ = a.set(MemoValue::Int(7));
        let _ = b.set(MemoValue::Int(7));
    });
    assert!(txn.is_some());

    // Both writes landed in one txn: the difference never shows a
    // half-applied state.
    assert_eq!(eval(diff, 0), MemoValue::Int(0));
}

#[test]
fn refresh_extends_an_unchanged_value_without_rerunning() {
    let c = Cell::new(MemoValue::Int(1));
    let c2 = c.clone();
    let f_runs = Arc::new(AtomicUsize::new(0));
    let g_runs = Arc::new(AtomicUsize::new(0));

    let f_runs2 = f_runs.clone();
    let f = define_fn("tests::constant_of_cell", move |ctx, _| {
        f_runs2.fetch_add(1, Ordering::SeqCst);
        let _ = c2.get(ctx); // observed, but the result ignores it
        MemoValue::Int(7)
    });

    let g_runs2 = g_runs.clone();
    let g = define_fn("tests::succ_of_f", move |ctx, _| {
        g_runs2.fetch_add(1, Ordering::SeqCst);
        let inv = call(f, 0);
        let v = ctx.evaluate(&inv).as_int().unwrap();
        MemoValue::Int(v + 1)
    });

    assert_eq!(eval(g, 0), MemoValue::Int(8));
    assert_eq!(f_runs.load(Ordering::SeqCst), 1);
    assert_eq!(g_runs.load(Ordering::SeqCst), 1);

    c.set(MemoValue::Int(2)).expect("commit");

    // f must recompute (its input changed) but produces an equal
    // value, so its old revision is extended in place and g's
    // refresher succeeds without re-running g.
    assert_eq!(eval(g, 0), MemoValue::Int(8));
    assert_eq!(f_runs.load(Ordering::SeqCst), 2);
    assert_eq!(g_runs.load(Ordering::SeqCst), 1, "g must refresh, not rerun");
}

#[test]
fn point_in_time_reads_see_their_txn() {
    fn bool_val(b: bool) -> MemoValue {
        MemoValue::Int(b as i64)
    }

    let x = Cell::new(bool_val(true));
    let x_for_a = x.clone();
    let x_for_b = x.clone();

    // a() and b() guard their mutual calls on the cell, so no single
    // txn ever sees an actual cycle.
    let a = define_fn("tests::mutual_a", move |ctx, _| {
        if x_for_a.get(ctx).as_int().unwrap() != 0 {
            let b = call_by_name_b();
            ctx.evaluate(&b)
        } else {
            MemoValue::Int(1)
        }
    });
    let b = define_fn("tests::mutual_b", move |ctx, _| {
        if x_for_b.get(ctx).as_int().unwrap() != 0 {
            MemoValue::Int(2)
        } else {
            let a = call_by_name_a();
            ctx.evaluate(&a)
        }
    });

    // The closures need the other function's invocation; route through
    // statics set once.
    static A_TY: std::sync::OnceLock<&'static skip_runtime::type_desc::Type> =
        std::sync::OnceLock::new();
    static B_TY: std::sync::OnceLock<&'static skip_runtime::type_desc::Type> =
        std::sync::OnceLock::new();
    fn call_by_name_a() -> Arc<skip_runtime::Invocation> {
        call(*A_TY.get().unwrap(), 0)
    }
    fn call_by_name_b() -> Arc<skip_runtime::Invocation> {
        call(*B_TY.get().unwrap(), 0)
    }
    A_TY.set(a).unwrap();
    B_TY.set(b).unwrap();

    let rt = Runtime::global();
    let t_true = rt.newest_visible_txn();
    // Hold t_true visible across the commit so an old-txn reader stays
    // legal.
    let guard = rt.begin_task(t_true);
    let t_false = x.set(bool_val(false)).expect("commit");

    let inv_a = call(a, 0);
    let inv_b = call(b, 0);
    let ta = std::thread::spawn(move || evaluate_sync_at(&inv_a, t_true).unwrap());
    let tb = std::thread::spawn(move || evaluate_sync_at(&inv_b, t_false).unwrap());

    // a at t_true: X is true, calls b, which returns 2.
    assert_eq!(ta.join().unwrap(), MemoValue::Int(2));
    // b at t_false: X is false, calls a, which returns 1.
    assert_eq!(tb.join().unwrap(), MemoValue::Int(1));
    drop(guard);
}

#[test]
fn revision_lists_stay_sorted_and_disjoint() {
    let c = Cell::new(MemoValue::Int(0));
    let c2 = c.clone();
    let f = define_fn("tests::tracks_cell", move |ctx, _| {
        MemoValue::Int(c2.get(ctx).as_int().unwrap() * 3)
    });

    for i in 1..6 {
        assert_eq!(eval(f, 0), MemoValue::Int((i - 1) * 3));
        c.set(MemoValue::Int(i)).expect("commit");
    }

    let spans = call(f, 0).revision_spans();
    for w in spans.windows(2) {
        assert!(w[0].end > w[1].end, "not sorted: {:?}", spans);
        assert!(w[0].begin >= w[1].end, "overlap: {:?}", spans);
    }
}

#[test]
fn exceptions_are_memoized_like_values() {
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    let f = define_fn("tests::throws", move |_ctx, _| {
        runs2.fetch_add(1, Ordering::SeqCst);
        MemoValue::Exception(skip_runtime::intern_string("boom"))
    });

    let inv = call(f, 0);
    let first = skip_runtime::evaluate_sync(&inv);
    let second = skip_runtime::evaluate_sync(&inv);
    assert!(first.is_err() && second.is_err());
    assert_eq!(first.unwrap_err(), second.unwrap_err());
    assert_eq!(runs.load(Ordering::SeqCst), 1, "exception must be cached");
}

#[test]
fn invalidation_watcher_fires_once_after_commit() {
    let c = Cell::new(MemoValue::Int(0));
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();

    let txn = Runtime::global().newest_visible_txn();
    c.subscribe_invalidation(
        txn,
        Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        }),
    )
    .expect("head covers the current txn");

    assert!(!fired.load(Ordering::SeqCst));
    c.set(MemoValue::Int(1)).expect("commit");
    assert!(fired.load(Ordering::SeqCst), "watcher must fire on commit");
}
