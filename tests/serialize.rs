//! Memo-cache persistence: round-trip stability and warm-restart
//! behavior. Everything lives in one test body because serialization
//! snapshots the whole process-global graph.

mod common;

use common::{call, define_fn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use skip_runtime::serialize::{deserialize_memo_cache, serialize_memo_cache};
use skip_runtime::{
    evaluate_sync, next_reactive_global_cache_id, reactive_global_cache_cell, MemoValue, Runtime,
    RuntimeError,
};

#[test]
fn cache_round_trip_restores_the_graph() {
    let id = next_reactive_global_cache_id();
    let cell = reactive_global_cache_cell(id, "input");
    let _ = cell.set(MemoValue::Int(5));

    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    let f = define_fn("serialize::times_ten", move |ctx, _| {
        runs2.fetch_add(1, Ordering::SeqCst);
        let cell = reactive_global_cache_cell(id, "input");
        MemoValue::Int(cell.get(ctx).as_int().unwrap() * 10)
    });

    let inv = call(f, 1);
    assert_eq!(evaluate_sync(&inv).unwrap(), MemoValue::Int(50));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Snapshot, blow the graph away, restore.
    let bytes = serialize_memo_cache();
    Runtime::global().purge();
    let restored = deserialize_memo_cache(&bytes).expect("cache accepted");
    assert!(restored >= 2, "cell and dependent should both restore");

    // Scenario: the restored trace suffices; no recomputation happens.
    let inv = call(f, 1);
    assert_eq!(evaluate_sync(&inv).unwrap(), MemoValue::Int(50));
    assert_eq!(
        runs.load(Ordering::SeqCst),
        1,
        "restored invocation must not re-execute"
    );

    // Round-trip stability: serialize(deserialize(serialize(x))) is
    // byte-identical.
    let bytes2 = serialize_memo_cache();
    assert_eq!(bytes, bytes2, "canonical emission order must be stable");

    // A write after restore still invalidates the restored dependent.
    let cell = reactive_global_cache_cell(id, "input");
    cell.set(MemoValue::Int(6));
    let inv = call(f, 1);
    assert_eq!(evaluate_sync(&inv).unwrap(), MemoValue::Int(60));
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Corrupt identity: a flipped build hash must be refused.
    let mut bad = bytes.clone();
    bad[8] ^= 0xff;
    match deserialize_memo_cache(&bad) {
        Err(RuntimeError::CacheFormat(_)) => {}
        other => panic!("expected CacheFormat refusal, got ok={}", other.is_ok()),
    }

    // Truncated input must be refused, not crash.
    match deserialize_memo_cache(&bytes[..bytes.len() / 2]) {
        Err(RuntimeError::CacheFormat(_)) => {}
        other => panic!("expected CacheFormat refusal, got ok={}", other.is_ok()),
    }
}
