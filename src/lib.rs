#![warn(rust_2018_idioms)]

//! The Skip runtime core: a refcounted, cycle-aware, transactionally
//! versioned cache of function results.
//!
//! Evaluating a memoized call walks the invocation's revision history
//! for a value whose lifespan covers the caller's txn; misses install a
//! placeholder, run the user thunk, observe its dependencies, and
//! insert a revision spanning the intersection of the inputs'
//! lifespans. Committing a [`memo::Transaction`] truncates affected
//! revisions at one fresh TxnId and lazily invalidates dependents,
//! which later either *refresh* (extend a stale value's lifespan by
//! revalidating inputs) or recompute.
//!
//! The layers underneath: a chunk [`arena`] with O(1) pointer
//! classification, the per-task [`obstack`] bump allocator with a
//! young-generation moving collector, and the content-addressed
//! [`intern`] heap whose cyclic subgraphs collapse under canonical
//! cycle handles. [`awaitable`]s wire in-flight computations into the
//! async model, [`tabulate`] fans indexed work over a thread pool, and
//! [`serialize`] persists the whole dependency graph for warm restarts.

pub mod arena;
pub mod awaitable;
pub mod builtins;
pub mod error;
pub mod intern;
pub mod memo;
pub mod obstack;
pub mod process;
pub mod serialize;
pub mod tabulate;
pub mod txn;
pub mod type_desc;
pub mod value;

pub use crate::error::{DomainError, Result, RuntimeError};
pub use crate::intern::{intern_string, string_value, IObjRef};
pub use crate::memo::{
    evaluate_sync, evaluate_sync_at, memoize_call, next_reactive_global_cache_id,
    reactive_global_cache_cell, reactive_global_cache_get, reactive_global_cache_set,
    with_transaction, Caller, Cell, Context, Invocation, Runtime, Transaction,
};
pub use crate::obstack::Obstack;
pub use crate::tabulate::parallel_tabulate;
pub use crate::txn::{Lifespan, TxnId};
pub use crate::value::MemoValue;

/// Raise an explicit program exit; the top-level harness catches this
/// and returns the status.
pub fn exit(status: i32) -> RuntimeError {
    RuntimeError::Exit { status }
}

/// Top-level harness helper: report an uncaught Skip exception to
/// stderr and pick the process exit code.
pub fn report_uncaught(exn: &MemoValue) -> i32 {
    match exn {
        MemoValue::Exception(payload) => {
            eprintln!("uncaught exception: {}", crate::intern::string_value(payload));
        }
        other => {
            eprintln!("uncaught exception: {:?}", other);
        }
    }
    70
}
