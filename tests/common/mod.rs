//! Helpers for building memoized functions out of test closures: an
//! invocation type whose key packs one i64 argument and whose thunk
//! delegates to the closure.

use std::convert::TryInto;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use skip_runtime::type_desc::{register_type, EvalHook, Type, TypeKind, TYPE_ID_UNREGISTERED};
use skip_runtime::{Context, Invocation, MemoValue, Obstack};

pub fn define_fn(
    name: &'static str,
    f: impl Fn(&Arc<Context>, i64) -> MemoValue + Send + Sync + 'static,
) -> &'static Type {
    let hook: EvalHook = Box::leak(Box::new(move |ctx: &Arc<Context>| {
        let key = ctx.invocation().key();
        let arg = i64::from_le_bytes(key.user_bytes()[0..8].try_into().unwrap());
        let value = f(ctx, arg);
        ctx.evaluate_done(value);
    }));
    let ty: &'static Type = Box::leak(Box::new(Type {
        name,
        kind: TypeKind::Invocation,
        user_byte_size: 8,
        gc_mask: &[],
        freeze_mask: &[],
        on_state_change: None,
        evaluate: Some(hook),
        registered_id: AtomicU32::new(TYPE_ID_UNREGISTERED),
    }));
    register_type(ty);
    ty
}

/// The canonical invocation for `ty(arg)`.
pub fn call(ty: &'static Type, arg: i64) -> Arc<Invocation> {
    let mut ob = Obstack::new();
    let addr = ob.alloc_object(ty, 0);
    unsafe { *(addr as *mut i64) = arg };
    let key = ob.intern(addr);
    Invocation::intern(key)
}

pub fn eval(ty: &'static Type, arg: i64) -> MemoValue {
    skip_runtime::evaluate_sync(&call(ty, arg)).expect("evaluation threw")
}
