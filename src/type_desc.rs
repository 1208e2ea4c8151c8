//! Class descriptors ("vtables").
//!
//! Every runtime object carries a reference to a `Type` describing its
//! layout: user byte size, element arity for arrays, and one ref-slot
//! bitmask per stripe so the collector and the freezer can walk
//! references without any per-object bookkeeping. Types register in a
//! process-global registry in deterministic order; the registry index is
//! the type's stable identity in the memo-cache serializer and is
//! covered by the build hash.

use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::memo::Context;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum TypeKind {
    /// A plain reference class: fixed user byte size.
    RefClass,
    /// An array: `user_byte_size` is the per-element size, replicated
    /// `array_size` times; the ref masks describe one element.
    Array,
    /// A UTF-8 string; `array_size` is the byte length.
    String,
    /// A memoization key: `(function, arguments)` packed as user bytes.
    Invocation,
    /// The canonical representative of an interned cyclic subgraph.
    CycleHandle,
}

/// Which ref-mask stripe a traversal follows.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Stripe {
    Gc,
    Freeze,
}

/// Lifecycle transitions reported to a type's state-change hook.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StateChange {
    /// The object was just frozen in place.
    Frozen,
    /// The object's storage is about to be released.
    Finalized,
}

/// The thunk attached to an invocation type. Runs with the evaluation
/// context installed; must eventually call `Context::evaluate_done`.
pub type EvalHook = &'static (dyn Fn(&std::sync::Arc<Context>) + Send + Sync);

pub struct Type {
    pub name: &'static str,
    pub kind: TypeKind,
    /// Byte size of the user data (per element for arrays/strings).
    pub user_byte_size: usize,
    /// One bit per pointer-sized slot of user data, set when the slot
    /// holds a reference the collector must trace.
    pub gc_mask: &'static [u64],
    /// Same shape as `gc_mask`, for the freeze traversal. Usually equal
    /// to `gc_mask`, but a type may hide references from freezing.
    pub freeze_mask: &'static [u64],
    /// Invoked at freeze and finalize transitions.
    pub on_state_change: Option<fn(user_bytes: *mut u8, change: StateChange)>,
    /// For `TypeKind::Invocation`: the user thunk.
    pub evaluate: Option<EvalHook>,
    /// Registry slot, assigned on first registration; `u32::MAX` until
    /// then. Do not touch directly.
    pub registered_id: AtomicU32,
}

pub const TYPE_ID_UNREGISTERED: u32 = u32::MAX;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TypeId(pub u32);

impl Type {
    /// Slot count of one element's user data.
    pub fn slot_count(&self) -> usize {
        (self.user_byte_size + 7) / 8
    }

    /// Total user byte size for an instance with the given arity.
    /// Cycle handles size like arrays: one ref slot per cycle member.
    pub fn total_user_bytes(&self, array_size: u32) -> usize {
        match self.kind {
            TypeKind::Array | TypeKind::String | TypeKind::CycleHandle => {
                self.user_byte_size * array_size as usize
            }
            _ => self.user_byte_size,
        }
    }

    pub fn is_ref_slot(&self, slot: usize, stripe: Stripe) -> bool {
        let mask = match stripe {
            Stripe::Gc => self.gc_mask,
            Stripe::Freeze => self.freeze_mask,
        };
        let word = slot / 64;
        word < mask.len() && mask[word] & (1u64 << (slot % 64)) != 0
    }

    pub fn id(&self) -> TypeId {
        let id = self.registered_id.load(Ordering::Acquire);
        assert_ne!(id, TYPE_ID_UNREGISTERED, "type {} never registered", self.name);
        TypeId(id)
    }
}

impl std::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Type({})", self.name)
    }
}

static REGISTRY: Mutex<Vec<&'static Type>> = parking_lot::const_mutex(Vec::new());

/// Register a type, returning its stable id. Registering the same type
/// twice is idempotent. Registration order is part of program identity:
/// the build hash covers it, so a program whose registrations differ
/// refuses old memo caches.
pub fn register_type(ty: &'static Type) -> TypeId {
    let mut reg = REGISTRY.lock();
    let current = ty.registered_id.load(Ordering::Acquire);
    if current != TYPE_ID_UNREGISTERED {
        return TypeId(current);
    }
    let id = reg.len() as u32;
    assert!(id != TYPE_ID_UNREGISTERED);
    reg.push(ty);
    ty.registered_id.store(id, Ordering::Release);
    TypeId(id)
}

pub fn type_by_id(id: TypeId) -> Option<&'static Type> {
    REGISTRY.lock().get(id.0 as usize).copied()
}

/// Hash of the registered type universe: names, kinds, sizes, masks.
/// Two builds agree on memo-cache layout iff their build hashes agree.
pub fn build_hash() -> u64 {
    let reg = REGISTRY.lock();
    let mut h = FxHasher::default();
    reg.len().hash(&mut h);
    for ty in reg.iter() {
        ty.name.hash(&mut h);
        ty.kind.hash(&mut h);
        ty.user_byte_size.hash(&mut h);
        ty.gc_mask.hash(&mut h);
        ty.freeze_mask.hash(&mut h);
    }
    h.finish()
}

/// Walk the reference slots of one object's user bytes, calling `f`
/// with a pointer to each slot. Slots hold raw referent addresses (the
/// referent's own user-bytes address) or zero for null.
///
/// # Safety
///
/// `user_bytes` must point at `ty.total_user_bytes(array_size)` valid
/// bytes laid out for `ty`.
pub unsafe fn for_each_ref_slot(
    ty: &Type,
    user_bytes: *mut u8,
    array_size: u32,
    stripe: Stripe,
    f: &mut dyn FnMut(*mut usize),
) {
    let elems = match ty.kind {
        TypeKind::Array | TypeKind::CycleHandle => array_size as usize,
        TypeKind::String => return,
        _ => 1,
    };
    let slots = ty.slot_count();
    for e in 0..elems {
        let elem_base = user_bytes.add(e * ty.user_byte_size);
        for s in 0..slots {
            if ty.is_ref_slot(s, stripe) {
                f(elem_base.add(s * 8) as *mut usize);
            }
        }
    }
}

/// Convenience constructor for mask-less (leaf) types in tests and
/// built-ins.
pub const fn leaf_type(name: &'static str, kind: TypeKind, user_byte_size: usize) -> Type {
    Type {
        name,
        kind,
        user_byte_size,
        gc_mask: &[],
        freeze_mask: &[],
        on_state_change: None,
        evaluate: None,
        registered_id: AtomicU32::new(TYPE_ID_UNREGISTERED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static POINT: Type = Type {
        name: "Point",
        kind: TypeKind::RefClass,
        user_byte_size: 24,
        gc_mask: &[0b100],
        freeze_mask: &[0b100],
        on_state_change: None,
        evaluate: None,
        registered_id: AtomicU32::new(TYPE_ID_UNREGISTERED),
    };

    #[test]
    fn ref_slots_follow_the_mask() {
        assert!(!POINT.is_ref_slot(0, Stripe::Gc));
        assert!(!POINT.is_ref_slot(1, Stripe::Gc));
        assert!(POINT.is_ref_slot(2, Stripe::Gc));
        assert!(!POINT.is_ref_slot(3, Stripe::Gc));
    }

    #[test]
    fn registration_is_idempotent() {
        let a = register_type(&POINT);
        let b = register_type(&POINT);
        assert_eq!(a, b);
        assert_eq!(type_by_id(a).unwrap().name, "Point");
    }
}
