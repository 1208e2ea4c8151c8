//! Built-in runtime types, registered ahead of user types in a fixed
//! order so their ids are stable across builds with the same registry.

use std::sync::atomic::AtomicU32;

use crate::type_desc::{register_type, Type, TypeKind, TYPE_ID_UNREGISTERED};

/// UTF-8 string payloads; `array_size` is the byte length.
pub static STRING_TYPE: Type = Type {
    name: "builtin::String",
    kind: TypeKind::String,
    user_byte_size: 1,
    gc_mask: &[],
    freeze_mask: &[],
    on_state_change: None,
    evaluate: None,
    registered_id: AtomicU32::new(TYPE_ID_UNREGISTERED),
};

/// Canonical representative of an interned cyclic subgraph. One ref
/// slot per member; slot 0 is the canonical root.
pub static CYCLE_HANDLE_TYPE: Type = Type {
    name: "builtin::CycleHandle",
    kind: TypeKind::CycleHandle,
    user_byte_size: 8,
    gc_mask: &[1],
    freeze_mask: &[1],
    on_state_change: None,
    evaluate: None,
    registered_id: AtomicU32::new(TYPE_ID_UNREGISTERED),
};

/// Compiled-regex primitive, opaque to the runtime: slot 0 references
/// the interned pattern string, the second word is the flags.
pub static REGEX_TYPE: Type = Type {
    name: "builtin::Regex",
    kind: TypeKind::RefClass,
    user_byte_size: 16,
    gc_mask: &[0b01],
    freeze_mask: &[0b01],
    on_state_change: None,
    evaluate: None,
    registered_id: AtomicU32::new(TYPE_ID_UNREGISTERED),
};

/// Key object for a mutable cell: no function, just a unique 64-bit id
/// (plus an optional interned key object for reactive-cache cells).
pub static CELL_KEY_TYPE: Type = Type {
    name: "builtin::CellKey",
    kind: TypeKind::Invocation,
    user_byte_size: 16,
    gc_mask: &[0b10],
    freeze_mask: &[0b10],
    on_state_change: None,
    evaluate: None,
    registered_id: AtomicU32::new(TYPE_ID_UNREGISTERED),
};

pub fn register_builtin_types() {
    register_type(&STRING_TYPE);
    register_type(&CYCLE_HANDLE_TYPE);
    register_type(&REGEX_TYPE);
    register_type(&CELL_KEY_TYPE);
}
