//! Per-task bump allocator with scoped positions and a young-generation
//! moving collector.
//!
//! An obstack belongs to exactly one task at a time; none of its methods
//! are thread-safe and callers are expected to own it. Time is measured
//! in [`Pos`] values: a generation counter (one per chunk) combined with
//! the offset inside the chunk, which totally orders every allocation
//! the obstack ever made. `note()` records the current frontier;
//! `collect*` rolls the frontier back to a note, either dropping the
//! young region outright or compacting its live part forward.
//!
//! Root completeness contract: a rooted collection moves everything in
//! `[note, frontier)`, so the caller's root set (plus registered
//! handles) must cover every path from outside that range into it.
//! Objects below the note are never moved.

use log::debug;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::arena::{self, MemoryKind, ALLOC_ALIGN, CHUNK_SIZE};
use crate::intern::IObjRef;
use crate::type_desc::{for_each_ref_slot, StateChange, Stripe, Type};

/// Bits of a [`Pos`] devoted to the in-chunk offset (in 16-byte units).
const POS_OFFSET_BITS: u32 = 20;
const POS_OFFSET_UNIT_LOG2: u32 = 4;

/// A point in obstack time: 44-bit chunk generation, 20-bit offset.
/// Totally ordered; later allocations always compare greater.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Pos(u64);

impl Pos {
    fn new(generation: u64, byte_offset: usize) -> Pos {
        // A full chunk legitimately notes at offset == CHUNK_SIZE.
        debug_assert!(byte_offset <= CHUNK_SIZE);
        Pos((generation << POS_OFFSET_BITS) | (byte_offset as u64 >> POS_OFFSET_UNIT_LOG2))
    }

    fn generation(self) -> u64 {
        self.0 >> POS_OFFSET_BITS
    }

    fn byte_offset(self) -> usize {
        ((self.0 & ((1 << POS_OFFSET_BITS) - 1)) << POS_OFFSET_UNIT_LOG2) as usize
    }
}

/// Metadata preceding every obstack object's user bytes.
#[repr(C)]
pub struct ObjHeader {
    pub array_size: u32,
    _pad: u32,
    /// `&'static Type` with [`FROZEN_FLAG`] in the low bit.
    pub ty_and_flags: AtomicUsize,
}

pub const FROZEN_FLAG: usize = 1;
const TY_MASK: usize = !FROZEN_FLAG;

pub const OBJ_HEADER_SIZE: usize = std::mem::size_of::<ObjHeader>();

/// The address of an object's user bytes. Never chunk-aligned (a header
/// always precedes it), which is what makes kind classification of
/// interior addresses unambiguous.
pub type ObjAddr = usize;

#[inline]
pub unsafe fn obj_header<'a>(addr: ObjAddr) -> &'a ObjHeader {
    &*((addr - OBJ_HEADER_SIZE) as *const ObjHeader)
}

pub unsafe fn obj_type(addr: ObjAddr) -> &'static Type {
    let bits = obj_header(addr).ty_and_flags.load(Ordering::Acquire);
    &*((bits & TY_MASK) as *const Type)
}

pub unsafe fn obj_array_size(addr: ObjAddr) -> u32 {
    obj_header(addr).array_size
}

pub unsafe fn obj_is_frozen(addr: ObjAddr) -> bool {
    obj_header(addr).ty_and_flags.load(Ordering::Acquire) & FROZEN_FLAG != 0
}

/// Set the frozen bit atomically in place. Returns false if it was
/// already set.
pub unsafe fn obj_mark_frozen(addr: ObjAddr) -> bool {
    let h = obj_header(addr);
    let old = h.ty_and_flags.fetch_or(FROZEN_FLAG, Ordering::AcqRel);
    old & FROZEN_FLAG == 0
}

/// Header at the base of every obstack chunk.
#[repr(C)]
struct ChunkHeader {
    generation: u64,
    /// Base of the previous (older) chunk, or null.
    prev: *mut u8,
}

// Bump space starts here; oversized so the first object header (and
// therefore every user-bytes address) stays clear of the chunk base.
const CHUNK_HEADER_SIZE: usize = 32;

struct LargeObj {
    pos: Pos,
    /// Arena block base (header starts here).
    base: usize,
    block_size: usize,
    addr: ObjAddr,
}

struct HandleTable {
    slots: Vec<Option<ObjAddr>>,
    free: Vec<usize>,
}

/// A cross-task root. Keeps the target alive and movable across
/// collections of the owning obstack; `get()` returns the target's
/// current address.
pub struct RObjHandle {
    table: Arc<Mutex<HandleTable>>,
    slot: usize,
}

impl RObjHandle {
    pub fn get(&self) -> ObjAddr {
        self.table.lock().slots[self.slot].expect("handle slot cleared")
    }
}

impl Drop for RObjHandle {
    fn drop(&mut self) {
        let mut t = self.table.lock();
        t.slots[self.slot] = None;
        t.free.push(self.slot);
    }
}

pub struct Obstack {
    /// Base of the current chunk; null until the first allocation.
    chunk: *mut u8,
    next_alloc: usize,
    chunk_end: usize,
    next_generation: u64,
    /// Large allocations, ascending by position.
    large: Vec<LargeObj>,
    /// Interned references owned by positions in this obstack,
    /// ascending by position. Rolling back past an entry drops it
    /// (which decrefs).
    iobjs: Vec<(Pos, IObjRef)>,
    handles: Arc<Mutex<HandleTable>>,
}

// An obstack is owned by one task at a time; the owner may migrate
// between threads with its process.
unsafe impl Send for Obstack {}

impl Default for Obstack {
    fn default() -> Self {
        Obstack::new()
    }
}

impl Obstack {
    pub fn new() -> Obstack {
        Obstack {
            chunk: std::ptr::null_mut(),
            next_alloc: 0,
            chunk_end: 0,
            next_generation: 1,
            large: Vec::new(),
            iobjs: Vec::new(),
            handles: Arc::new(Mutex::new(HandleTable {
                slots: Vec::new(),
                free: Vec::new(),
            })),
        }
    }

    fn current_generation(&self) -> u64 {
        if self.chunk.is_null() {
            0
        } else {
            unsafe { (*(self.chunk as *const ChunkHeader)).generation }
        }
    }

    /// Record the current frontier.
    pub fn note(&self) -> Pos {
        if self.chunk.is_null() {
            Pos::new(0, 0)
        } else {
            Pos::new(self.current_generation(), self.next_alloc - self.chunk as usize)
        }
    }

    fn push_chunk(&mut self) {
        let base = arena::alloc_aligned(CHUNK_SIZE, ALLOC_ALIGN, MemoryKind::Obstack);
        unsafe {
            (*(base as *mut ChunkHeader)).generation = self.next_generation;
            (*(base as *mut ChunkHeader)).prev = self.chunk;
        }
        self.next_generation += 1;
        self.chunk = base;
        self.next_alloc = base as usize + CHUNK_HEADER_SIZE;
        self.chunk_end = base as usize + CHUNK_SIZE;
    }

    /// Bump-allocate `size` bytes, always [`ALLOC_ALIGN`]-aligned.
    /// Allocations that cannot fit a chunk go to the large-object path.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let size = arena::round_up(size.max(1), ALLOC_ALIGN);
        if size > CHUNK_SIZE - CHUNK_HEADER_SIZE {
            return self.alloc_large(size);
        }
        if self.chunk.is_null() || self.next_alloc + size > self.chunk_end {
            self.push_chunk();
        }
        let p = self.next_alloc;
        self.next_alloc += size;
        p as *mut u8
    }

    /// Allocate an object of `ty` with zeroed user bytes, returning the
    /// address of the user bytes.
    pub fn alloc_object(&mut self, ty: &'static Type, array_size: u32) -> ObjAddr {
        let user = ty.total_user_bytes(array_size);
        let p = self.alloc(OBJ_HEADER_SIZE + user) as usize;
        unsafe { write_obj_header(p, ty, array_size, user) }
    }

    /// Allocate in storage that a collection will never move.
    pub fn alloc_pinned(&mut self, ty: &'static Type, array_size: u32) -> ObjAddr {
        let user = ty.total_user_bytes(array_size);
        self.alloc_large_object(ty, array_size, user)
    }

    /// Direct large-object allocation (raw bytes).
    fn alloc_large(&mut self, size: usize) -> *mut u8 {
        let base = arena::alloc_aligned(size, ALLOC_ALIGN, MemoryKind::Large);
        self.large.push(LargeObj {
            pos: self.note(),
            base: base as usize,
            block_size: size,
            addr: 0,
        });
        base
    }

    /// Large-object allocation with an object header.
    pub fn alloc_large_object(
        &mut self,
        ty: &'static Type,
        array_size: u32,
        user: usize,
    ) -> ObjAddr {
        let block = OBJ_HEADER_SIZE + user;
        let base = arena::alloc_aligned(block, ALLOC_ALIGN, MemoryKind::Large) as usize;
        let addr = unsafe { write_obj_header(base, ty, array_size, user) };
        self.large.push(LargeObj {
            pos: self.note(),
            base,
            block_size: block,
            addr,
        });
        addr
    }

    /// Attach an already-interned reference to the current position so
    /// its refcount is released when the obstack rolls back past here.
    pub fn register_iobj(&mut self, iobj: IObjRef) {
        self.iobjs.push((self.note(), iobj));
    }

    /// Produce a cross-task root for `addr`.
    pub fn make_handle(&mut self, addr: ObjAddr) -> RObjHandle {
        let mut t = self.handles.lock();
        let slot = match t.free.pop() {
            Some(i) => {
                t.slots[i] = Some(addr);
                i
            }
            None => {
                t.slots.push(Some(addr));
                t.slots.len() - 1
            }
        };
        RObjHandle {
            table: self.handles.clone(),
            slot,
        }
    }

    fn pos_of(&self, addr: usize) -> Pos {
        let base = addr & !(CHUNK_SIZE - 1);
        let generation = unsafe { (*(base as *const ChunkHeader)).generation };
        Pos::new(generation, addr - base)
    }

    /// True if `addr` is obstack memory allocated at or after `note`
    /// by *this* obstack's generation counter.
    fn is_young(&self, addr: usize, note: Pos) -> bool {
        arena::raw_memory_kind(addr) == MemoryKind::Obstack && self.pos_of(addr) >= note
    }

    /// No-root collection: drop everything newer than `note` -- chunks,
    /// large objects, and interned-reference registrations.
    pub fn collect(&mut self, note: Pos) {
        debug!("obstack collect to {:?}", note);
        self.truncate_large(note, None);
        self.truncate_iobjs(note);
        debug_assert!(
            self.handles
                .lock()
                .slots
                .iter()
                .flatten()
                .all(|&a| !self.is_young(a, note)),
            "live handle points into collected region"
        );
        self.truncate_chunks(note);
    }

    fn truncate_chunks(&mut self, note: Pos) {
        while !self.chunk.is_null() && self.current_generation() > note.generation() {
            let base = self.chunk;
            self.chunk = unsafe { (*(base as *const ChunkHeader)).prev };
            arena::free(base, CHUNK_SIZE, ALLOC_ALIGN, MemoryKind::Obstack);
        }
        if self.chunk.is_null() {
            self.next_alloc = 0;
            self.chunk_end = 0;
        } else {
            debug_assert_eq!(self.current_generation(), note.generation());
            self.next_alloc = self.chunk as usize + note.byte_offset().max(CHUNK_HEADER_SIZE);
            self.chunk_end = self.chunk as usize + CHUNK_SIZE;
        }
    }

    fn truncate_large(&mut self, note: Pos, keep: Option<&FxHashSet<usize>>) {
        // Sorted by position, so this is a suffix truncation.
        let cut = self.large.partition_point(|l| l.pos < note);
        let dropped: Vec<LargeObj> = self.large.split_off(cut);
        for l in dropped {
            if keep.map_or(false, |k| k.contains(&l.base)) {
                self.large.push(l);
                continue;
            }
            if l.addr != 0 {
                unsafe { finalize_obj(l.addr) };
            }
            arena::free(l.base as *mut u8, l.block_size, ALLOC_ALIGN, MemoryKind::Large);
        }
    }

    fn truncate_iobjs(&mut self, note: Pos) {
        let cut = self.iobjs.partition_point(|(p, _)| *p < note);
        // Dropping the refs decrefs the interned objects.
        self.iobjs.truncate(cut);
    }

    /// Rooted collection: compact the live part of `[note, frontier)`
    /// into fresh chunks, updating `roots` (and registered handles) in
    /// place. Everything in the young region not reached from the roots
    /// is dropped.
    pub fn collect_roots(&mut self, note: Pos, roots: &mut [&mut ObjAddr]) {
        debug!("obstack rooted collect to {:?} ({} roots)", note, roots.len());

        // Shadow obstack receives the survivors. It inherits our
        // generation counter so survivor positions stay newer than the
        // note.
        let mut shadow = Obstack::new();
        shadow.next_generation = self.next_generation;

        let mut forward: FxHashMap<ObjAddr, ObjAddr> = FxHashMap::default();
        let mut live_large: FxHashSet<usize> = FxHashSet::default();
        let mut scan_list: Vec<ObjAddr> = Vec::new();

        {
            let mut copy_one = |this: &Obstack,
                                shadow: &mut Obstack,
                                forward: &mut FxHashMap<ObjAddr, ObjAddr>,
                                live_large: &mut FxHashSet<usize>,
                                scan: &mut Vec<ObjAddr>,
                                addr: ObjAddr|
             -> ObjAddr {
                match arena::raw_memory_kind(addr) {
                    MemoryKind::Obstack if this.pos_of(addr) >= note => {
                        if let Some(&to) = forward.get(&addr) {
                            return to;
                        }
                        let (ty, array_size, user) = unsafe {
                            let ty = obj_type(addr);
                            let n = obj_array_size(addr);
                            (ty, n, ty.total_user_bytes(n))
                        };
                        let to = shadow.alloc_object(ty, array_size);
                        unsafe {
                            std::ptr::copy_nonoverlapping(addr as *const u8, to as *mut u8, user);
                            if obj_is_frozen(addr) {
                                obj_mark_frozen(to);
                            }
                        }
                        forward.insert(addr, to);
                        scan.push(to);
                        to
                    }
                    MemoryKind::Large => {
                        let block = this.large.iter().find(|l| l.addr == addr);
                        if let Some(l) = block {
                            if live_large.insert(l.base) {
                                scan.push(addr);
                            }
                        }
                        addr
                    }
                    // Interned objects and foreign memory never move.
                    _ => addr,
                }
            };

            for root in roots.iter_mut() {
                **root = copy_one(
                    self,
                    &mut shadow,
                    &mut forward,
                    &mut live_large,
                    &mut scan_list,
                    **root,
                );
            }
            {
                let mut handles = self.handles.lock();
                for slot in handles.slots.iter_mut().flatten() {
                    *slot = copy_one(
                        self,
                        &mut shadow,
                        &mut forward,
                        &mut live_large,
                        &mut scan_list,
                        *slot,
                    );
                }
            }

            while let Some(obj) = scan_list.pop() {
                let (ty, array_size) = unsafe { (obj_type(obj), obj_array_size(obj)) };
                unsafe {
                    for_each_ref_slot(ty, obj as *mut u8, array_size, Stripe::Gc, &mut |slot| {
                        let referent = *slot;
                        if referent != 0 {
                            *slot = copy_one(
                                self,
                                &mut shadow,
                                &mut forward,
                                &mut live_large,
                                &mut scan_list,
                                referent,
                            );
                        }
                    });
                }
            }
        }

        // Dead young large objects go; survivors keep their entries.
        self.truncate_large(note, Some(&live_large));
        // Interned registrations stay owned: they roll back with an
        // outer note, not with a compaction.

        // Drop the young chunks, then splice the shadow chunks in as
        // the new frontier.
        self.truncate_chunks(note);
        if !shadow.chunk.is_null() {
            // Oldest shadow chunk links to our current chunk.
            unsafe {
                let mut base = shadow.chunk;
                loop {
                    let prev = (*(base as *const ChunkHeader)).prev;
                    if prev.is_null() {
                        (*(base as *mut ChunkHeader)).prev = self.chunk;
                        break;
                    }
                    base = prev;
                }
            }
            self.chunk = shadow.chunk;
            self.next_alloc = shadow.next_alloc;
            self.chunk_end = shadow.chunk_end;
        }
        self.next_generation = shadow.next_generation;
        // Oversized survivors were copied through the shadow's large
        // path; adopt them too, then disarm the shadow's drop.
        self.large.append(&mut shadow.large);
        shadow.chunk = std::ptr::null_mut();
        debug!(
            "obstack rooted collect done: {} survivors",
            forward.len()
        );
    }

    /// Recursively mark every reachable mutable object frozen,
    /// preparing the subgraph for interning. Follows the freeze stripe.
    pub fn freeze(&mut self, addr: ObjAddr) {
        let mut work = vec![addr];
        while let Some(a) = work.pop() {
            if arena::get_memory_kind(a) == MemoryKind::IObj {
                continue; // already interned, already frozen
            }
            unsafe {
                if !obj_mark_frozen(a) {
                    continue;
                }
                let ty = obj_type(a);
                if let Some(hook) = ty.on_state_change {
                    hook(a as *mut u8, StateChange::Frozen);
                }
                for_each_ref_slot(ty, a as *mut u8, obj_array_size(a), Stripe::Freeze, &mut |slot| {
                    let r = *slot;
                    if r != 0 {
                        work.push(r);
                    }
                });
            }
        }
    }

    /// Content-address `addr` and everything it references, returning
    /// the canonical interned object. The returned reference is also
    /// registered at the current position, so it is released when this
    /// obstack rolls back past the call site.
    pub fn intern(&mut self, addr: ObjAddr) -> IObjRef {
        self.freeze(addr);
        let r = crate::intern::intern_subgraph(addr);
        self.register_iobj(r.clone());
        r
    }
}

impl Drop for Obstack {
    fn drop(&mut self) {
        self.collect(Pos::new(0, 0));
    }
}

unsafe fn write_obj_header(block: usize, ty: &'static Type, array_size: u32, user: usize) -> ObjAddr {
    let h = block as *mut ObjHeader;
    (*h).array_size = array_size;
    (*h)._pad = 0;
    (*h).ty_and_flags = AtomicUsize::new(ty as *const Type as usize);
    let addr = block + OBJ_HEADER_SIZE;
    std::ptr::write_bytes(addr as *mut u8, 0, user);
    addr
}

unsafe fn finalize_obj(addr: ObjAddr) {
    let ty = obj_type(addr);
    if let Some(hook) = ty.on_state_change {
        hook(addr as *mut u8, StateChange::Finalized);
    }
}

/// Read a reference slot of an object.
pub unsafe fn read_ref_slot(addr: ObjAddr, slot: usize) -> ObjAddr {
    *((addr + slot * 8) as *const usize)
}

/// Write a reference slot of an object.
pub unsafe fn write_ref_slot(addr: ObjAddr, slot: usize, value: ObjAddr) {
    *((addr + slot * 8) as *mut usize) = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_desc::{leaf_type, TypeKind};

    static PAIR: Type = Type {
        name: "obstack::tests::Pair",
        kind: TypeKind::RefClass,
        user_byte_size: 16,
        gc_mask: &[0b11],
        freeze_mask: &[0b11],
        on_state_change: None,
        evaluate: None,
        registered_id: std::sync::atomic::AtomicU32::new(crate::type_desc::TYPE_ID_UNREGISTERED),
    };

    static LEAF: Type = leaf_type("obstack::tests::Leaf", TypeKind::RefClass, 8);

    #[test]
    fn positions_are_totally_ordered() {
        let mut ob = Obstack::new();
        let a = ob.note();
        ob.alloc(64);
        let b = ob.note();
        ob.alloc(CHUNK_SIZE / 2);
        ob.alloc(CHUNK_SIZE / 2); // forces a second chunk
        let c = ob.note();
        assert!(a < b && b < c);
    }

    #[test]
    fn collect_rolls_back_to_note() {
        let mut ob = Obstack::new();
        ob.alloc(128);
        let note = ob.note();
        ob.alloc(CHUNK_SIZE / 2);
        ob.alloc(CHUNK_SIZE / 2);
        ob.collect(note);
        assert_eq!(ob.note(), note);
    }

    #[test]
    fn rooted_collect_preserves_reachable_objects() {
        let mut ob = Obstack::new();
        let note = ob.note();

        let leaf = ob.alloc_object(&LEAF, 0);
        unsafe { *(leaf as *mut u64) = 0xfeed };
        let pair = ob.alloc_object(&PAIR, 0);
        unsafe {
            write_ref_slot(pair, 0, leaf);
            write_ref_slot(pair, 1, 0);
        }
        // Garbage that should not survive.
        for _ in 0..100 {
            ob.alloc_object(&LEAF, 0);
        }

        let mut root = pair;
        ob.collect_roots(note, &mut [&mut root]);

        assert_ne!(root, pair, "young root must have moved");
        unsafe {
            let new_leaf = read_ref_slot(root, 0);
            assert_eq!(*(new_leaf as *const u64), 0xfeed);
            assert_eq!(read_ref_slot(root, 1), 0);
        }
    }

    #[test]
    fn rooted_collect_shares_copies() {
        let mut ob = Obstack::new();
        let note = ob.note();
        let leaf = ob.alloc_object(&LEAF, 0);
        let a = ob.alloc_object(&PAIR, 0);
        let b = ob.alloc_object(&PAIR, 0);
        unsafe {
            write_ref_slot(a, 0, leaf);
            write_ref_slot(b, 0, leaf);
        }
        let (mut ra, mut rb) = (a, b);
        ob.collect_roots(note, &mut [&mut ra, &mut rb]);
        unsafe {
            assert_eq!(read_ref_slot(ra, 0), read_ref_slot(rb, 0));
        }
    }

    #[test]
    fn handles_are_updated_by_collection() {
        let mut ob = Obstack::new();
        let note = ob.note();
        let leaf = ob.alloc_object(&LEAF, 0);
        unsafe { *(leaf as *mut u64) = 7 };
        let handle = ob.make_handle(leaf);
        ob.collect_roots(note, &mut []);
        let moved = handle.get();
        unsafe { assert_eq!(*(moved as *const u64), 7) };
    }

    #[test]
    fn freeze_marks_the_subgraph() {
        let mut ob = Obstack::new();
        let leaf = ob.alloc_object(&LEAF, 0);
        let pair = ob.alloc_object(&PAIR, 0);
        unsafe { write_ref_slot(pair, 0, leaf) };
        ob.freeze(pair);
        unsafe {
            assert!(obj_is_frozen(pair));
            assert!(obj_is_frozen(leaf));
        }
    }
}
