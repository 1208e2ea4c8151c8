//! Chunk-aligned memory supply and O(1) pointer classification.
//!
//! Every block handed out by the arena lives inside a 2 MiB-aligned
//! chunk, and the chunk's kind is recorded in a process-global table
//! keyed by the high bits of the address. That lets any pointer in the
//! system be classified as obstack / large / interned memory without
//! touching the pointee.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::alloc::{alloc, Layout};
use std::sync::atomic::{AtomicBool, Ordering};

/// log2 of the chunk size. Chunks are 2 MiB and 2 MiB-aligned.
pub const CHUNK_SIZE_LOG2: u32 = 21;
pub const CHUNK_SIZE: usize = 1 << CHUNK_SIZE_LOG2;

/// All arena allocations are at least this aligned.
pub const ALLOC_ALIGN: usize = 16;

/// Alignment requests beyond this fragment the underlying allocator and
/// are rejected outright.
pub const MAX_ALIGN: usize = 4096;

/// What a chunk of memory is used for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemoryKind {
    /// Not arena memory at all (Rust heap, stack, statics).
    Unknown,
    /// Obstack bump space; may be moved by a young collection.
    Obstack,
    /// A large object with its own chunk run; never moved.
    Large,
    /// Interned-object space; immortal until refcount zero.
    IObj,
}

fn chunk_index(p: usize) -> usize {
    p >> CHUNK_SIZE_LOG2
}

struct ArenaState {
    /// Chunk index -> kind, for every live chunk the arena handed out.
    kinds: FxHashMap<usize, MemoryKind>,
    /// Per-kind, per-size free block cache. Blocks repeat their sizes
    /// heavily (interned objects of the same class), so an exact-size
    /// cache captures nearly all reuse.
    free: FxHashMap<(u8, usize), Vec<usize>>,
}

static ARENA: Mutex<Option<ArenaState>> = parking_lot::const_mutex(None);
static OOM_NOTE: AtomicBool = AtomicBool::new(false);

fn with_state<R>(f: impl FnOnce(&mut ArenaState) -> R) -> R {
    let mut guard = ARENA.lock();
    let state = guard.get_or_insert_with(|| ArenaState {
        kinds: FxHashMap::default(),
        free: FxHashMap::default(),
    });
    f(state)
}

fn kind_tag(kind: MemoryKind) -> u8 {
    match kind {
        MemoryKind::Unknown => 0,
        MemoryKind::Obstack => 1,
        MemoryKind::Large => 2,
        MemoryKind::IObj => 3,
    }
}

/// Number of whole chunks needed to hold `size` bytes.
fn chunk_run_len(size: usize) -> usize {
    (size + CHUNK_SIZE - 1) / CHUNK_SIZE
}

/// Allocate `size` bytes with the given alignment, tagging the enclosing
/// chunk(s) with `kind`.
///
/// Blocks are carved from dedicated chunk runs: a block never shares a
/// chunk with a block of another kind, so `raw_memory_kind` can answer
/// from the chunk index alone. Alignment requests above [`MAX_ALIGN`]
/// are rejected. Allocation failure aborts the process (out-of-memory
/// is fatal by design contract).
pub fn alloc_aligned(size: usize, align: usize, kind: MemoryKind) -> *mut u8 {
    assert!(align <= MAX_ALIGN, "alignment {} too large", align);
    assert!(kind != MemoryKind::Unknown);
    let align = align.max(ALLOC_ALIGN);
    let size = round_up(size.max(1), align);

    if let Some(p) = with_state(|s| {
        s.free
            .get_mut(&(kind_tag(kind), size))
            .and_then(|v| v.pop())
    }) {
        return p as *mut u8;
    }

    // Fresh chunk run, 2 MiB-aligned so the kind table covers it.
    let run_bytes = chunk_run_len(size) * CHUNK_SIZE;
    let layout = match Layout::from_size_align(run_bytes, CHUNK_SIZE) {
        Ok(l) => l,
        Err(_) => oom(size),
    };
    let base = unsafe { alloc(layout) };
    if base.is_null() {
        oom(size);
    }
    with_state(|s| {
        for i in 0..chunk_run_len(size) {
            s.kinds
                .insert(chunk_index(base as usize) + i, kind);
        }
        // The tail of the run beyond `size` is sliced into same-size
        // blocks and cached, so small allocations amortize the chunk.
        if size <= CHUNK_SIZE / 2 {
            let cache = s.free.entry((kind_tag(kind), size)).or_default();
            let mut off = size;
            while off + size <= run_bytes {
                cache.push(base as usize + off);
                off += size;
            }
        }
    });
    base
}

/// Return a block to the per-kind cache. The block must have come from
/// [`alloc_aligned`] with the same `size` and `kind`.
pub fn free(p: *mut u8, size: usize, align: usize, kind: MemoryKind) {
    let align = align.max(ALLOC_ALIGN);
    let size = round_up(size.max(1), align);
    debug_assert_eq!(raw_memory_kind(p as usize), kind);
    with_state(|s| {
        s.free
            .entry((kind_tag(kind), size))
            .or_default()
            .push(p as usize)
    });
}

/// Classify an arbitrary address in O(1).
pub fn raw_memory_kind(p: usize) -> MemoryKind {
    with_state(|s| {
        s.kinds
            .get(&chunk_index(p))
            .copied()
            .unwrap_or(MemoryKind::Unknown)
    })
}

/// Classify an object by its interior address. Object addresses point
/// at user bytes, which always sit after a metadata header and so never
/// lie exactly on a chunk boundary; the enclosing chunk is therefore
/// unambiguous.
pub fn get_memory_kind(user_bytes_addr: usize) -> MemoryKind {
    debug_assert!(user_bytes_addr & (CHUNK_SIZE - 1) != 0);
    raw_memory_kind(user_bytes_addr)
}

pub fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

fn oom(size: usize) -> ! {
    // Keep the message allocation-free-ish; we are dying anyway.
    if !OOM_NOTE.swap(true, Ordering::Relaxed) {
        eprintln!("skip runtime: out of memory allocating {} bytes", size);
    }
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_tracked_per_chunk() {
        let p = alloc_aligned(64, 16, MemoryKind::IObj);
        assert_eq!(raw_memory_kind(p as usize), MemoryKind::IObj);
        assert_eq!(get_memory_kind(p as usize + 8), MemoryKind::IObj);
        free(p, 64, 16, MemoryKind::IObj);
    }

    #[test]
    fn freed_blocks_are_reused() {
        let p = alloc_aligned(128, 16, MemoryKind::Large);
        free(p, 128, 16, MemoryKind::Large);
        let q = alloc_aligned(128, 16, MemoryKind::Large);
        assert_eq!(p, q);
        free(q, 128, 16, MemoryKind::Large);
    }

    #[test]
    #[should_panic]
    fn oversized_alignment_is_rejected() {
        alloc_aligned(64, 8192, MemoryKind::Obstack);
    }
}
