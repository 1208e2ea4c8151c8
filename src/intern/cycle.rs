//! Collapsing strongly-connected subgraphs under a cycle handle.
//!
//! A cyclic component cannot be content-addressed node by node, so the
//! whole component is encoded as one canonical byte string: pick each
//! member in turn as a tentative root, lay the component out in
//! breadth-first discovery order, and encode internal references as
//! ordinals in that order. The member whose rooted encoding is
//! lexicographically minimal becomes the canonical root, which makes
//! isomorphic cycles produce identical encodings and therefore intern
//! to the same handle.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use super::{alloc_iobj, iobj_header, table, CYCLE_MEMBER_REFCOUNT_SENTINEL};
use crate::builtins::CYCLE_HANDLE_TYPE;
use crate::obstack::{obj_array_size, obj_type, ObjAddr};
use crate::type_desc::{Stripe, Type};

/// A uniform view of one graph node, whichever heap it lives in.
#[derive(Copy, Clone)]
struct NodeView {
    ty: &'static Type,
    array_size: u32,
    bytes: *const u8,
}

unsafe fn obstack_view(addr: ObjAddr) -> NodeView {
    NodeView {
        ty: obj_type(addr),
        array_size: obj_array_size(addr),
        bytes: addr as *const u8,
    }
}

unsafe fn iobj_view(addr: ObjAddr) -> NodeView {
    NodeView {
        ty: super::iobj_type(addr),
        array_size: super::iobj_array_size(addr),
        bytes: addr as *const u8,
    }
}

/// Walk `view`'s user data slot by slot. Ref slots are reported through
/// `on_ref`; everything else is appended raw to `out`.
unsafe fn encode_node(view: NodeView, out: &mut Vec<u8>, mut on_ref: impl FnMut(usize, &mut Vec<u8>)) {
    out.extend_from_slice(&(view.ty as *const Type as usize).to_le_bytes());
    out.extend_from_slice(&view.array_size.to_le_bytes());
    let elems = match view.ty.kind {
        crate::type_desc::TypeKind::Array => view.array_size as usize,
        crate::type_desc::TypeKind::String => {
            out.extend_from_slice(std::slice::from_raw_parts(
                view.bytes,
                view.ty.total_user_bytes(view.array_size),
            ));
            return;
        }
        _ => 1,
    };
    let full_slots = view.ty.user_byte_size / 8;
    let tail = view.ty.user_byte_size % 8;
    for e in 0..elems {
        let base = view.bytes.add(e * view.ty.user_byte_size);
        for s in 0..full_slots {
            if view.ty.is_ref_slot(s, Stripe::Gc) {
                let target = *(base.add(s * 8) as *const usize);
                on_ref(target, out);
            } else {
                out.extend_from_slice(std::slice::from_raw_parts(base.add(s * 8), 8));
            }
        }
        if tail != 0 {
            out.extend_from_slice(std::slice::from_raw_parts(base.add(full_slots * 8), tail));
        }
    }
}

/// Encode the component reachable from `root` through `members`,
/// breadth-first. Internal references become ordinals, external ones go
/// through `resolve`. Returns the encoding and the discovery order.
unsafe fn encode_cycle(
    root: ObjAddr,
    members: &FxHashSet<ObjAddr>,
    view_of: impl Fn(ObjAddr) -> NodeView + Copy,
    resolve: impl Fn(ObjAddr) -> usize + Copy,
) -> (Vec<u8>, Vec<ObjAddr>) {
    let mut ordinal: FxHashMap<ObjAddr, u32> = FxHashMap::default();
    let mut order: Vec<ObjAddr> = Vec::new();
    let mut queue: VecDeque<ObjAddr> = VecDeque::new();
    ordinal.insert(root, 0);
    order.push(root);
    queue.push_back(root);

    // First settle the discovery order so forward references encode as
    // ordinals too.
    while let Some(node) = queue.pop_front() {
        encode_node(view_of(node), &mut Vec::new(), |target, _| {
            if target != 0 && members.contains(&target) && !ordinal.contains_key(&target) {
                ordinal.insert(target, order.len() as u32);
                order.push(target);
                queue.push_back(target);
            }
        });
    }
    debug_assert_eq!(order.len(), members.len());

    let mut out = Vec::new();
    out.extend_from_slice(&(order.len() as u64).to_le_bytes());
    for &node in &order {
        encode_node(view_of(node), &mut out, |target, out| {
            if target == 0 {
                out.push(0);
            } else if let Some(&ord) = ordinal.get(&target) {
                out.push(1);
                out.extend_from_slice(&ord.to_le_bytes());
            } else {
                out.push(2);
                out.extend_from_slice(&(resolve(target) as u64).to_le_bytes());
            }
        });
    }
    (out, order)
}

fn cycle_hash(encoding: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = rustc_hash::FxHasher::default();
    encoding.hash(&mut h);
    h.finish()
}

/// Intern one strongly-connected component of obstack objects. On
/// return, `images` maps every member to its canonical interned image,
/// each entry owning one reference unit (delegated to the handle).
pub(crate) fn intern_cycle(scc: &[ObjAddr], images: &mut FxHashMap<ObjAddr, ObjAddr>) {
    let members: FxHashSet<ObjAddr> = scc.iter().copied().collect();
    let resolve_candidate = |target: ObjAddr| -> usize {
        images.get(&target).copied().unwrap_or(target)
    };

    // Canonical rotation: minimal rooted encoding wins.
    let (encoding, order) = unsafe {
        let mut best: Option<(Vec<u8>, Vec<ObjAddr>)> = None;
        for &candidate in scc {
            let rooted = encode_cycle(
                candidate,
                &members,
                |a| obstack_view(a),
                resolve_candidate,
            );
            let better = match &best {
                None => true,
                Some((b, _)) => rooted.0 < *b,
            };
            if better {
                best = Some(rooted);
            }
        }
        best.expect("empty component")
    };
    let hash = cycle_hash(&encoding);

    // Lookup and (on miss) installation happen under one bucket lock,
    // so two threads interning equal cycles cannot both install.
    let pairs: Vec<(ObjAddr, ObjAddr)> = table::with_bucket(hash, |bucket| unsafe {
        for &handle in bucket.iter() {
            if !std::ptr::eq(super::iobj_type(handle), &CYCLE_HANDLE_TYPE)
                || iobj_header(handle).next.load(Ordering::Acquire) as u64 != hash
            {
                continue;
            }
            let existing_members: FxHashSet<ObjAddr> =
                super::collect_refs(handle).into_iter().collect();
            let existing_root = *(handle as *const usize);
            let (their_encoding, their_order) =
                encode_cycle(existing_root, &existing_members, |a| iobj_view(a), |a| a);
            if their_encoding == encoding {
                // One reference unit per image entry we hand out.
                iobj_header(handle)
                    .refcount
                    .fetch_add(order.len() as u32, Ordering::Relaxed);
                return order
                    .iter()
                    .zip(their_order.iter())
                    .map(|(m, t)| (*m, *t))
                    .collect();
            }
        }

        // Build a fresh cycle: blocks first (so members can point at
        // each other), then slot fixup, then the handle.
        let mut image_of: FxHashMap<ObjAddr, ObjAddr> = FxHashMap::default();
        for &m in &order {
            let v = obstack_view(m);
            let raw =
                std::slice::from_raw_parts(v.bytes, v.ty.total_user_bytes(v.array_size)).to_vec();
            let img = alloc_iobj(v.ty, v.array_size, &raw, CYCLE_MEMBER_REFCOUNT_SENTINEL, 0, false);
            image_of.insert(m, img);
        }
        for &m in &order {
            let img = image_of[&m];
            let v = iobj_view(img);
            crate::type_desc::for_each_ref_slot(
                v.ty,
                img as *mut u8,
                v.array_size,
                Stripe::Gc,
                &mut |slot| {
                    let t = *slot;
                    if t == 0 {
                        return;
                    }
                    if let Some(&internal) = image_of.get(&t) {
                        *slot = internal; // intra-cycle: no refcount
                    } else {
                        let external = resolve_candidate(t);
                        *slot = external;
                        super::incref(external);
                    }
                },
            );
        }

        let mut handle_bytes = Vec::with_capacity(order.len() * 8);
        for &m in &order {
            handle_bytes.extend_from_slice(&(image_of[&m] as u64).to_le_bytes());
        }
        let handle = alloc_iobj(
            &CYCLE_HANDLE_TYPE,
            order.len() as u32,
            &handle_bytes,
            order.len() as u32,
            hash as usize,
            false,
        );
        for &m in &order {
            iobj_header(image_of[&m])
                .next
                .store(handle, Ordering::Release);
        }
        bucket.push(handle);

        order.iter().map(|m| (*m, image_of[m])).collect()
    });

    for (m, img) in pairs {
        images.insert(m, img);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obstack::{write_ref_slot, Obstack};
    use crate::type_desc::{Type, TypeKind, TYPE_ID_UNREGISTERED};
    use std::sync::atomic::AtomicU32;

    // One payload word, one reference.
    static NODE: Type = Type {
        name: "cycle::tests::Node",
        kind: TypeKind::RefClass,
        user_byte_size: 16,
        gc_mask: &[0b10],
        freeze_mask: &[0b10],
        on_state_change: None,
        evaluate: None,
        registered_id: AtomicU32::new(TYPE_ID_UNREGISTERED),
    };

    fn two_cycle(ob: &mut Obstack, a_val: u64, b_val: u64) -> ObjAddr {
        let a = ob.alloc_object(&NODE, 0);
        let b = ob.alloc_object(&NODE, 0);
        unsafe {
            *(a as *mut u64) = a_val;
            *(b as *mut u64) = b_val;
            write_ref_slot(a, 1, b);
            write_ref_slot(b, 1, a);
        }
        a
    }

    #[test]
    fn isomorphic_cycles_intern_to_one_handle() {
        let mut ob = Obstack::new();
        let c1 = two_cycle(&mut ob, 1, 2);
        let c2 = two_cycle(&mut ob, 1, 2);
        let i1 = ob.intern(c1);
        let i2 = ob.intern(c2);
        assert_eq!(i1, i2);
    }

    #[test]
    fn rotated_cycles_are_confluent() {
        let mut ob = Obstack::new();
        // Same cycle entered at the other member.
        let c1 = two_cycle(&mut ob, 5, 9);
        let c2_first = two_cycle(&mut ob, 9, 5);
        let c2 = unsafe { crate::obstack::read_ref_slot(c2_first, 1) };
        let i1 = ob.intern(c1);
        let i2 = ob.intern(c2);
        assert_eq!(i1, i2);
    }

    #[test]
    fn distinct_cycles_stay_distinct() {
        let mut ob = Obstack::new();
        let c1 = two_cycle(&mut ob, 1, 2);
        let c2 = two_cycle(&mut ob, 1, 3);
        let i1 = ob.intern(c1);
        let i2 = ob.intern(c2);
        assert_ne!(i1, i2);
    }

    #[test]
    fn self_loop_interns_under_a_handle() {
        let mut ob = Obstack::new();
        let a = ob.alloc_object(&NODE, 0);
        unsafe {
            *(a as *mut u64) = 77;
            write_ref_slot(a, 1, a);
        }
        let b = ob.alloc_object(&NODE, 0);
        unsafe {
            *(b as *mut u64) = 77;
            write_ref_slot(b, 1, b);
        }
        let ia = ob.intern(a);
        let ib = ob.intern(b);
        assert_eq!(ia, ib);
        // The image's reference slot points back at itself.
        let refs = ia.references();
        assert_eq!(refs, vec![ia.addr()]);
    }
}
