//! The memo-cache serializer.
//!
//! On-disk layout (all integers little-endian):
//!
//! ```text
//! u64  format_version = 0
//! u64  build_hash            // type-registry identity; mismatch => refuse
//! u64  iobj_count            // filled at end
//! u64  invocation_count      // filled at end
//! record*
//! u8   kEndTag
//! ```
//!
//! Records reference earlier records by 1-based emission index; within
//! user bytes every non-null reference slot holds such an index instead
//! of an address. Invocations are emitted in a canonical order
//! (dependencies first, roots sorted by their structural key), which
//! makes serialize-deserialize-serialize byte-identical.
//!
//! Deserialization replays invocations as "fake calls": each one opens
//! a context, records its target revisions as dependencies, and
//! delivers the stored value through the ordinary placeholder
//! replacement path -- so a restored cache behaves exactly like a warm
//! one, traces included.

use log::{debug, info};
use rustc_hash::FxHashMap;
use std::convert::TryInto;
use std::sync::Arc;

use crate::builtins::{CELL_KEY_TYPE, REGEX_TYPE, STRING_TYPE};
use crate::error::{Result, RuntimeError};
use crate::intern::{intern_bytes, intern_string, string_value, IObjRef};
use crate::memo::{Invocation, Runtime};
use crate::obstack::ObjAddr;
use crate::type_desc::{build_hash, type_by_id, Stripe, Type, TypeId};
use crate::value::MemoValue;

pub const FORMAT_VERSION: u64 = 0;

const K_END_TAG: u8 = 0;
const K_REF_CLASS_TAG: u8 = 1;
const K_LONG_STRING_TAG: u8 = 2;
const K_ARRAY_TAG: u8 = 3;
const K_INVOCATION_TAG: u8 = 4;
const K_REGEX_TAG: u8 = 5;

// MemoValue wire tags.
const V_UNDEF: u8 = 0;
const V_NULL: u8 = 1;
const V_FAKE_PTR: u8 = 2;
const V_INT: u8 = 3;
const V_DOUBLE: u8 = 4;
const V_SHORT_STRING: u8 = 5;
const V_LONG_STRING: u8 = 6;
const V_OBJECT: u8 = 7;
const V_EXCEPTION: u8 = 8;

struct Writer {
    out: Vec<u8>,
    /// Canonical object address -> 1-based emission index.
    emitted_objs: FxHashMap<ObjAddr, u64>,
    /// Invocation identity -> 1-based emission index.
    emitted_invs: FxHashMap<usize, u64>,
    next_index: u64,
    iobj_count: u64,
    invocation_count: u64,
}

impl Writer {
    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit an interned object (dependencies first) and return its
    /// index.
    fn emit_obj(&mut self, obj: &IObjRef) -> u64 {
        if let Some(&idx) = self.emitted_objs.get(&obj.addr()) {
            return idx;
        }
        let ty = obj.ty();

        // Regex: opaque pattern + flags pair.
        if std::ptr::eq(ty, &REGEX_TYPE) {
            let bytes = obj.user_bytes();
            let pattern_addr =
                usize::from_le_bytes(bytes[0..8].try_into().expect("regex slot"));
            let pattern = unsafe { IObjRef::clone_addr(pattern_addr) };
            let text = string_value(&pattern).to_string();
            let flags = i64::from_le_bytes(bytes[8..16].try_into().expect("regex flags"));
            self.out.push(K_REGEX_TAG);
            self.u64(text.len() as u64);
            self.out.extend_from_slice(text.as_bytes());
            self.u64(flags as u64);
            return self.finish_obj(obj.addr());
        }

        if std::ptr::eq(ty, &STRING_TYPE) {
            let bytes = obj.user_bytes().to_vec();
            if bytes.len() <= u8::MAX as usize {
                self.out.push(K_LONG_STRING_TAG);
                self.out.push(bytes.len() as u8);
                self.out.extend_from_slice(&bytes);
            } else {
                self.out.push(K_ARRAY_TAG);
                self.u32(ty.id().0);
                self.u64(bytes.len() as u64);
                self.out.extend_from_slice(&bytes);
            }
            return self.finish_obj(obj.addr());
        }

        // Generic object: children first, then the body with reference
        // slots replaced by indices.
        let body = self.swizzled_bytes(obj);
        match ty.kind {
            crate::type_desc::TypeKind::Array => {
                self.out.push(K_ARRAY_TAG);
                self.u32(ty.id().0);
                self.u64(obj.array_size() as u64);
            }
            _ => {
                self.out.push(K_REF_CLASS_TAG);
                self.u32(ty.id().0);
            }
        }
        self.out.extend_from_slice(&body);
        self.finish_obj(obj.addr())
    }

    fn finish_obj(&mut self, addr: ObjAddr) -> u64 {
        self.next_index += 1;
        self.iobj_count += 1;
        self.emitted_objs.insert(addr, self.next_index);
        self.next_index
    }

    /// Copy user bytes with every reference slot rewritten to the
    /// child's emission index. Emits children as a side effect.
    fn swizzled_bytes(&mut self, obj: &IObjRef) -> Vec<u8> {
        let ty = obj.ty();
        let mut body = obj.user_bytes().to_vec();
        let mut slots: Vec<(usize, ObjAddr)> = Vec::new();
        unsafe {
            crate::type_desc::for_each_ref_slot(
                ty,
                body.as_mut_ptr(),
                obj.array_size(),
                Stripe::Gc,
                &mut |slot| {
                    let target = *slot;
                    if target != 0 {
                        let offset = slot as usize - body.as_ptr() as usize;
                        slots.push((offset, target));
                    }
                },
            );
        }
        for (offset, target) in slots {
            let child = unsafe { IObjRef::clone_addr(target) };
            let idx = self.emit_obj(&child);
            body[offset..offset + 8].copy_from_slice(&idx.to_le_bytes());
        }
        body
    }

    fn emit_value(&mut self, value: &MemoValue) {
        match value {
            MemoValue::Undef => {
                self.out.push(V_UNDEF);
                self.u64(0);
            }
            MemoValue::Null => {
                self.out.push(V_NULL);
                self.u64(0);
            }
            MemoValue::FakePtr(bits) => {
                self.out.push(V_FAKE_PTR);
                self.u64(*bits);
            }
            MemoValue::Int(v) => {
                self.out.push(V_INT);
                self.u64(*v as u64);
            }
            MemoValue::Double(bits) => {
                self.out.push(V_DOUBLE);
                self.u64(*bits);
            }
            MemoValue::ShortString(s) => {
                let text = s.as_str();
                let mut packed = [0u8; 8];
                packed[0] = text.len() as u8;
                packed[1..1 + text.len()].copy_from_slice(text.as_bytes());
                self.out.push(V_SHORT_STRING);
                self.out.extend_from_slice(&packed);
            }
            MemoValue::LongString(r) => {
                let idx = self.emit_obj(r);
                self.out.push(V_LONG_STRING);
                self.u64(idx);
            }
            MemoValue::Object(r) => {
                let idx = self.emit_obj(r);
                self.out.push(V_OBJECT);
                self.u64(idx);
            }
            MemoValue::Exception(r) => {
                let idx = self.emit_obj(r);
                self.out.push(V_EXCEPTION);
                self.u64(idx);
            }
            MemoValue::Context | MemoValue::Watcher(_) => {
                unreachable!("transient values never serialize")
            }
        }
    }

    /// Emit one invocation record, dependencies (targets) first.
    fn emit_invocation(&mut self, inv: &Arc<Invocation>) -> Option<u64> {
        let identity = Arc::as_ptr(inv) as usize;
        if let Some(&idx) = self.emitted_invs.get(&identity) {
            return Some(idx);
        }
        let (value, targets) = inv.serial_snapshot()?;

        let mut target_ids = Vec::with_capacity(targets.len());
        for target in &targets {
            if let Some(id) = self.emit_invocation(target) {
                target_ids.push(id);
            }
        }

        // Children referenced from the key and the value come before
        // the record body so their indices resolve.
        let body = self.swizzled_bytes(inv.key());
        self.out.push(K_INVOCATION_TAG);
        self.u32(inv.key().ty().id().0);
        self.out.extend_from_slice(&body);
        self.emit_value(&value);
        self.u64(target_ids.len() as u64);
        for id in target_ids {
            self.u64(id);
        }

        self.next_index += 1;
        self.invocation_count += 1;
        self.emitted_invs.insert(identity, self.next_index);
        Some(self.next_index)
    }
}

/// A structural sort key independent of addresses, so emission order is
/// reproducible across processes.
fn canonical_key(obj: &IObjRef, depth: usize) -> Vec<u8> {
    let ty = obj.ty();
    let mut out = Vec::new();
    out.extend_from_slice(&ty.id().0.to_le_bytes());
    out.extend_from_slice(&obj.array_size().to_le_bytes());
    let bytes = obj.user_bytes();
    let mut refs: Vec<ObjAddr> = Vec::new();
    let mut masked = bytes.to_vec();
    unsafe {
        crate::type_desc::for_each_ref_slot(
            ty,
            masked.as_mut_ptr(),
            obj.array_size(),
            Stripe::Gc,
            &mut |slot| {
                let t = *slot;
                if t != 0 {
                    refs.push(t);
                }
                *slot = 0;
            },
        );
    }
    out.extend_from_slice(&masked);
    if depth > 0 {
        for r in refs {
            let child = unsafe { IObjRef::clone_addr(r) };
            out.extend_from_slice(&canonical_key(&child, depth - 1));
        }
    }
    out
}

/// Serialize the entire memo cache to bytes.
pub fn serialize_memo_cache() -> Vec<u8> {
    let rt = Runtime::global();
    let mut invocations = rt.all_invocations();
    invocations.sort_by_cached_key(|inv| canonical_key(inv.key(), 4));

    let mut w = Writer {
        out: Vec::new(),
        emitted_objs: FxHashMap::default(),
        emitted_invs: FxHashMap::default(),
        next_index: 0,
        iobj_count: 0,
        invocation_count: 0,
    };
    w.u64(FORMAT_VERSION);
    w.u64(build_hash());
    let counts_at = w.out.len();
    w.u64(0); // iobj_count, patched below
    w.u64(0); // invocation_count, patched below

    for inv in &invocations {
        w.emit_invocation(inv);
    }
    w.out.push(K_END_TAG);

    let iobj_count = w.iobj_count;
    let invocation_count = w.invocation_count;
    w.out[counts_at..counts_at + 8].copy_from_slice(&iobj_count.to_le_bytes());
    w.out[counts_at + 8..counts_at + 16].copy_from_slice(&invocation_count.to_le_bytes());
    info!(
        "serialized memo cache: {} objects, {} invocations, {} bytes",
        iobj_count,
        invocation_count,
        w.out.len()
    );
    w.out
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8> {
        let v = *self
            .buf
            .get(self.at)
            .ok_or_else(|| RuntimeError::CacheFormat("truncated".into()))?;
        self.at += 1;
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .at
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| RuntimeError::CacheFormat("truncated".into()))?;
        let s = &self.buf[self.at..end];
        self.at = end;
        Ok(s)
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
}

enum Loaded {
    Obj(IObjRef),
    Inv(IObjRef, Arc<Invocation>),
}

impl Loaded {
    fn obj(&self) -> &IObjRef {
        match self {
            Loaded::Obj(r) => r,
            Loaded::Inv(r, _) => r,
        }
    }
}

fn resolve_ty(id: u32) -> Result<&'static Type> {
    type_by_id(TypeId(id))
        .ok_or_else(|| RuntimeError::CacheFormat(format!("unknown vtable id {}", id)))
}

/// Rebuild user bytes: indices back to canonical addresses.
fn unswizzle(
    ty: &'static Type,
    array_size: u32,
    raw: &[u8],
    loaded: &[Loaded],
) -> Result<Vec<u8>> {
    let mut body = raw.to_vec();
    let mut fixups: Vec<(usize, u64)> = Vec::new();
    unsafe {
        crate::type_desc::for_each_ref_slot(
            ty,
            body.as_mut_ptr(),
            array_size,
            Stripe::Gc,
            &mut |slot| {
                let idx = *slot as u64;
                if idx != 0 {
                    let offset = slot as usize - body.as_ptr() as usize;
                    fixups.push((offset, idx));
                }
            },
        );
    }
    for (offset, idx) in fixups {
        let entry = loaded
            .get(idx as usize - 1)
            .ok_or_else(|| RuntimeError::CacheFormat(format!("forward reference {}", idx)))?;
        let addr = entry.obj().addr();
        body[offset..offset + 8].copy_from_slice(&(addr as u64).to_le_bytes());
    }
    Ok(body)
}

fn read_value(r: &mut Reader<'_>, loaded: &[Loaded]) -> Result<MemoValue> {
    let tag = r.u8()?;
    let payload = r.u64()?;
    let by_index = |idx: u64| -> Result<IObjRef> {
        idx.checked_sub(1)
            .and_then(|i| loaded.get(i as usize))
            .map(|e| e.obj().clone())
            .ok_or_else(|| RuntimeError::CacheFormat(format!("bad value index {}", idx)))
    };
    Ok(match tag {
        V_UNDEF => MemoValue::Undef,
        V_NULL => MemoValue::Null,
        V_FAKE_PTR => MemoValue::FakePtr(payload),
        V_INT => MemoValue::Int(payload as i64),
        V_DOUBLE => MemoValue::Double(payload),
        V_SHORT_STRING => {
            let packed = payload.to_le_bytes();
            let len = packed[0] as usize;
            let text = std::str::from_utf8(&packed[1..1 + len])
                .map_err(|_| RuntimeError::CacheFormat("bad short string".into()))?;
            MemoValue::from_str(text)
        }
        V_LONG_STRING => MemoValue::LongString(by_index(payload)?),
        V_OBJECT => MemoValue::Object(by_index(payload)?),
        V_EXCEPTION => MemoValue::Exception(by_index(payload)?),
        other => {
            return Err(RuntimeError::CacheFormat(format!(
                "unknown value tag {}",
                other
            )))
        }
    })
}

/// Load a serialized memo cache, replaying the dependency graph through
/// fake calls. Returns the number of invocations restored. A refused
/// cache leaves the runtime untouched.
pub fn deserialize_memo_cache(buf: &[u8]) -> Result<usize> {
    let rt = Runtime::global();
    let mut r = Reader { buf, at: 0 };

    let version = r.u64()?;
    if version != FORMAT_VERSION {
        return Err(RuntimeError::CacheFormat(format!(
            "format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let hash = r.u64()?;
    if hash != build_hash() {
        return Err(RuntimeError::CacheFormat(
            "build hash mismatch; refusing stale cache".into(),
        ));
    }
    let _iobj_count = r.u64()?;
    let _invocation_count = r.u64()?;

    let mut loaded: Vec<Loaded> = Vec::new();
    let mut restored = 0usize;
    let txn = rt.newest_visible_txn();

    loop {
        let tag = r.u8()?;
        match tag {
            K_END_TAG => break,
            K_REF_CLASS_TAG => {
                let ty = resolve_ty(r.u32()?)?;
                let raw = r.bytes(ty.total_user_bytes(0))?;
                let body = unswizzle(ty, 0, raw, &loaded)?;
                loaded.push(Loaded::Obj(intern_bytes(ty, 0, &body)));
            }
            K_LONG_STRING_TAG => {
                let len = r.u8()? as usize;
                let bytes = r.bytes(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| RuntimeError::CacheFormat("bad string".into()))?;
                loaded.push(Loaded::Obj(intern_string(text)));
            }
            K_ARRAY_TAG => {
                let ty = resolve_ty(r.u32()?)?;
                let n = r.u64()? as u32;
                let raw = r.bytes(ty.total_user_bytes(n))?;
                let body = unswizzle(ty, n, raw, &loaded)?;
                loaded.push(Loaded::Obj(intern_bytes(ty, n, &body)));
            }
            K_REGEX_TAG => {
                let len = r.u64()? as usize;
                let bytes = r.bytes(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| RuntimeError::CacheFormat("bad regex pattern".into()))?;
                let flags = r.u64()? as i64;
                let pattern = intern_string(text);
                let mut body = vec![0u8; 16];
                body[0..8].copy_from_slice(&(pattern.addr() as u64).to_le_bytes());
                body[8..16].copy_from_slice(&flags.to_le_bytes());
                loaded.push(Loaded::Obj(intern_bytes(&REGEX_TYPE, 0, &body)));
            }
            K_INVOCATION_TAG => {
                let ty = resolve_ty(r.u32()?)?;
                let raw = r.bytes(ty.total_user_bytes(0))?;
                let body = unswizzle(ty, 0, raw, &loaded)?;
                let key = intern_bytes(ty, 0, &body);
                let value = read_value(&mut r, &loaded)?;
                let n_targets = r.u64()? as usize;
                let mut targets = Vec::with_capacity(n_targets);
                for _ in 0..n_targets {
                    let idx = r.u64()?;
                    match idx.checked_sub(1).and_then(|i| loaded.get(i as usize)) {
                        Some(Loaded::Inv(_, inv)) => targets.push(inv.clone()),
                        _ => {
                            return Err(RuntimeError::CacheFormat(format!(
                                "target {} is not an invocation",
                                idx
                            )))
                        }
                    }
                }

                let inv = Invocation::intern(key.clone());
                if inv.head().is_none() {
                    if std::ptr::eq(ty, &CELL_KEY_TYPE) || ty.evaluate.is_none() {
                        // Cells re-seed directly; there is no thunk to
                        // fake.
                        inv.install_revision(
                            crate::txn::Lifespan::new(txn, crate::txn::TxnId::NEVER),
                            value,
                        );
                    } else {
                        // Fake call: replay dependencies and deliver
                        // the recorded value through the normal
                        // insertion path.
                        let ctx = inv.begin_replay(txn);
                        for target in &targets {
                            if let Some(head) = target.head() {
                                ctx.add_dependency(&head);
                            }
                        }
                        ctx.evaluate_done(value);
                    }
                    restored += 1;
                }
                loaded.push(Loaded::Inv(key, inv));
            }
            other => {
                return Err(RuntimeError::CacheFormat(format!(
                    "unknown record tag {}",
                    other
                )))
            }
        }
    }

    debug!("deserialized {} invocations", restored);
    Ok(restored)
}

/// Write the cache to a file.
pub fn save_memo_cache(path: &std::path::Path) -> Result<()> {
    std::fs::write(path, serialize_memo_cache())?;
    Ok(())
}

/// Load the cache from a file. On a format refusal the error is
/// returned and the in-memory cache stays empty; the caller proceeds
/// without it.
pub fn load_memo_cache(path: &std::path::Path) -> Result<usize> {
    let bytes = std::fs::read(path)?;
    deserialize_memo_cache(&bytes)
}
