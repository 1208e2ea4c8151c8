//! The value cell of the memoization graph.
//!
//! Values are compared by raw bit identity: two doubles are "the same
//! value" exactly when their bit patterns agree (so a NaN equals an
//! identical NaN), and two interned payloads agree exactly when they
//! are the same canonical object. Holding an interned payload counts
//! as a strong reference; clone and drop do the refcounting.

use crate::intern::{intern_string, string_value, IObjRef};

/// Strings up to this many bytes pack inline.
pub const SHORT_STRING_MAX: usize = 7;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortString {
    len: u8,
    bytes: [u8; SHORT_STRING_MAX],
}

impl ShortString {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).expect("short string is not utf-8")
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum MemoValue {
    Undef,
    Null,
    /// Small sentinel bits used by generated code; never dereferenced.
    FakePtr(u64),
    Int(i64),
    /// Raw IEEE-754 bits; see [`MemoValue::from_f64`].
    Double(u64),
    ShortString(ShortString),
    /// Interned string payload.
    LongString(IObjRef),
    /// Interned object payload.
    Object(IObjRef),
    /// Interned exception payload; delivered to every dependent of the
    /// failed computation without re-execution.
    Exception(IObjRef),
    /// Placeholder marker: the revision holding this is still being
    /// computed by some context.
    Context,
    /// Invalidation-watcher sentinel (subscription bookkeeping).
    Watcher(u64),
}

impl MemoValue {
    pub fn from_f64(v: f64) -> MemoValue {
        MemoValue::Double(v.to_bits())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MemoValue::Double(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MemoValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Pack a string, inline when it fits, interned otherwise.
    pub fn from_str(s: &str) -> MemoValue {
        if s.len() <= SHORT_STRING_MAX {
            let mut bytes = [0u8; SHORT_STRING_MAX];
            bytes[..s.len()].copy_from_slice(s.as_bytes());
            MemoValue::ShortString(ShortString {
                len: s.len() as u8,
                bytes,
            })
        } else {
            MemoValue::LongString(intern_string(s))
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MemoValue::ShortString(s) => Some(s.as_str()),
            MemoValue::LongString(r) => Some(string_value(r)),
            _ => None,
        }
    }

    /// True for the in-flight placeholder marker.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, MemoValue::Context)
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, MemoValue::Exception(_))
    }

    /// The interned payload, if this value holds one.
    pub fn iobj(&self) -> Option<&IObjRef> {
        match self {
            MemoValue::LongString(r) | MemoValue::Object(r) | MemoValue::Exception(r) => Some(r),
            _ => None,
        }
    }
}

impl std::fmt::Debug for MemoValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoValue::Undef => write!(f, "undef"),
            MemoValue::Null => write!(f, "null"),
            MemoValue::FakePtr(bits) => write!(f, "fakeptr({:#x})", bits),
            MemoValue::Int(v) => write!(f, "{}", v),
            MemoValue::Double(bits) => write!(f, "{}", f64::from_bits(*bits)),
            MemoValue::ShortString(s) => write!(f, "{:?}", s.as_str()),
            MemoValue::LongString(r) => write!(f, "{:?}", string_value(r)),
            MemoValue::Object(r) => write!(f, "{:?}", r),
            MemoValue::Exception(r) => write!(f, "exception({:?})", r),
            MemoValue::Context => write!(f, "<context>"),
            MemoValue::Watcher(id) => write!(f, "<watcher {}>", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_compare_by_bits() {
        let nan1 = MemoValue::from_f64(f64::NAN);
        let nan2 = MemoValue::from_f64(f64::NAN);
        assert_eq!(nan1, nan2);
        assert_ne!(MemoValue::from_f64(0.0), MemoValue::from_f64(-0.0));
    }

    #[test]
    fn strings_pack_or_intern() {
        let short = MemoValue::from_str("abc");
        assert!(matches!(short, MemoValue::ShortString(_)));
        assert_eq!(short.as_str(), Some("abc"));

        let long = MemoValue::from_str("a considerably longer string");
        assert!(matches!(long, MemoValue::LongString(_)));
        assert_eq!(long.as_str(), Some("a considerably longer string"));

        // Interned payloads compare by canonical identity.
        assert_eq!(long, MemoValue::from_str("a considerably longer string"));
    }

    #[test]
    fn ints_and_doubles_are_distinct() {
        assert_ne!(MemoValue::Int(1), MemoValue::from_f64(1.0));
    }
}
