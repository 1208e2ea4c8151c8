use thiserror::Error;

/// Errors surfaced by the runtime to its embedder.
///
/// Skip-level exceptions are *not* represented here: they travel through
/// the memoization graph as `MemoValue::Exception` payloads so that every
/// dependent of a failed computation observes the same exception object
/// without re-executing. This enum covers the host-facing taxonomy only.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// An impossible-in-design condition was detected at runtime.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A domain error raised on behalf of generated code.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// An I/O failure, carrying the OS error text.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A memo-cache file was refused (bad magic, version, or build hash).
    /// The caller proceeds with an empty cache.
    #[error("memo cache rejected: {0}")]
    CacheFormat(String),

    /// Explicit program exit. The top-level harness catches this and
    /// returns `status`.
    #[error("exit with status {status}")]
    Exit { status: i32 },
}

/// Domain errors thrown as Skip-level exceptions by primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of bounds for size {size}")]
    OutOfBounds { index: i64, size: i64 },

    #[error("invalid index: {0}")]
    InvalidIndex(i64),

    #[error("invalid size: {0}")]
    InvalidSize(i64),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
