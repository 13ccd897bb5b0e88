//! Typed error definitions for the market-data distribution system.
//!
//! [`MdxError`] covers the failures that components surface to their callers.
//! Constructor-time variants (`BackingStore`, `SymbolTable`, `Io`) are fatal for
//! the producer; the rest are handled at the component boundary and turned into
//! protocol status codes, drop counters or log lines.

use thiserror::Error;

/// Domain-specific errors.
#[derive(Debug, Error)]
pub enum MdxError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Shared memory creation, resize, or mapping failure.
    #[error("backing store failure: {0}")]
    BackingStore(String),

    /// Underlying file or socket I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Symbol table content or allocation error.
    #[error("symbol table error: {0}")]
    SymbolTable(String),

    /// A mutating operation was attempted on a read-only mapping.
    #[error("{0} is opened read-only")]
    ReadOnly(String),

    /// A fixed-capacity structure has no room left.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// Versioned lock misuse or timeout.
    #[error("lock error: {0}")]
    Lock(String),

    /// Malformed or unexpected wire data.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, MdxError>;
