//! # mdx-core
//!
//! Shared-memory building blocks for the market-data distribution system:
//!
//! - **Versioned lock** (`lock`) - seqlock word with a 12-bit reader bitmap
//! - **Book layout** (`book`) - fixed-layout level records and offset arithmetic
//! - **Shared memory** (`shm`) - file-backed mmap segments
//! - **Book cache** (`book_cache`) - producer-owned multi-reader depth cache
//! - **Symbol table** (`symbol_table`) - persistent symbol to locator registry
//! - **Ring transport** (`ring`) - single-writer single-reader byte ring
//! - **Protocol** (`protocol`) - control and data wire format
//! - **Configuration** (`config`) - JSON config deserialization
//! - **Error types** (`error`) - domain-specific `MdxError` via thiserror
//! - **CPU affinity** (`cpu_affinity`) - thread-to-core pinning
//! - **Time utilities** (`time_util`) - wall clock and cycle counter
//! - **Logging** (`logging`) - tracing-based structured logging

pub mod book;
pub mod book_cache;
pub mod config;
pub mod cpu_affinity;
pub mod error;
pub mod lock;
pub mod logging;
pub mod protocol;
pub mod ring;
pub mod shm;
pub mod symbol_table;
pub mod time_util;
pub mod types;

// Re-export types at crate root for convenience.
pub use types::*;
