//! Core value types shared by the producer and its consumers.
//!
//! Everything that crosses a process boundary uses fixed-size arrays
//! (`[u8; SYMBOL_LEN]`) so it can live in shared memory without heap
//! allocation.

pub mod enums;
pub mod symbol;

pub use enums::*;
pub use symbol::*;
