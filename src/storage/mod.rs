//! # Storage Module
//!
//! The foundational layer: a byte-granular memory-mapped file with
//! grow-on-demand resizing, and the process-wide directory lock.
//!
//! ## Safety Model
//!
//! Memory-mapped files present a unique safety challenge: the underlying
//! memory becomes invalid when the file is grown and remapped. Instead of
//! runtime checks (guards, epochs, reference counting) the engine uses the
//! borrow checker for compile-time enforcement:
//!
//! ```text
//! MemoryMap::data(&self) -> &[u8]        // borrows &self immutably
//! MemoryMap::resize(&mut self)           // requires &mut self exclusively
//! ```
//!
//! No slice taken from the mapping can be held across a `resize` call, so
//! the pointer-into-mapping hazard of a remap is caught by rustc. Higher
//! layers consequently pass indices and offsets across mutation
//! boundaries, never raw slices.
//!
//! ## Growth Policy
//!
//! Files only ever grow. When a writer needs `n` bytes beyond the current
//! size, the file is resized to `max(n * 3 / 2, size * 2)` so that resize
//! (truncate + remap) cost is amortised across many appends.

mod lock;
mod mmap;

pub use lock::DirectoryLock;
pub use mmap::MemoryMap;
