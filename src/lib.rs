//! # coindb - Blockchain Storage Engine
//!
//! coindb is the on-disk storage engine backing a Bitcoin blockchain node.
//! It is a family of cooperating, memory-mapped, append-oriented data
//! structures that together index blocks, transactions, unspent outputs,
//! address histories and stealth-payment metadata.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │           Database (push / pop)             │
//! ├─────────────────────────────────────────────┤
//! │ Block │ Tx │ Spend │ History │ Stealth table│
//! ├──────────────────────────────┬──────────────┤
//! │ Hash tables / multimap       │ History shard│
//! ├──────────────────────────────┴──────────────┤
//! │   Record allocator  │  Slab allocator       │
//! ├─────────────────────────────────────────────┤
//! │     Memory-mapped file (grow-on-demand)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! All files live under a user-supplied prefix directory:
//!
//! ```text
//! prefix/
//! ├── lock             # process-wide exclusive lock file
//! ├── blocks_lookup    # record hash table: block hash -> height
//! ├── blocks_rows      # height index + block row slabs
//! ├── spends           # slab hash table: outpoint -> inpoint
//! ├── txs              # slab hash table: tx hash -> (height, index, tx)
//! ├── history_lookup   # record hash table: address hash -> chain head
//! ├── history_rows     # linked records of history rows
//! ├── stealth_index    # shard settings control file
//! └── stealth_rows     # height-sharded stealth rows
//! ```
//!
//! ## Write Model
//!
//! The engine is single-writer, multi-reader. Every mutating batch ends in
//! a `sync()` whose final store is a single aligned 4- or 8-byte write (a
//! bucket head, a record count, or the shard's `entries_end`); that store
//! is the commit point observed by readers through the [`db::Sequence`]
//! lock. Space is reclaimed only by whole-block rollback
//! ([`db::Database::pop`]).
//!
//! ## Module Overview
//!
//! - [`storage`]: memory-mapped file with grow-on-demand resize, directory lock
//! - [`serial`]: little-endian cursor over mapped bytes
//! - [`table`]: allocators, chained hash tables, linked records, multimap
//! - [`shard`]: append-only height-sharded history file with prefix scans
//! - [`db`]: the concrete tables and the database façade

#[macro_use]
mod macros;

pub mod db;
pub mod serial;
pub mod shard;
pub mod storage;
pub mod table;

#[cfg(test)]
pub(crate) mod test_util;

pub use db::{ActiveHeights, Database, Sequence, Store};
pub use storage::MemoryMap;
