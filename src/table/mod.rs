//! # On-Disk Table Primitives
//!
//! The building blocks every concrete table is assembled from:
//!
//! - [`BucketArray`]: a fixed-count array of bucket heads at a file offset
//! - [`RecordAllocator`]: append-only fixed-size records, 32-bit indices
//! - [`SlabAllocator`]: append-only variable-size slabs, 64-bit offsets
//! - [`RecordHashTable`] / [`SlabHashTable`]: bucketed chained hash tables
//! - [`LinkedRecords`]: singly-linked record chains
//! - [`RecordMultimap`]: key -> chain of payload rows
//!
//! ## Offset Views
//!
//! Several components can share one file (a bucket array followed by an
//! allocator, or an index region followed by slabs), so none of them owns
//! the [`MemoryMap`](crate::storage::MemoryMap). Each is a small *view*
//! holding its header offset and cached header fields, and takes the file
//! as a parameter per call. The composite table that owns the file also
//! owns all the views into it, which keeps borrows disjoint and honest.
//!
//! ## Commit Discipline
//!
//! `store` on either hash table writes the item fully (key, next, value)
//! before overwriting the bucket head; the head update is a single
//! aligned 4- or 8-byte store and is the only write a concurrent reader
//! can observe mid-batch. Allocator count headers are written by `sync`,
//! which is each table's batch commit.

mod bucket_array;
mod linked_records;
mod multimap;
mod record_allocator;
mod record_hash;
mod slab_allocator;
mod slab_hash;

pub use bucket_array::{BucketArray, BucketEntry};
pub use linked_records::{ChainIter, LinkedRecords};
pub use multimap::RecordMultimap;
pub use record_allocator::RecordAllocator;
pub use record_hash::RecordHashTable;
pub use slab_allocator::SlabAllocator;
pub use slab_hash::SlabHashTable;

/// Empty sentinel for 32-bit record indices.
pub const EMPTY_RECORD: u32 = u32::MAX;

/// Empty sentinel for 64-bit slab offsets.
pub const EMPTY_SLAB: u64 = u64::MAX;

/// Bucket selector: identity over the first four key bytes, little-endian.
/// Keys are already cryptographic hashes, so no further mixing is needed.
pub(crate) fn key_hash(key: &[u8]) -> u32 {
    debug_assert!(key.len() >= 4);
    u32::from_le_bytes([key[0], key[1], key[2], key[3]])
}
