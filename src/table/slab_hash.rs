//! Chained hash table over the slab allocator.
//!
//! The slab twin of [`RecordHashTable`](crate::table::RecordHashTable):
//! each item is `[key:K][next:8][value:value_size]` where `value_size` is
//! chosen per insertion, so the table serves variable-width rows
//! (serialized transactions, block rows). Links are 64-bit slab offsets.
//!
//! The store ordering is the same: build the item fully, then publish it
//! with the single aligned 8-byte bucket-head store. If the caller syncs
//! the allocator before linking, data can be lost on a crash but the
//! table is never corrupted; the engine instead batches the allocator
//! sync per block and relies on the bucket store for intra-batch
//! visibility.

use eyre::{ensure, Result, WrapErr};

use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;
use crate::table::{key_hash, BucketArray, SlabAllocator, EMPTY_SLAB};

#[derive(Debug)]
pub struct SlabHashTable {
    buckets: BucketArray<u64>,
    allocator: SlabAllocator,
    key_size: usize,
}

impl SlabHashTable {
    /// Writes an empty table at `offset`: the bucket array, immediately
    /// followed by the slab allocator.
    pub fn initialize_new(
        file: &mut MemoryMap,
        offset: u64,
        bucket_count: u32,
        key_size: usize,
    ) -> Result<Self> {
        ensure!(key_size >= 4, "invalid key size {} (minimum 4)", key_size);

        let buckets = BucketArray::initialize_new(file, offset, bucket_count)?;
        let allocator = SlabAllocator::initialize_new(file, buckets.end_offset())?;

        Ok(Self {
            buckets,
            allocator,
            key_size,
        })
    }

    pub fn start(file: &MemoryMap, offset: u64, key_size: usize) -> Result<Self> {
        ensure!(key_size >= 4, "invalid key size {} (minimum 4)", key_size);

        let buckets = BucketArray::start(file, offset)?;
        let allocator = SlabAllocator::start(file, buckets.end_offset())?;

        Ok(Self {
            buckets,
            allocator,
            key_size,
        })
    }

    fn bucket_index(&self, key: &[u8]) -> u32 {
        key_hash(key) % self.buckets.bucket_count()
    }

    fn item_header_size(&self) -> usize {
        self.key_size + 8
    }

    fn item_next(&self, file: &MemoryMap, item: u64) -> Result<u64> {
        let header = file.slice(item, self.item_header_size())?;
        Deserializer::new(&header[self.key_size..]).read_u64()
    }

    fn item_matches(&self, file: &MemoryMap, item: u64, key: &[u8]) -> Result<bool> {
        Ok(&file.slice(item, self.key_size)?[..] == key)
    }

    /// Walks the chain for `key`. Items are bounded by the file, not the
    /// synced end offset: a chain may reach slabs published ahead of a
    /// crash-interrupted sync.
    fn find(&self, file: &MemoryMap, key: &[u8]) -> Result<Option<(u64, Option<u64>)>> {
        ensure!(
            key.len() == self.key_size,
            "invalid key length {} (expected {})",
            key.len(),
            self.key_size
        );

        let mut current = self.buckets.get(file, self.bucket_index(key))?;
        let mut previous = None;

        while current != EMPTY_SLAB {
            if self.item_matches(file, current, key).wrap_err("corrupt hash chain")? {
                return Ok(Some((current, previous)));
            }
            previous = Some(current);
            current = self.item_next(file, current)?;
        }

        Ok(None)
    }

    /// Stores `key` with a `value_size`-byte value produced by `write`.
    /// Returns the slab offset of the inserted item.
    pub fn store(
        &mut self,
        file: &mut MemoryMap,
        key: &[u8],
        value_size: usize,
        write: impl FnOnce(&mut [u8]),
    ) -> Result<u64> {
        ensure!(
            key.len() == self.key_size,
            "invalid key length {} (expected {})",
            key.len(),
            self.key_size
        );

        let bucket = self.bucket_index(key);
        let head = self.buckets.get(file, bucket)?;

        let item_size = self.item_header_size() + value_size;
        let item = self.allocator.allocate(file, item_size)?;
        {
            let slab = self.allocator.get_mut(file, item, item_size)?;
            slab[..self.key_size].copy_from_slice(key);
            Serializer::new(&mut slab[self.key_size..self.key_size + 8]).write_u64(head)?;
            write(&mut slab[self.key_size + 8..]);
        }

        // Commit: the item is fully built, publish it.
        self.buckets.put(file, bucket, item)?;

        Ok(item)
    }

    /// The slab offset of the value of the most recent item for `key`.
    /// The value's length is the caller's knowledge; slices are taken
    /// through [`SlabHashTable::value`].
    pub fn get(&self, file: &MemoryMap, key: &[u8]) -> Result<Option<u64>> {
        let Some((item, _)) = self.find(file, key)? else {
            return Ok(None);
        };
        Ok(Some(item + self.item_header_size() as u64))
    }

    /// A value slice of known length at an offset returned by `get`.
    pub fn value<'a>(&self, file: &'a MemoryMap, position: u64, len: usize) -> Result<&'a [u8]> {
        file.slice(position, len)
    }

    /// Bytes from a value offset to the end of the file; for values whose
    /// length is encoded in their own content.
    pub fn value_to_end<'a>(&self, file: &'a MemoryMap, position: u64) -> Result<&'a [u8]> {
        let len = file.size().saturating_sub(position);
        file.slice(position, len as usize)
    }

    /// Removes the most recent item for `key` by splicing. Slab space is
    /// not reclaimed.
    pub fn unlink(&mut self, file: &mut MemoryMap, key: &[u8]) -> Result<bool> {
        let Some((item, previous)) = self.find(file, key)? else {
            return Ok(false);
        };
        let next = self.item_next(file, item)?;

        match previous {
            None => self.buckets.put(file, self.bucket_index(key), next)?,
            Some(previous) => {
                let header_size = self.item_header_size();
                let slab = file.slice_mut(previous, header_size)?;
                Serializer::new(&mut slab[self.key_size..]).write_u64(next)?;
            }
        }

        Ok(true)
    }

    /// Persists the slab end offset; the table's batch commit.
    pub fn sync(&self, file: &mut MemoryMap) -> Result<()> {
        self.allocator.sync(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::mapped_file;

    const KEY: &[u8; 4] = b"keyk";

    #[test]
    fn duplicates_shadow_then_unlink_in_reverse() {
        // bucket_count = 1: everything chains.
        let (_dir, mut file) = mapped_file();
        let mut table = SlabHashTable::initialize_new(&mut file, 0, 1, 4).unwrap();

        table
            .store(&mut file, KEY, 1, |value| value.copy_from_slice(b"A"))
            .unwrap();
        table
            .store(&mut file, KEY, 2, |value| value.copy_from_slice(b"BB"))
            .unwrap();

        let position = table.get(&file, KEY).unwrap().unwrap();
        assert_eq!(table.value(&file, position, 2).unwrap(), b"BB");

        assert!(table.unlink(&mut file, KEY).unwrap());
        let position = table.get(&file, KEY).unwrap().unwrap();
        assert_eq!(table.value(&file, position, 1).unwrap(), b"A");

        assert!(table.unlink(&mut file, KEY).unwrap());
        assert!(table.get(&file, KEY).unwrap().is_none());
    }

    #[test]
    fn distinct_keys_resolve_through_shared_bucket() {
        let (_dir, mut file) = mapped_file();
        let mut table = SlabHashTable::initialize_new(&mut file, 0, 1, 4).unwrap();

        for i in 0..10u32 {
            let key = i.to_le_bytes();
            table
                .store(&mut file, &key, 4, |value| {
                    value.copy_from_slice(&(i * 100).to_le_bytes())
                })
                .unwrap();
        }

        for i in 0..10u32 {
            let key = i.to_le_bytes();
            let position = table.get(&file, &key).unwrap().unwrap();
            let value = table.value(&file, position, 4).unwrap();
            assert_eq!(u32::from_le_bytes(value.try_into().unwrap()), i * 100);
        }
        assert!(table.get(&file, &11u32.to_le_bytes()).unwrap().is_none());
    }

    #[test]
    fn survives_reopen_after_sync() {
        let (_dir, mut file) = mapped_file();
        let mut table = SlabHashTable::initialize_new(&mut file, 0, 8, 4).unwrap();
        table
            .store(&mut file, KEY, 3, |value| value.copy_from_slice(b"xyz"))
            .unwrap();
        table.sync(&mut file).unwrap();

        let reopened = SlabHashTable::start(&file, 0, 4).unwrap();
        let position = reopened.get(&file, KEY).unwrap().unwrap();
        assert_eq!(reopened.value(&file, position, 3).unwrap(), b"xyz");
    }
}
