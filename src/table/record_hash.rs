//! Chained hash table over the record allocator.
//!
//! A bucket array holds the head index of a singly-linked chain per
//! bucket; each item is one fixed-size record laid out as
//! `[key:K][next:4][value:V]`. By using records instead of slabs the
//! links are 4 bytes, which keeps the table compact for the fixed-width
//! values it serves (heights, chain heads).
//!
//! `store` prepends: the new item is written completely, pointing at the
//! old head, before the bucket head is overwritten. That final aligned
//! 4-byte store is the commit point, so a reader never observes a
//! half-built item. Duplicate keys are permitted; later writes shadow
//! earlier ones on lookup and `unlink` removes the most recent first.

use eyre::{ensure, Result, WrapErr};

use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;
use crate::table::{key_hash, BucketArray, RecordAllocator, EMPTY_RECORD};

#[derive(Debug)]
pub struct RecordHashTable {
    buckets: BucketArray<u32>,
    allocator: RecordAllocator,
    key_size: usize,
    value_size: usize,
}

impl RecordHashTable {
    /// Writes an empty table at `offset`: the bucket array, immediately
    /// followed by the item allocator.
    pub fn initialize_new(
        file: &mut MemoryMap,
        offset: u64,
        bucket_count: u32,
        key_size: usize,
        value_size: usize,
    ) -> Result<Self> {
        ensure!(key_size >= 4, "invalid key size {} (minimum 4)", key_size);

        let buckets = BucketArray::initialize_new(file, offset, bucket_count)?;
        let record_size = key_size + 4 + value_size;
        let allocator = RecordAllocator::initialize_new(file, buckets.end_offset(), record_size)?;

        Ok(Self {
            buckets,
            allocator,
            key_size,
            value_size,
        })
    }

    pub fn start(
        file: &MemoryMap,
        offset: u64,
        key_size: usize,
        value_size: usize,
    ) -> Result<Self> {
        ensure!(key_size >= 4, "invalid key size {} (minimum 4)", key_size);

        let buckets = BucketArray::start(file, offset)?;
        let record_size = key_size + 4 + value_size;
        let allocator = RecordAllocator::start(file, buckets.end_offset(), record_size)?;

        Ok(Self {
            buckets,
            allocator,
            key_size,
            value_size,
        })
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    fn bucket_index(&self, key: &[u8]) -> u32 {
        key_hash(key) % self.buckets.bucket_count()
    }

    fn item_next(&self, file: &MemoryMap, item: u32) -> Result<u32> {
        let record = self.allocator.get_raw(file, item)?;
        Deserializer::new(&record[self.key_size..self.key_size + 4]).read_u32()
    }

    /// Walks the chain for `key`, returning the first matching item index
    /// together with its predecessor (needed by `unlink`). Items are
    /// bounded by the file, not the synced count: a chain may reach
    /// records published ahead of a crash-interrupted sync.
    fn find(&self, file: &MemoryMap, key: &[u8]) -> Result<Option<(u32, Option<u32>)>> {
        ensure!(
            key.len() == self.key_size,
            "invalid key length {} (expected {})",
            key.len(),
            self.key_size
        );

        let mut current = self.buckets.get(file, self.bucket_index(key))?;
        let mut previous = None;

        while current != EMPTY_RECORD {
            let record = self
                .allocator
                .get_raw(file, current)
                .wrap_err("corrupt hash chain")?;
            if &record[..self.key_size] == key {
                return Ok(Some((current, previous)));
            }
            previous = Some(current);
            current = Deserializer::new(&record[self.key_size..self.key_size + 4]).read_u32()?;
        }

        Ok(None)
    }

    /// Stores `key` with a value produced by `write`. Returns the item's
    /// record index.
    pub fn store(
        &mut self,
        file: &mut MemoryMap,
        key: &[u8],
        write: impl FnOnce(&mut [u8]),
    ) -> Result<u32> {
        ensure!(
            key.len() == self.key_size,
            "invalid key length {} (expected {})",
            key.len(),
            self.key_size
        );

        let bucket = self.bucket_index(key);
        let head = self.buckets.get(file, bucket)?;

        let item = self.allocator.allocate(file)?;
        {
            let record = self.allocator.get_mut(file, item)?;
            record[..self.key_size].copy_from_slice(key);
            let mut serial = Serializer::new(&mut record[self.key_size..self.key_size + 4]);
            serial.write_u32(head)?;
            write(&mut record[self.key_size + 4..]);
        }

        // Commit: the item is fully built, publish it.
        self.buckets.put(file, bucket, item)?;

        Ok(item)
    }

    /// The value of the most recently stored item for `key`.
    pub fn get<'a>(&self, file: &'a MemoryMap, key: &[u8]) -> Result<Option<&'a [u8]>> {
        let Some((item, _)) = self.find(file, key)? else {
            return Ok(None);
        };
        Ok(Some(&self.allocator.get_raw(file, item)?[self.key_size + 4..]))
    }

    /// Overwrites the value of the most recent item for `key` in place.
    /// Returns whether the key was present.
    pub fn update(
        &mut self,
        file: &mut MemoryMap,
        key: &[u8],
        write: impl FnOnce(&mut [u8]),
    ) -> Result<bool> {
        let Some((item, _)) = self.find(file, key)? else {
            return Ok(false);
        };
        let record = self.allocator.get_raw_mut(file, item)?;
        write(&mut record[self.key_size + 4..]);
        Ok(true)
    }

    /// Removes the most recent item for `key` by splicing it out of its
    /// chain. The record itself is not reclaimed.
    pub fn unlink(&mut self, file: &mut MemoryMap, key: &[u8]) -> Result<bool> {
        let Some((item, previous)) = self.find(file, key)? else {
            return Ok(false);
        };
        let next = self.item_next(file, item)?;

        match previous {
            None => self.buckets.put(file, self.bucket_index(key), next)?,
            Some(previous) => {
                let record = self.allocator.get_raw_mut(file, previous)?;
                Serializer::new(&mut record[self.key_size..self.key_size + 4])
                    .write_u32(next)?;
            }
        }

        Ok(true)
    }

    /// Persists the item count; the table's batch commit.
    pub fn sync(&self, file: &mut MemoryMap) -> Result<()> {
        self.allocator.sync(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::mapped_file;

    fn key4(value: u32) -> [u8; 4] {
        value.to_le_bytes()
    }

    #[test]
    fn store_get_round_trip() {
        // bucket_count = 4, K = 4, V = 8.
        let (_dir, mut file) = mapped_file();
        let mut table = RecordHashTable::initialize_new(&mut file, 0, 4, 4, 8).unwrap();

        table
            .store(&mut file, &key4(0), |value| value.fill(0))
            .unwrap();
        table
            .store(&mut file, &key4(1), |value| {
                value.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8])
            })
            .unwrap();
        table.sync(&mut file).unwrap();

        assert_eq!(table.get(&file, &key4(0)).unwrap().unwrap(), &[0u8; 8]);
        assert_eq!(
            table.get(&file, &key4(1)).unwrap().unwrap(),
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert!(table.get(&file, &key4(2)).unwrap().is_none());
    }

    #[test]
    fn duplicate_keys_shadow_and_unlink_in_reverse() {
        let (_dir, mut file) = mapped_file();
        let mut table = RecordHashTable::initialize_new(&mut file, 0, 1, 4, 1).unwrap();
        let key = key4(9);

        table.store(&mut file, &key, |value| value[0] = b'a').unwrap();
        table.store(&mut file, &key, |value| value[0] = b'b').unwrap();

        assert_eq!(table.get(&file, &key).unwrap().unwrap(), b"b");
        assert!(table.unlink(&mut file, &key).unwrap());
        assert_eq!(table.get(&file, &key).unwrap().unwrap(), b"a");
        assert!(table.unlink(&mut file, &key).unwrap());
        assert!(table.get(&file, &key).unwrap().is_none());
        assert!(!table.unlink(&mut file, &key).unwrap());
    }

    #[test]
    fn unlink_splices_mid_chain_items() {
        // One bucket forces all keys into a single chain.
        let (_dir, mut file) = mapped_file();
        let mut table = RecordHashTable::initialize_new(&mut file, 0, 1, 4, 1).unwrap();

        for i in 0..3u32 {
            table
                .store(&mut file, &key4(i), |value| value[0] = i as u8)
                .unwrap();
        }

        // key 1 sits in the middle of the chain (2 -> 1 -> 0).
        assert!(table.unlink(&mut file, &key4(1)).unwrap());
        assert_eq!(table.get(&file, &key4(0)).unwrap().unwrap(), &[0]);
        assert_eq!(table.get(&file, &key4(2)).unwrap().unwrap(), &[2]);
        assert!(table.get(&file, &key4(1)).unwrap().is_none());
    }

    #[test]
    fn update_overwrites_in_place() {
        let (_dir, mut file) = mapped_file();
        let mut table = RecordHashTable::initialize_new(&mut file, 0, 2, 4, 4).unwrap();
        let key = key4(7);

        assert!(!table.update(&mut file, &key, |_| {}).unwrap());
        table
            .store(&mut file, &key, |value| value.copy_from_slice(b"aaaa"))
            .unwrap();
        assert!(table
            .update(&mut file, &key, |value| value.copy_from_slice(b"bbbb"))
            .unwrap());
        assert_eq!(table.get(&file, &key).unwrap().unwrap(), b"bbbb");
    }

    #[test]
    fn survives_reopen_after_sync() {
        let (_dir, mut file) = mapped_file();
        let mut table = RecordHashTable::initialize_new(&mut file, 0, 4, 4, 8).unwrap();
        table
            .store(&mut file, &key4(3), |value| value.fill(0x3c))
            .unwrap();
        table.sync(&mut file).unwrap();

        let reopened = RecordHashTable::start(&file, 0, 4, 8).unwrap();
        assert_eq!(
            reopened.get(&file, &key4(3)).unwrap().unwrap(),
            &[0x3c; 8]
        );
    }
}
