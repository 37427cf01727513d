//! Append-only allocator of fixed-size records.
//!
//! Layout at the caller-supplied offset: `[record_count:4]` followed by
//! `record_count * record_size` bytes. Allocation increments the cached
//! count and grows the file when the body would outrun it; `sync` writes
//! the count back, which is the moment new records become visible to
//! readers. Records are never deleted in place; the block table rolls
//! back by truncating the count.

use eyre::{bail, ensure, Result};

use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;

#[derive(Debug)]
pub struct RecordAllocator {
    offset: u64,
    record_size: usize,
    record_count: u32,
}

impl RecordAllocator {
    /// Writes `record_count = 0` at `offset`.
    pub fn initialize_new(file: &mut MemoryMap, offset: u64, record_size: usize) -> Result<Self> {
        ensure!(record_size > 0, "invalid record size 0");

        file.reserve(offset + 4)?;
        Serializer::new(file.slice_mut(offset, 4)?).write_u32(0)?;

        Ok(Self {
            offset,
            record_size,
            record_count: 0,
        })
    }

    /// Reads and caches the record count, validating that the body it
    /// implies fits inside the file.
    pub fn start(file: &MemoryMap, offset: u64, record_size: usize) -> Result<Self> {
        ensure!(record_size > 0, "invalid record size 0");

        let Ok(header) = file.slice(offset, 4) else {
            bail!("corrupt record allocator: header past end of file");
        };
        let record_count = Deserializer::new(header).read_u32()?;

        let body_end = offset + 4 + record_count as u64 * record_size as u64;
        ensure!(
            body_end <= file.size(),
            "corrupt record allocator: {} records of {} bytes do not fit",
            record_count,
            record_size
        );

        Ok(Self {
            offset,
            record_size,
            record_count,
        })
    }

    pub fn count(&self) -> u32 {
        self.record_count
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Absolute file offset of a record. Callers must hold a valid index.
    pub fn record_offset(&self, index: u32) -> u64 {
        self.offset + 4 + index as u64 * self.record_size as u64
    }

    /// Reserves room for one more record and returns its index. The count
    /// header is not touched until `sync`.
    pub fn allocate(&mut self, file: &mut MemoryMap) -> Result<u32> {
        let index = self.record_count;
        ensure!(index != u32::MAX, "record allocator full");

        let needed = self.record_offset(index) + self.record_size as u64;
        file.reserve(needed)?;

        self.record_count += 1;
        Ok(index)
    }

    pub fn get<'a>(&self, file: &'a MemoryMap, index: u32) -> Result<&'a [u8]> {
        ensure!(
            index < self.record_count,
            "record {} out of bounds (count={})",
            index,
            self.record_count
        );
        file.slice(self.record_offset(index), self.record_size)
    }

    pub fn get_mut<'a>(&self, file: &'a mut MemoryMap, index: u32) -> Result<&'a mut [u8]> {
        ensure!(
            index < self.record_count,
            "record {} out of bounds (count={})",
            index,
            self.record_count
        );
        file.slice_mut(self.record_offset(index), self.record_size)
    }

    /// Record bytes bounded only by the file, not the synced count.
    /// Chain walks use this: a crash between a bucket-head publish and
    /// `sync` leaves reachable records ahead of the count header, and
    /// those must read as data, not as corruption.
    pub fn get_raw<'a>(&self, file: &'a MemoryMap, index: u32) -> Result<&'a [u8]> {
        file.slice(self.record_offset(index), self.record_size)
    }

    pub fn get_raw_mut<'a>(&self, file: &'a mut MemoryMap, index: u32) -> Result<&'a mut [u8]> {
        file.slice_mut(self.record_offset(index), self.record_size)
    }

    /// Rewinds the allocator to `new_count` records. Space past the new
    /// count is left in place but unreachable.
    pub fn truncate(&mut self, new_count: u32) -> Result<()> {
        ensure!(
            new_count <= self.record_count,
            "invalid truncate to {} (count={})",
            new_count,
            self.record_count
        );
        self.record_count = new_count;
        Ok(())
    }

    /// Persists the cached count. Readers observe records only after this.
    pub fn sync(&self, file: &mut MemoryMap) -> Result<()> {
        Serializer::new(file.slice_mut(self.offset, 4)?).write_u32(self.record_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::mapped_file;

    #[test]
    fn indices_are_dense_and_monotonic() {
        let (_dir, mut file) = mapped_file();
        let mut allocator = RecordAllocator::initialize_new(&mut file, 0, 16).unwrap();

        for expected in 0..100 {
            let index = allocator.allocate(&mut file).unwrap();
            assert_eq!(index, expected);
        }
        assert_eq!(allocator.count(), 100);

        for index in 0..100 {
            allocator.get(&file, index).unwrap();
        }
        assert!(allocator.get(&file, 100).is_err());
    }

    #[test]
    fn records_are_visible_after_sync_and_reopen() {
        let (_dir, mut file) = mapped_file();
        let mut allocator = RecordAllocator::initialize_new(&mut file, 8, 4).unwrap();

        let index = allocator.allocate(&mut file).unwrap();
        allocator
            .get_mut(&mut file, index)
            .unwrap()
            .copy_from_slice(b"abcd");
        allocator.sync(&mut file).unwrap();

        let reopened = RecordAllocator::start(&file, 8, 4).unwrap();
        assert_eq!(reopened.count(), 1);
        assert_eq!(reopened.get(&file, 0).unwrap(), b"abcd");
    }

    #[test]
    fn unsynced_records_are_not_visible_to_reopen() {
        let (_dir, mut file) = mapped_file();
        let mut allocator = RecordAllocator::initialize_new(&mut file, 0, 4).unwrap();

        allocator.allocate(&mut file).unwrap();

        let reopened = RecordAllocator::start(&file, 0, 4).unwrap();
        assert_eq!(reopened.count(), 0);
    }

    #[test]
    fn start_rejects_impossible_count() {
        let (_dir, mut file) = mapped_file();
        let allocator = RecordAllocator::initialize_new(&mut file, 0, 32).unwrap();
        drop(allocator);

        Serializer::new(file.slice_mut(0, 4).unwrap())
            .write_u32(1_000_000)
            .unwrap();
        assert!(RecordAllocator::start(&file, 0, 32).is_err());
    }

    #[test]
    fn truncate_rewinds_and_resyncs() {
        let (_dir, mut file) = mapped_file();
        let mut allocator = RecordAllocator::initialize_new(&mut file, 0, 4).unwrap();

        for _ in 0..5 {
            allocator.allocate(&mut file).unwrap();
        }
        allocator.truncate(2).unwrap();
        allocator.sync(&mut file).unwrap();

        let reopened = RecordAllocator::start(&file, 0, 4).unwrap();
        assert_eq!(reopened.count(), 2);
        assert!(allocator.truncate(3).is_err());
    }
}
