//! Fixed-count array of bucket heads stored at a file offset.
//!
//! Layout: `[bucket_count:4][entry * bucket_count]` where the entry is a
//! 32-bit record index or a 64-bit slab offset. The count is fixed at
//! creation and never changes over the lifetime of the file.

use std::marker::PhantomData;

use eyre::{ensure, Result, WrapErr};

use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;

/// A bucket head: a record index (`u32`) or a slab offset (`u64`).
pub trait BucketEntry: Copy + Eq {
    const WIDTH: usize;
    const EMPTY: Self;

    fn read(deserial: &mut Deserializer<'_>) -> Result<Self>;
    fn write(self, serial: &mut Serializer<'_>) -> Result<()>;
}

impl BucketEntry for u32 {
    const WIDTH: usize = 4;
    const EMPTY: Self = u32::MAX;

    fn read(deserial: &mut Deserializer<'_>) -> Result<Self> {
        deserial.read_u32()
    }

    fn write(self, serial: &mut Serializer<'_>) -> Result<()> {
        serial.write_u32(self)
    }
}

impl BucketEntry for u64 {
    const WIDTH: usize = 8;
    const EMPTY: Self = u64::MAX;

    fn read(deserial: &mut Deserializer<'_>) -> Result<Self> {
        deserial.read_u64()
    }

    fn write(self, serial: &mut Serializer<'_>) -> Result<()> {
        serial.write_u64(self)
    }
}

#[derive(Debug)]
pub struct BucketArray<E: BucketEntry> {
    offset: u64,
    bucket_count: u32,
    _entry: PhantomData<E>,
}

impl<E: BucketEntry> BucketArray<E> {
    /// Writes an empty bucket array at `offset`, growing the file as
    /// needed. Every bucket starts at the empty sentinel.
    pub fn initialize_new(file: &mut MemoryMap, offset: u64, bucket_count: u32) -> Result<Self> {
        ensure!(bucket_count > 0, "invalid bucket count 0");

        let region = 4 + bucket_count as u64 * E::WIDTH as u64;
        file.reserve(offset + region)?;

        let mut serial = Serializer::new(file.slice_mut(offset, region as usize)?);
        serial.write_u32(bucket_count)?;
        for _ in 0..bucket_count {
            E::EMPTY.write(&mut serial)?;
        }

        Ok(Self {
            offset,
            bucket_count,
            _entry: PhantomData,
        })
    }

    /// Reads and validates the header written by a previous
    /// `initialize_new`.
    pub fn start(file: &MemoryMap, offset: u64) -> Result<Self> {
        let header = file
            .slice(offset, 4)
            .wrap_err("corrupt bucket array: header past end of file")?;
        let bucket_count = Deserializer::new(header).read_u32()?;
        ensure!(bucket_count > 0, "corrupt bucket array: zero buckets");

        let region = 4 + bucket_count as u64 * E::WIDTH as u64;
        ensure!(
            offset + region <= file.size(),
            "corrupt bucket array: {} buckets do not fit in file",
            bucket_count
        );

        Ok(Self {
            offset,
            bucket_count,
            _entry: PhantomData,
        })
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// First byte past the bucket region; the conventional home of the
    /// allocator sharing the file.
    pub fn end_offset(&self) -> u64 {
        self.offset + 4 + self.bucket_count as u64 * E::WIDTH as u64
    }

    fn entry_offset(&self, index: u32) -> Result<u64> {
        ensure!(
            index < self.bucket_count,
            "bucket {} out of bounds (bucket_count={})",
            index,
            self.bucket_count
        );
        Ok(self.offset + 4 + index as u64 * E::WIDTH as u64)
    }

    pub fn get(&self, file: &MemoryMap, index: u32) -> Result<E> {
        let offset = self.entry_offset(index)?;
        E::read(&mut Deserializer::new(file.slice(offset, E::WIDTH)?))
    }

    /// Overwrites one bucket head. This naturally aligned store is the
    /// commit point of the hash tables built on top.
    pub fn put(&self, file: &mut MemoryMap, index: u32, value: E) -> Result<()> {
        let offset = self.entry_offset(index)?;
        value.write(&mut Serializer::new(file.slice_mut(offset, E::WIDTH)?))
    }
}
