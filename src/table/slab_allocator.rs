//! Append-only allocator of variable-size byte slabs.
//!
//! Layout at the caller-supplied offset: `[end_offset:8]` followed by the
//! slab bytes, which begin at `offset + 8`. `allocate(size)` reserves
//! `size` bytes at the current end and returns the *absolute* file offset
//! of the reservation. Deletion is unsupported.

use eyre::{bail, ensure, Result};

use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;

#[derive(Debug)]
pub struct SlabAllocator {
    offset: u64,
    end: u64,
}

impl SlabAllocator {
    /// Writes an empty-body header at `offset`.
    pub fn initialize_new(file: &mut MemoryMap, offset: u64) -> Result<Self> {
        file.reserve(offset + 8)?;

        let end = offset + 8;
        Serializer::new(file.slice_mut(offset, 8)?).write_u64(end)?;

        Ok(Self { offset, end })
    }

    /// Reads and caches `end_offset`, validating it against the file.
    pub fn start(file: &MemoryMap, offset: u64) -> Result<Self> {
        let Ok(header) = file.slice(offset, 8) else {
            bail!("corrupt slab allocator: header past end of file");
        };
        let end = Deserializer::new(header).read_u64()?;

        ensure!(
            end >= offset + 8 && end <= file.size(),
            "corrupt slab allocator: end offset {} outside [{}, {}]",
            end,
            offset + 8,
            file.size()
        );

        Ok(Self { offset, end })
    }

    /// Current logical end; the offset the next allocation will return.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Reserves `size` bytes and returns their absolute file offset. The
    /// end header is not touched until `sync`.
    pub fn allocate(&mut self, file: &mut MemoryMap, size: usize) -> Result<u64> {
        ensure!(size > 0, "invalid zero-sized slab allocation");

        let position = self.end;
        file.reserve(position + size as u64)?;
        self.end = position + size as u64;

        Ok(position)
    }

    fn check_range(&self, position: u64, len: usize) -> Result<()> {
        let end = position.checked_add(len as u64);
        ensure!(
            position >= self.offset + 8 && end.is_some_and(|end| end <= self.end),
            "slab range [{}, +{}) outside body [{}, {})",
            position,
            len,
            self.offset + 8,
            self.end
        );
        Ok(())
    }

    pub fn get<'a>(&self, file: &'a MemoryMap, position: u64, len: usize) -> Result<&'a [u8]> {
        self.check_range(position, len)?;
        file.slice(position, len)
    }

    pub fn get_mut<'a>(
        &self,
        file: &'a mut MemoryMap,
        position: u64,
        len: usize,
    ) -> Result<&'a mut [u8]> {
        self.check_range(position, len)?;
        file.slice_mut(position, len)
    }

    /// Persists the cached end offset; the batch commit for slab writes.
    pub fn sync(&self, file: &mut MemoryMap) -> Result<()> {
        Serializer::new(file.slice_mut(self.offset, 8)?).write_u64(self.end)
    }
}
