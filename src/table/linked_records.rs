//! Singly-linked record chains on the record allocator.
//!
//! Each node is one record laid out as `[next:4][payload:P]`;
//! `next == u32::MAX` marks the end of a chain. Chains grow at the head,
//! so iteration yields payloads in insertion-reverse order.

use eyre::Result;

use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;
use crate::table::{RecordAllocator, EMPTY_RECORD};

#[derive(Debug)]
pub struct LinkedRecords {
    allocator: RecordAllocator,
}

impl LinkedRecords {
    pub fn initialize_new(file: &mut MemoryMap, offset: u64, payload_size: usize) -> Result<Self> {
        let allocator = RecordAllocator::initialize_new(file, offset, 4 + payload_size)?;
        Ok(Self { allocator })
    }

    pub fn start(file: &MemoryMap, offset: u64, payload_size: usize) -> Result<Self> {
        let allocator = RecordAllocator::start(file, offset, 4 + payload_size)?;
        Ok(Self { allocator })
    }

    pub fn payload_size(&self) -> usize {
        self.allocator.record_size() - 4
    }

    /// Allocates a node pointing at `head` and returns the new head. The
    /// payload is produced by `write`.
    pub fn create(
        &mut self,
        file: &mut MemoryMap,
        head: u32,
        write: impl FnOnce(&mut [u8]),
    ) -> Result<u32> {
        let node = self.allocator.allocate(file)?;
        let record = self.allocator.get_mut(file, node)?;
        Serializer::new(&mut record[..4]).write_u32(head)?;
        write(&mut record[4..]);
        Ok(node)
    }

    /// Nodes are bounded by the file, not the synced count, so chains
    /// written ahead of a crash-interrupted sync still read back.
    pub fn next(&self, file: &MemoryMap, node: u32) -> Result<u32> {
        Deserializer::new(&self.allocator.get_raw(file, node)?[..4]).read_u32()
    }

    pub fn payload<'a>(&self, file: &'a MemoryMap, node: u32) -> Result<&'a [u8]> {
        Ok(&self.allocator.get_raw(file, node)?[4..])
    }

    /// Lazy walk of a chain from `head`, yielding payload slices.
    pub fn iter<'a>(&'a self, file: &'a MemoryMap, head: u32) -> ChainIter<'a> {
        ChainIter {
            list: self,
            file,
            current: head,
        }
    }

    /// Persists the node count.
    pub fn sync(&self, file: &mut MemoryMap) -> Result<()> {
        self.allocator.sync(file)
    }
}

pub struct ChainIter<'a> {
    list: &'a LinkedRecords,
    file: &'a MemoryMap,
    current: u32,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == EMPTY_RECORD {
            return None;
        }
        let node = self.current;
        match self.list.next(self.file, node) {
            Ok(next) => self.current = next,
            Err(error) => {
                // Stop after surfacing a broken link.
                self.current = EMPTY_RECORD;
                return Some(Err(error));
            }
        }
        Some(self.list.payload(self.file, node))
    }
}
