//! Key -> many-rows multimap over two files.
//!
//! A record hash table (key -> head index, in the lookup file) layered
//! over linked records (the rows file). `add` pushes a new row at the
//! head of the key's chain; `delete_last` rewinds the head by one.
//! Because record space is never reclaimed, `delete_last` calls must
//! mirror the `add` calls of a block in exact reverse order, which is
//! precisely how the database rollback path drives it.

use eyre::{bail, ensure, Result};

use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;
use crate::table::{ChainIter, LinkedRecords, RecordHashTable, EMPTY_RECORD};

#[derive(Debug)]
pub struct RecordMultimap {
    map: RecordHashTable,
    rows: LinkedRecords,
}

impl RecordMultimap {
    pub fn initialize_new(
        lookup_file: &mut MemoryMap,
        rows_file: &mut MemoryMap,
        bucket_count: u32,
        key_size: usize,
        payload_size: usize,
    ) -> Result<Self> {
        let map = RecordHashTable::initialize_new(lookup_file, 0, bucket_count, key_size, 4)?;
        let rows = LinkedRecords::initialize_new(rows_file, 0, payload_size)?;
        Ok(Self { map, rows })
    }

    pub fn start(
        lookup_file: &MemoryMap,
        rows_file: &MemoryMap,
        key_size: usize,
        payload_size: usize,
    ) -> Result<Self> {
        let map = RecordHashTable::start(lookup_file, 0, key_size, 4)?;
        let rows = LinkedRecords::start(rows_file, 0, payload_size)?;
        Ok(Self { map, rows })
    }

    pub fn payload_size(&self) -> usize {
        self.rows.payload_size()
    }

    /// Head node of the chain for `key`, if any rows exist.
    pub fn lookup(&self, lookup_file: &MemoryMap, key: &[u8]) -> Result<Option<u32>> {
        let Some(value) = self.map.get(lookup_file, key)? else {
            return Ok(None);
        };
        let head = Deserializer::new(value).read_u32()?;
        ensure!(head != EMPTY_RECORD, "corrupt multimap: empty chain head");
        Ok(Some(head))
    }

    /// Prepends a row to the chain for `key`.
    pub fn add(
        &mut self,
        lookup_file: &mut MemoryMap,
        rows_file: &mut MemoryMap,
        key: &[u8],
        write: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        let head = self.lookup(lookup_file, key)?;
        let node = self
            .rows
            .create(rows_file, head.unwrap_or(EMPTY_RECORD), write)?;

        let write_head = |value: &mut [u8]| {
            Serializer::new(value)
                .write_u32(node)
                .expect("head value is 4 bytes");
        };
        match head {
            // The aligned 4-byte head update is the publish point either way.
            Some(_) => {
                self.map.update(lookup_file, key, write_head)?;
            }
            None => {
                self.map.store(lookup_file, key, write_head)?;
            }
        }

        Ok(())
    }

    /// Removes the most recently added row for `key`. Rows must be
    /// deleted in exact reverse order of addition; the freed node is
    /// simply abandoned.
    pub fn delete_last(
        &mut self,
        lookup_file: &mut MemoryMap,
        rows_file: &MemoryMap,
        key: &[u8],
    ) -> Result<()> {
        let Some(head) = self.lookup(lookup_file, key)? else {
            bail!("corrupt multimap: delete from missing chain");
        };

        let next = self.rows.next(rows_file, head)?;
        if next == EMPTY_RECORD {
            self.map.unlink(lookup_file, key)?;
        } else {
            self.map.update(lookup_file, key, |value| {
                Serializer::new(value)
                    .write_u32(next)
                    .expect("head value is 4 bytes");
            })?;
        }

        Ok(())
    }

    /// Rows for `key` in insertion-reverse order.
    pub fn iter<'a>(
        &'a self,
        lookup_file: &MemoryMap,
        rows_file: &'a MemoryMap,
        key: &[u8],
    ) -> Result<ChainIter<'a>> {
        let head = self.lookup(lookup_file, key)?.unwrap_or(EMPTY_RECORD);
        Ok(self.rows.iter(rows_file, head))
    }

    /// Persists both allocators: rows first, then the lookup side.
    pub fn sync(&self, lookup_file: &mut MemoryMap, rows_file: &mut MemoryMap) -> Result<()> {
        self.rows.sync(rows_file)?;
        self.map.sync(lookup_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::mapped_file;

    const KEY_A: &[u8; 4] = b"aaaa";
    const KEY_B: &[u8; 4] = b"bbbb";

    fn rows_of(multimap: &RecordMultimap, lookup: &MemoryMap, rows: &MemoryMap, key: &[u8]) -> Vec<u8> {
        multimap
            .iter(lookup, rows, key)
            .unwrap()
            .map(|payload| payload.unwrap()[0])
            .collect()
    }

    #[test]
    fn rows_come_back_in_insertion_reverse_order() {
        let (_dir_a, mut lookup) = mapped_file();
        let (_dir_b, mut rows) = mapped_file();
        let mut multimap =
            RecordMultimap::initialize_new(&mut lookup, &mut rows, 4, 4, 1).unwrap();

        for i in 1..=3u8 {
            multimap
                .add(&mut lookup, &mut rows, KEY_A, |payload| payload[0] = i)
                .unwrap();
        }
        multimap
            .add(&mut lookup, &mut rows, KEY_B, |payload| payload[0] = 9)
            .unwrap();

        assert_eq!(rows_of(&multimap, &lookup, &rows, KEY_A), vec![3, 2, 1]);
        assert_eq!(rows_of(&multimap, &lookup, &rows, KEY_B), vec![9]);
    }

    #[test]
    fn delete_last_rewinds_one_row_at_a_time() {
        let (_dir_a, mut lookup) = mapped_file();
        let (_dir_b, mut rows) = mapped_file();
        let mut multimap =
            RecordMultimap::initialize_new(&mut lookup, &mut rows, 4, 4, 1).unwrap();

        for i in 1..=3u8 {
            multimap
                .add(&mut lookup, &mut rows, KEY_A, |payload| payload[0] = i)
                .unwrap();
        }

        multimap.delete_last(&mut lookup, &rows, KEY_A).unwrap();
        assert_eq!(rows_of(&multimap, &lookup, &rows, KEY_A), vec![2, 1]);

        multimap.delete_last(&mut lookup, &rows, KEY_A).unwrap();
        multimap.delete_last(&mut lookup, &rows, KEY_A).unwrap();
        assert!(multimap.lookup(&lookup, KEY_A).unwrap().is_none());
        assert!(multimap.delete_last(&mut lookup, &rows, KEY_A).is_err());
    }

    #[test]
    fn survives_reopen_after_sync() {
        let (_dir_a, mut lookup) = mapped_file();
        let (_dir_b, mut rows) = mapped_file();
        let mut multimap =
            RecordMultimap::initialize_new(&mut lookup, &mut rows, 4, 4, 1).unwrap();

        multimap
            .add(&mut lookup, &mut rows, KEY_A, |payload| payload[0] = 42)
            .unwrap();
        multimap.sync(&mut lookup, &mut rows).unwrap();

        let reopened = RecordMultimap::start(&lookup, &rows, 4, 1).unwrap();
        assert_eq!(rows_of(&reopened, &lookup, &rows, KEY_A), vec![42]);
    }
}
