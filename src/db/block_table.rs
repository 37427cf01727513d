//! Block table: header rows and the hash -> height index.
//!
//! Two files:
//!
//! - `blocks_lookup`: a record hash table mapping the block-header hash
//!   to its 4-byte height.
//! - `blocks_rows`: a record allocator of 8-byte row positions indexed
//!   by height over a reserved slot region, followed by a slab region
//!   holding the variable-size rows
//!   `[header:80][tx_count:4][tx_hash:32 * tx_count]`.
//!
//! Block rows vary with the transaction count, so the height index holds
//! fixed-width positions and the bodies live in slabs at a fixed base
//! past the reservation. `sync` writes the height-index count last; that
//! 4-byte store is the whole database's commit point.

use std::path::Path;

use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, Txid};
use eyre::{bail, ensure, eyre, Result, WrapErr};

use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;
use crate::table::{RecordAllocator, RecordHashTable, SlabAllocator};

/// Heights reservable in the index region before the slab base.
pub const BLOCK_INDEX_RESERVE: u32 = 1_000_000;

const HEADER_SIZE: usize = 80;
const HASH_SIZE: usize = 32;

/// Slab region base: the index count header plus the full reservation.
const SLAB_BASE: u64 = 4 + 8 * BLOCK_INDEX_RESERVE as u64;

/// One decoded block row.
#[derive(Debug, Clone)]
pub struct BlockRow {
    pub height: u32,
    pub header: bitcoin::block::Header,
    pub tx_hashes: Vec<Txid>,
}

#[derive(Debug)]
pub struct BlockTable {
    lookup_file: MemoryMap,
    rows_file: MemoryMap,
    map: RecordHashTable,
    index: RecordAllocator,
    rows: SlabAllocator,
}

impl BlockTable {
    pub fn create(
        lookup_path: &Path,
        rows_path: &Path,
        bucket_count: u32,
    ) -> Result<Self> {
        let mut lookup_file = MemoryMap::open(lookup_path)?;
        let mut rows_file = MemoryMap::open(rows_path)?;

        let map = RecordHashTable::initialize_new(
            &mut lookup_file,
            0,
            bucket_count,
            HASH_SIZE,
            4,
        )?;
        let index = RecordAllocator::initialize_new(&mut rows_file, 0, 8)?;
        let rows = SlabAllocator::initialize_new(&mut rows_file, SLAB_BASE)?;

        Ok(Self {
            lookup_file,
            rows_file,
            map,
            index,
            rows,
        })
    }

    pub fn open(lookup_path: &Path, rows_path: &Path) -> Result<Self> {
        let lookup_file = MemoryMap::open(lookup_path)?;
        let rows_file = MemoryMap::open(rows_path)?;

        let map = RecordHashTable::start(&lookup_file, 0, HASH_SIZE, 4)
            .wrap_err("corrupt block lookup table")?;
        let index = RecordAllocator::start(&rows_file, 0, 8)
            .wrap_err("corrupt block height index")?;
        let rows =
            SlabAllocator::start(&rows_file, SLAB_BASE).wrap_err("corrupt block rows")?;

        Ok(Self {
            lookup_file,
            rows_file,
            map,
            index,
            rows,
        })
    }

    /// Height of the top block, or `None` on a virgin chain.
    pub fn last_height(&self) -> Option<u32> {
        self.index.count().checked_sub(1)
    }

    /// Appends a block at the next height and indexes its hash. Nothing
    /// is committed until `sync`.
    pub fn store(&mut self, block: &Block) -> Result<u32> {
        let height = self.index.count();
        ensure!(
            height < BLOCK_INDEX_RESERVE,
            "block height {} exceeds index reservation",
            height
        );

        let tx_count = block.txdata.len();
        let row_size = HEADER_SIZE + 4 + tx_count * HASH_SIZE;
        let position = self.rows.allocate(&mut self.rows_file, row_size)?;
        {
            let row = self.rows.get_mut(&mut self.rows_file, position, row_size)?;
            let mut serial = Serializer::new(row);
            serial.write_bytes(&consensus::serialize(&block.header))?;
            serial.write_u32(tx_count as u32)?;
            for tx in &block.txdata {
                serial.write_bytes(&tx.compute_txid().to_byte_array())?;
            }
        }

        let record = self.index.allocate(&mut self.rows_file)?;
        debug_assert_eq!(record, height);
        Serializer::new(self.index.get_mut(&mut self.rows_file, record)?)
            .write_u64(position)?;

        let hash = block.block_hash().to_byte_array();
        self.map.store(&mut self.lookup_file, &hash, |value| {
            value.copy_from_slice(&height.to_le_bytes())
        })?;

        Ok(height)
    }

    pub fn get_by_height(&self, height: u32) -> Result<Option<BlockRow>> {
        if height >= self.index.count() {
            return Ok(None);
        }

        let record = self.index.get(&self.rows_file, height)?;
        let position = Deserializer::new(record).read_u64()?;
        self.read_row(height, position).map(Some)
    }

    pub fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockRow>> {
        let Some(value) = self.map.get(&self.lookup_file, &hash.to_byte_array())? else {
            return Ok(None);
        };
        let height = Deserializer::new(value).read_u32()?;
        // An unlinked-but-stale entry or a crash between syncs can leave
        // the hash pointing past the committed top; that is a miss.
        self.get_by_height(height)
    }

    fn read_row(&self, height: u32, position: u64) -> Result<BlockRow> {
        let fixed = self
            .rows
            .get(&self.rows_file, position, HEADER_SIZE + 4)
            .wrap_err("corrupt block row")?;
        let header: bitcoin::block::Header = consensus::deserialize(&fixed[..HEADER_SIZE])
            .map_err(|e| eyre!("corrupt block header at height {}: {}", height, e))?;
        let tx_count = Deserializer::new(&fixed[HEADER_SIZE..]).read_u32()? as usize;

        let hashes_position = position + (HEADER_SIZE + 4) as u64;
        let hashes = self
            .rows
            .get(&self.rows_file, hashes_position, tx_count * HASH_SIZE)
            .wrap_err("corrupt block row: transaction hashes truncated")?;

        let mut tx_hashes = Vec::with_capacity(tx_count);
        for chunk in hashes.chunks_exact(HASH_SIZE) {
            tx_hashes.push(Txid::from_byte_array(chunk.try_into().expect("32-byte chunk")));
        }

        Ok(BlockRow {
            height,
            header,
            tx_hashes,
        })
    }

    /// Drops every block at or above `from_height`: their hash entries
    /// are unlinked and the height index rewinds. Row slabs stay behind,
    /// unreachable.
    pub fn unlink(&mut self, from_height: u32) -> Result<()> {
        let count = self.index.count();
        ensure!(
            from_height < count,
            "invalid unlink from height {} (top {})",
            from_height,
            count
        );

        for height in from_height..count {
            let Some(row) = self.get_by_height(height)? else {
                bail!("corrupt block table: missing row at height {}", height);
            };
            let hash = row.header.block_hash().to_byte_array();
            ensure!(
                self.map.unlink(&mut self.lookup_file, &hash)?,
                "corrupt block table: height {} absent from lookup",
                height
            );
        }

        self.index.truncate(from_height)
    }

    /// Commits: slabs and the hash map first, the height-index count
    /// last. The count store is the commit point for the whole database.
    pub fn sync(&mut self) -> Result<()> {
        self.rows.sync(&mut self.rows_file)?;
        self.map.sync(&mut self.lookup_file)?;
        self.index.sync(&mut self.rows_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::constants::genesis_block;
    use bitcoin::Network;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    fn table() -> (TempDir, BlockTable) {
        let dir = tempdir().unwrap();
        let lookup = dir.path().join("blocks_lookup");
        let rows = dir.path().join("blocks_rows");
        for path in [&lookup, &rows] {
            std::fs::File::create(path).unwrap().write_all(b"H").unwrap();
        }
        let table = BlockTable::create(&lookup, &rows, 17).unwrap();
        (dir, table)
    }

    #[test]
    fn store_and_get_round_trip() {
        let (_dir, mut table) = table();
        let genesis = genesis_block(Network::Bitcoin);

        assert_eq!(table.last_height(), None);
        let height = table.store(&genesis).unwrap();
        assert_eq!(height, 0);
        table.sync().unwrap();

        assert_eq!(table.last_height(), Some(0));

        let row = table.get_by_height(0).unwrap().unwrap();
        assert_eq!(row.header, genesis.header);
        assert_eq!(row.tx_hashes, vec![genesis.txdata[0].compute_txid()]);

        let by_hash = table.get_by_hash(&genesis.block_hash()).unwrap().unwrap();
        assert_eq!(by_hash.height, 0);
        assert!(table.get_by_height(1).unwrap().is_none());
    }

    #[test]
    fn unlink_removes_hash_and_rewinds_height() {
        let (_dir, mut table) = table();
        let genesis = genesis_block(Network::Bitcoin);
        table.store(&genesis).unwrap();
        table.sync().unwrap();

        table.unlink(0).unwrap();
        table.sync().unwrap();

        assert_eq!(table.last_height(), None);
        assert!(table.get_by_hash(&genesis.block_hash()).unwrap().is_none());
        assert!(table.unlink(0).is_err());
    }

    #[test]
    fn reopen_sees_only_synced_blocks() {
        let dir = tempdir().unwrap();
        let lookup = dir.path().join("blocks_lookup");
        let rows = dir.path().join("blocks_rows");
        for path in [&lookup, &rows] {
            std::fs::File::create(path).unwrap().write_all(b"H").unwrap();
        }
        let genesis = genesis_block(Network::Bitcoin);

        {
            let mut table = BlockTable::create(&lookup, &rows, 17).unwrap();
            table.store(&genesis).unwrap();
            // No sync: the store must not be visible after reopen.
        }
        let table = BlockTable::open(&lookup, &rows).unwrap();
        assert_eq!(table.last_height(), None);
        assert!(table.get_by_hash(&genesis.block_hash()).unwrap().is_none());
    }
}
