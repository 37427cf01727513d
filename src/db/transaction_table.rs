//! Transaction table: tx hash -> location and serialized body.
//!
//! One file holding a slab hash table keyed by the 32-byte transaction
//! hash. The slab value is `[block_height:4][index_in_block:4]` followed
//! by the consensus-serialized transaction; the serialization carries its
//! own length, so none is stored.

use std::path::Path;

use bitcoin::consensus;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::{Transaction, Txid};
use eyre::{eyre, Result, WrapErr};

use crate::serial::Deserializer;
use crate::storage::MemoryMap;
use crate::table::SlabHashTable;

const HASH_SIZE: usize = 32;

#[derive(Debug, Clone)]
pub struct TxEntry {
    pub height: u32,
    pub index: u32,
    pub transaction: Transaction,
}

#[derive(Debug)]
pub struct TransactionTable {
    file: MemoryMap,
    map: SlabHashTable,
}

impl TransactionTable {
    pub fn create(path: &Path, bucket_count: u32) -> Result<Self> {
        let mut file = MemoryMap::open(path)?;
        let map = SlabHashTable::initialize_new(&mut file, 0, bucket_count, HASH_SIZE)?;
        Ok(Self { file, map })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = MemoryMap::open(path)?;
        let map =
            SlabHashTable::start(&file, 0, HASH_SIZE).wrap_err("corrupt transaction table")?;
        Ok(Self { file, map })
    }

    pub fn store(&mut self, height: u32, index: u32, transaction: &Transaction) -> Result<()> {
        let key = transaction.compute_txid().to_byte_array();
        let value_size = 8 + transaction.total_size();

        self.map
            .store(&mut self.file, &key, value_size, |slab| {
                let (location, mut body) = slab.split_at_mut(8);
                location[..4].copy_from_slice(&height.to_le_bytes());
                location[4..].copy_from_slice(&index.to_le_bytes());
                transaction
                    .consensus_encode(&mut body)
                    .expect("slab sized from total_size");
                debug_assert!(body.is_empty());
            })?;

        Ok(())
    }

    pub fn get(&self, hash: &Txid) -> Result<Option<TxEntry>> {
        let Some(position) = self.map.get(&self.file, &hash.to_byte_array())? else {
            return Ok(None);
        };

        let bytes = self.map.value_to_end(&self.file, position)?;
        let mut location = Deserializer::new(&bytes[..8]);
        let height = location.read_u32()?;
        let index = location.read_u32()?;

        let (transaction, _) = consensus::deserialize_partial::<Transaction>(&bytes[8..])
            .map_err(|e| eyre!("corrupt transaction {}: {}", hash, e))?;

        Ok(Some(TxEntry {
            height,
            index,
            transaction,
        }))
    }

    pub fn remove(&mut self, hash: &Txid) -> Result<bool> {
        self.map.unlink(&mut self.file, &hash.to_byte_array())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.map.sync(&mut self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::constants::genesis_block;
    use bitcoin::Network;
    use tempfile::tempdir;

    #[test]
    fn store_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txs");
        std::fs::write(&path, b"H").unwrap();

        let mut table = TransactionTable::create(&path, 11).unwrap();
        let coinbase = &genesis_block(Network::Bitcoin).txdata[0];
        let hash = coinbase.compute_txid();

        table.store(0, 0, coinbase).unwrap();
        table.sync().unwrap();

        let entry = table.get(&hash).unwrap().unwrap();
        assert_eq!(entry.height, 0);
        assert_eq!(entry.index, 0);
        assert_eq!(&entry.transaction, coinbase);

        assert!(table.remove(&hash).unwrap());
        assert!(table.get(&hash).unwrap().is_none());
    }

    #[test]
    fn reopen_after_sync_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txs");
        std::fs::write(&path, b"H").unwrap();

        let coinbase = genesis_block(Network::Bitcoin).txdata[0].clone();
        {
            let mut table = TransactionTable::create(&path, 3).unwrap();
            table.store(5, 1, &coinbase).unwrap();
            table.sync().unwrap();
        }

        let table = TransactionTable::open(&path).unwrap();
        let entry = table.get(&coinbase.compute_txid()).unwrap().unwrap();
        assert_eq!(entry.height, 5);
        assert_eq!(entry.index, 1);
    }
}
