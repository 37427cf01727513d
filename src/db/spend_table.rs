//! Spend table: which input spent which output.
//!
//! One file holding a slab hash table keyed by the spent outpoint
//! (`[tx_hash:32][index:4]`), whose 36-byte value is the spending
//! inpoint in the same encoding.

use std::path::Path;

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};
use eyre::{Result, WrapErr};

use crate::storage::MemoryMap;
use crate::table::SlabHashTable;

pub const POINT_SIZE: usize = 36;

/// `[tx_hash:32][index:4]`, little-endian index.
pub fn encode_point(point: &OutPoint) -> [u8; POINT_SIZE] {
    let mut bytes = [0u8; POINT_SIZE];
    bytes[..32].copy_from_slice(&point.txid.to_byte_array());
    bytes[32..].copy_from_slice(&point.vout.to_le_bytes());
    bytes
}

pub fn decode_point(bytes: &[u8]) -> Result<OutPoint> {
    eyre::ensure!(
        bytes.len() == POINT_SIZE,
        "invalid point encoding: {} bytes",
        bytes.len()
    );
    Ok(OutPoint {
        txid: Txid::from_byte_array(bytes[..32].try_into().expect("32-byte hash")),
        vout: u32::from_le_bytes(bytes[32..].try_into().expect("4-byte index")),
    })
}

#[derive(Debug)]
pub struct SpendTable {
    file: MemoryMap,
    map: SlabHashTable,
}

impl SpendTable {
    pub fn create(path: &Path, bucket_count: u32) -> Result<Self> {
        let mut file = MemoryMap::open(path)?;
        let map = SlabHashTable::initialize_new(&mut file, 0, bucket_count, POINT_SIZE)?;
        Ok(Self { file, map })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = MemoryMap::open(path)?;
        let map = SlabHashTable::start(&file, 0, POINT_SIZE).wrap_err("corrupt spend table")?;
        Ok(Self { file, map })
    }

    pub fn store(&mut self, outpoint: &OutPoint, spend: &OutPoint) -> Result<()> {
        let value = encode_point(spend);
        self.map
            .store(&mut self.file, &encode_point(outpoint), POINT_SIZE, |slab| {
                slab.copy_from_slice(&value)
            })?;
        Ok(())
    }

    /// The inpoint that spent `outpoint`, if recorded.
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<OutPoint>> {
        let Some(position) = self.map.get(&self.file, &encode_point(outpoint))? else {
            return Ok(None);
        };
        decode_point(self.map.value(&self.file, position, POINT_SIZE)?).map(Some)
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Result<bool> {
        self.map.unlink(&mut self.file, &encode_point(outpoint))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.map.sync(&mut self.file)
    }
}
