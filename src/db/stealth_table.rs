//! Stealth table: prefix-scannable stealth payment metadata.
//!
//! A history shard whose 32-bit scan key is the stealth prefix recovered
//! from the ephemeral-key output, packed big-endian so the prefix's most
//! significant bits lead the scan key. The 84-byte row value is
//!
//! ```text
//! [ephemeral_key:32][address_hash:20][tx_hash:32]
//! ```
//!
//! Geometry lives in the `stealth_index` control file; the shard data is
//! `stealth_rows`. One entry is committed per block, empty or not, so
//! every height can serve as a scan start and as a rollback point.

use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use crate::shard::{HistoryShard, KeyPrefix, ShardSettings};
use crate::storage::MemoryMap;

pub const STEALTH_ROW_VALUE_SIZE: usize = 32 + 20 + 32;

fn stealth_settings() -> ShardSettings {
    ShardSettings {
        shard_max_entries: 1_000_000,
        total_key_size: 4,
        sharded_bitsize: 0,
        bucket_bitsize: 8,
        row_value_size: STEALTH_ROW_VALUE_SIZE,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealthRow {
    pub ephemeral_key: [u8; 32],
    pub address_hash: [u8; 20],
    pub tx_hash: [u8; 32],
}

impl StealthRow {
    fn encode(&self) -> [u8; STEALTH_ROW_VALUE_SIZE] {
        let mut bytes = [0u8; STEALTH_ROW_VALUE_SIZE];
        bytes[..32].copy_from_slice(&self.ephemeral_key);
        bytes[32..52].copy_from_slice(&self.address_hash);
        bytes[52..].copy_from_slice(&self.tx_hash);
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == STEALTH_ROW_VALUE_SIZE,
            "invalid stealth row: {} bytes",
            bytes.len()
        );
        Ok(Self {
            ephemeral_key: bytes[..32].try_into().expect("32-byte key"),
            address_hash: bytes[32..52].try_into().expect("20-byte hash"),
            tx_hash: bytes[52..].try_into().expect("32-byte hash"),
        })
    }
}

pub struct StealthTable {
    index_file: MemoryMap,
    rows_file: MemoryMap,
    shard: HistoryShard,
}

impl StealthTable {
    pub fn create(index_path: &Path, rows_path: &Path) -> Result<Self> {
        let mut index_file = MemoryMap::open(index_path)?;
        let mut rows_file = MemoryMap::open(rows_path)?;

        let settings = stealth_settings();
        settings.save(&mut index_file)?;
        let shard = HistoryShard::initialize_new(&mut rows_file, settings)?;

        Ok(Self {
            index_file,
            rows_file,
            shard,
        })
    }

    pub fn open(index_path: &Path, rows_path: &Path) -> Result<Self> {
        let index_file = MemoryMap::open(index_path)?;
        let rows_file = MemoryMap::open(rows_path)?;

        let settings =
            ShardSettings::load(&index_file).wrap_err("corrupt stealth settings")?;
        ensure!(
            settings == stealth_settings(),
            "corrupt stealth settings: unexpected geometry"
        );
        let shard =
            HistoryShard::start(&rows_file, settings).wrap_err("corrupt stealth rows")?;

        Ok(Self {
            index_file,
            rows_file,
            shard,
        })
    }

    /// Buffers one stealth row under its prefix; committed by `sync`.
    pub fn store(&mut self, prefix: u32, row: &StealthRow) -> Result<()> {
        self.shard.add(&prefix.to_be_bytes(), &row.encode())
    }

    /// Commits the block's rows as the entry for `height`.
    pub fn sync(&mut self, height: u32) -> Result<()> {
        self.shard.sync(&mut self.rows_file, height)
    }

    /// Rolls back every row for blocks at or above `height`. Height 0
    /// empties the shard outright.
    pub fn unlink(&mut self, height: u32) -> Result<()> {
        if height == 0 {
            return self.shard.reset(&mut self.rows_file);
        }
        self.shard.unlink(&mut self.rows_file, height)
    }

    /// All rows from `from_height` on whose prefix starts with `prefix`.
    pub fn scan(&self, prefix: &KeyPrefix, from_height: u32) -> Result<Vec<StealthRow>> {
        let mut rows = Vec::new();
        let mut decode_failure = None;
        self.shard
            .scan(&self.rows_file, prefix, from_height, |value| {
                match StealthRow::decode(value) {
                    Ok(row) => rows.push(row),
                    Err(error) => decode_failure = Some(error),
                }
            })?;
        match decode_failure {
            Some(error) => Err(error),
            None => Ok(rows),
        }
    }

    /// The persisted geometry, reread from the control file.
    pub fn settings(&self) -> Result<ShardSettings> {
        ShardSettings::load(&self.index_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn table() -> (TempDir, StealthTable) {
        let dir = tempdir().unwrap();
        let index = dir.path().join("stealth_index");
        let rows = dir.path().join("stealth_rows");
        std::fs::write(&index, b"H").unwrap();
        std::fs::write(&rows, b"H").unwrap();
        let table = StealthTable::create(&index, &rows).unwrap();
        (dir, table)
    }

    fn row(seed: u8) -> StealthRow {
        StealthRow {
            ephemeral_key: [seed; 32],
            address_hash: [seed.wrapping_add(1); 20],
            tx_hash: [seed.wrapping_add(2); 32],
        }
    }

    #[test]
    fn prefix_scan_finds_matching_rows() {
        let (_dir, mut table) = table();

        table.store(0xff00_0000, &row(1)).unwrap();
        table.store(0x0100_0000, &row(2)).unwrap();
        table.sync(0).unwrap();

        // Top byte 0xff.
        let prefix = KeyPrefix::new(&[0xff], 8).unwrap();
        assert_eq!(table.scan(&prefix, 0).unwrap(), vec![row(1)]);

        assert_eq!(
            table.scan(&KeyPrefix::empty(), 0).unwrap(),
            vec![row(2), row(1)]
        );
    }

    #[test]
    fn unlink_drops_rows_of_later_blocks() {
        let (_dir, mut table) = table();

        table.store(1, &row(1)).unwrap();
        table.sync(0).unwrap();
        table.store(2, &row(2)).unwrap();
        table.sync(1).unwrap();

        table.unlink(1).unwrap();
        assert_eq!(table.scan(&KeyPrefix::empty(), 0).unwrap(), vec![row(1)]);

        table.unlink(0).unwrap();
        assert!(table.scan(&KeyPrefix::empty(), 0).unwrap().is_empty());
    }

    #[test]
    fn reopen_validates_geometry() {
        let dir = tempdir().unwrap();
        let index = dir.path().join("stealth_index");
        let rows = dir.path().join("stealth_rows");
        std::fs::write(&index, b"H").unwrap();
        std::fs::write(&rows, b"H").unwrap();

        {
            let mut table = StealthTable::create(&index, &rows).unwrap();
            table.store(7, &row(3)).unwrap();
            table.sync(0).unwrap();
        }

        let table = StealthTable::open(&index, &rows).unwrap();
        assert_eq!(table.scan(&KeyPrefix::empty(), 0).unwrap(), vec![row(3)]);
    }
}
