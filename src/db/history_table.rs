//! History table: per-address output and spend rows.
//!
//! A record multimap keyed by the 20-byte address hash. Each row is a
//! fixed 49-byte payload:
//!
//! ```text
//! [kind:1][point:36][height:4][value_or_checksum:8]
//! ```
//!
//! Output rows carry the output's satoshi value; spend rows carry an
//! 8-byte checksum of the outpoint they consumed, enough for a wallet to
//! pair the spend with its funding row. Rows come back newest-first;
//! rollback removes them in exact reverse of addition.

use std::path::Path;

use bitcoin::OutPoint;
use eyre::{bail, Result, WrapErr};

use crate::db::spend_table::{decode_point, encode_point, POINT_SIZE};
use crate::serial::{Deserializer, Serializer};
use crate::storage::MemoryMap;
use crate::table::RecordMultimap;

pub const ADDRESS_HASH_SIZE: usize = 20;
pub const HISTORY_ROW_SIZE: usize = 1 + POINT_SIZE + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    Output = 0,
    Spend = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub kind: PointKind,
    pub point: OutPoint,
    pub height: u32,
    /// Satoshi value for outputs, previous-outpoint checksum for spends.
    pub value: u64,
}

/// Folds an outpoint into the 8-byte value slot of a spend row.
pub fn spend_checksum(point: &OutPoint) -> u64 {
    let bytes = encode_point(point);
    u64::from_le_bytes(bytes[..8].try_into().expect("8-byte fold")) ^ point.vout as u64
}

#[derive(Debug)]
pub struct HistoryTable {
    lookup_file: MemoryMap,
    rows_file: MemoryMap,
    multimap: RecordMultimap,
}

impl HistoryTable {
    pub fn create(lookup_path: &Path, rows_path: &Path, bucket_count: u32) -> Result<Self> {
        let mut lookup_file = MemoryMap::open(lookup_path)?;
        let mut rows_file = MemoryMap::open(rows_path)?;
        let multimap = RecordMultimap::initialize_new(
            &mut lookup_file,
            &mut rows_file,
            bucket_count,
            ADDRESS_HASH_SIZE,
            HISTORY_ROW_SIZE,
        )?;
        Ok(Self {
            lookup_file,
            rows_file,
            multimap,
        })
    }

    pub fn open(lookup_path: &Path, rows_path: &Path) -> Result<Self> {
        let lookup_file = MemoryMap::open(lookup_path)?;
        let rows_file = MemoryMap::open(rows_path)?;
        let multimap = RecordMultimap::start(
            &lookup_file,
            &rows_file,
            ADDRESS_HASH_SIZE,
            HISTORY_ROW_SIZE,
        )
        .wrap_err("corrupt history table")?;
        Ok(Self {
            lookup_file,
            rows_file,
            multimap,
        })
    }

    fn add(
        &mut self,
        address: &[u8; ADDRESS_HASH_SIZE],
        kind: PointKind,
        point: &OutPoint,
        height: u32,
        value: u64,
    ) -> Result<()> {
        self.multimap
            .add(&mut self.lookup_file, &mut self.rows_file, address, |row| {
                let mut serial = Serializer::new(row);
                serial.write_u8(kind as u8).expect("sized row");
                serial.write_bytes(&encode_point(point)).expect("sized row");
                serial.write_u32(height).expect("sized row");
                serial.write_u64(value).expect("sized row");
            })
    }

    /// Records that `address` received `value` satoshis at `outpoint`.
    pub fn add_output(
        &mut self,
        address: &[u8; ADDRESS_HASH_SIZE],
        outpoint: &OutPoint,
        height: u32,
        value: u64,
    ) -> Result<()> {
        self.add(address, PointKind::Output, outpoint, height, value)
    }

    /// Records that `address` spent `previous` through `spend`.
    pub fn add_spend(
        &mut self,
        address: &[u8; ADDRESS_HASH_SIZE],
        previous: &OutPoint,
        spend: &OutPoint,
        height: u32,
    ) -> Result<()> {
        self.add(
            address,
            PointKind::Spend,
            spend,
            height,
            spend_checksum(previous),
        )
    }

    /// Removes the most recent row for `address`; rollback only.
    pub fn delete_last(&mut self, address: &[u8; ADDRESS_HASH_SIZE]) -> Result<()> {
        self.multimap
            .delete_last(&mut self.lookup_file, &self.rows_file, address)
    }

    /// All rows for `address`, newest first.
    pub fn fetch(&self, address: &[u8; ADDRESS_HASH_SIZE]) -> Result<Vec<HistoryRow>> {
        let mut rows = Vec::new();
        for payload in self
            .multimap
            .iter(&self.lookup_file, &self.rows_file, address)?
        {
            rows.push(decode_row(payload?)?);
        }
        Ok(rows)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.multimap
            .sync(&mut self.lookup_file, &mut self.rows_file)
    }
}

fn decode_row(payload: &[u8]) -> Result<HistoryRow> {
    let mut deserial = Deserializer::new(payload);
    let kind = match deserial.read_u8()? {
        0 => PointKind::Output,
        1 => PointKind::Spend,
        other => bail!("corrupt history row: kind {}", other),
    };
    let point = decode_point(deserial.read_bytes(POINT_SIZE)?)?;
    let height = deserial.read_u32()?;
    let value = deserial.read_u64()?;

    Ok(HistoryRow {
        kind,
        point,
        height,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;
    use tempfile::{tempdir, TempDir};

    fn table() -> (TempDir, HistoryTable) {
        let dir = tempdir().unwrap();
        let lookup = dir.path().join("history_lookup");
        let rows = dir.path().join("history_rows");
        std::fs::write(&lookup, b"H").unwrap();
        std::fs::write(&rows, b"H").unwrap();
        let table = HistoryTable::create(&lookup, &rows, 13).unwrap();
        (dir, table)
    }

    fn point(seed: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([seed; 32]),
            vout,
        }
    }

    #[test]
    fn outputs_and_spends_come_back_newest_first() {
        let (_dir, mut table) = table();
        let address = [7u8; 20];
        let funding = point(1, 0);
        let spend = point(2, 0);

        table.add_output(&address, &funding, 100, 5_000).unwrap();
        table.add_spend(&address, &funding, &spend, 101).unwrap();
        table.sync().unwrap();

        let rows = table.fetch(&address).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, PointKind::Spend);
        assert_eq!(rows[0].point, spend);
        assert_eq!(rows[0].value, spend_checksum(&funding));
        assert_eq!(rows[1].kind, PointKind::Output);
        assert_eq!(rows[1].point, funding);
        assert_eq!(rows[1].height, 100);
        assert_eq!(rows[1].value, 5_000);
    }

    #[test]
    fn delete_last_undoes_in_reverse_order() {
        let (_dir, mut table) = table();
        let address = [9u8; 20];
        let funding = point(1, 0);

        table.add_output(&address, &funding, 0, 100).unwrap();
        table
            .add_spend(&address, &funding, &point(2, 0), 1)
            .unwrap();

        table.delete_last(&address).unwrap();
        let rows = table.fetch(&address).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, PointKind::Output);

        table.delete_last(&address).unwrap();
        assert!(table.fetch(&address).unwrap().is_empty());
    }

    #[test]
    fn unknown_address_has_no_rows() {
        let (_dir, table) = table();
        assert!(table.fetch(&[0u8; 20]).unwrap().is_empty());
    }
}
