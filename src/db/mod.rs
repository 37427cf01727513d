//! # Database Façade
//!
//! Composes the block, transaction, spend, history and stealth tables
//! into one `push(block)` / `pop()` interface with crash-safe write
//! ordering.
//!
//! ## Ordering
//!
//! `push` writes every auxiliary table, syncs them, and syncs the block
//! table *last*. The block table's height-index count is therefore the
//! global commit point: a crash between the auxiliary syncs and the
//! block sync leaves the auxiliary tables ahead of the chain, and on the
//! next start the missing block is simply re-downloaded and re-pushed.
//! The duplicate stores that re-push produces are harmless: hash-keyed
//! tables shadow, and rollback unwinds shadowed entries first.
//!
//! `pop` reverses the same sequence exactly, which is also why the
//! history table's `delete_last` reverse-order constraint holds.

mod address;
mod block_table;
mod history_table;
mod seqlock;
mod spend_table;
mod stealth_table;
mod transaction_table;

pub use address::{
    extract_ephemeral_key, extract_stealth_prefix, input_address_hash, payment_address_hash,
};
pub use block_table::{BlockRow, BlockTable, BLOCK_INDEX_RESERVE};
pub use history_table::{
    spend_checksum, HistoryRow, HistoryTable, PointKind, ADDRESS_HASH_SIZE, HISTORY_ROW_SIZE,
};
pub use seqlock::{Sequence, WriteGuard};
pub use spend_table::{decode_point, encode_point, SpendTable, POINT_SIZE};
pub use stealth_table::{StealthRow, StealthTable, STEALTH_ROW_VALUE_SIZE};
pub use transaction_table::{TransactionTable, TxEntry};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bitcoin::hashes::Hash;
use bitcoin::{Block, OutPoint, TxIn, TxOut, Txid};
use eyre::{ensure, eyre, Result, WrapErr};
use tracing::{debug, info};

use crate::storage::DirectoryLock;

/// Default bucket counts, chosen per table's expected cardinality.
const BLOCK_BUCKETS: u32 = 100_003;
const SPEND_BUCKETS: u32 = 250_007;
const TX_BUCKETS: u32 = 1_000_003;
const HISTORY_BUCKETS: u32 = 250_007;

/// The file set of one database under a prefix directory.
#[derive(Debug, Clone)]
pub struct Store {
    pub blocks_lookup: PathBuf,
    pub blocks_rows: PathBuf,
    pub spends: PathBuf,
    pub transactions: PathBuf,
    pub history_lookup: PathBuf,
    pub history_rows: PathBuf,
    pub stealth_index: PathBuf,
    pub stealth_rows: PathBuf,
}

impl Store {
    pub fn new(prefix: &Path) -> Self {
        Self {
            blocks_lookup: prefix.join("blocks_lookup"),
            blocks_rows: prefix.join("blocks_rows"),
            spends: prefix.join("spends"),
            transactions: prefix.join("txs"),
            history_lookup: prefix.join("history_lookup"),
            history_rows: prefix.join("history_rows"),
            stealth_index: prefix.join("stealth_index"),
            stealth_rows: prefix.join("stealth_rows"),
        }
    }

    fn all_paths(&self) -> [&Path; 8] {
        [
            &self.blocks_lookup,
            &self.blocks_rows,
            &self.spends,
            &self.transactions,
            &self.history_lookup,
            &self.history_rows,
            &self.stealth_index,
            &self.stealth_rows,
        ]
    }

    /// Creates every file with a single sentinel byte so it can be
    /// mapped before its header exists.
    pub fn touch_all(&self) -> Result<()> {
        for path in self.all_paths() {
            let mut file = fs::File::create(path)
                .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
            file.write_all(b"H")
                .wrap_err_with(|| format!("failed to touch '{}'", path.display()))?;
        }
        Ok(())
    }
}

/// Heights at which optional indexes activate. History rows are only
/// written for blocks at or above `history`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveHeights {
    pub history: u32,
}

/// There are two duplicated coinbase transactions in the chain, from
/// before duplicates were disallowed; their re-occurrences are skipped.
fn is_special_duplicate(height: u32, index: usize) -> bool {
    (height == 91_842 || height == 91_880) && index == 0
}

fn next_height(last: Option<u32>) -> u32 {
    last.map_or(0, |height| height + 1)
}

pub struct Database {
    pub blocks: BlockTable,
    pub spends: SpendTable,
    pub transactions: TransactionTable,
    pub history: HistoryTable,
    pub stealth: StealthTable,
    sequence: Sequence,
    active_heights: ActiveHeights,
    _lock: DirectoryLock,
}

impl Database {
    /// Creates the file set under `prefix` (which must exist) and writes
    /// every component's empty header.
    pub fn initialize(prefix: &Path) -> Result<()> {
        let _lock = DirectoryLock::acquire(prefix)?;
        let store = Store::new(prefix);
        store.touch_all()?;

        BlockTable::create(&store.blocks_lookup, &store.blocks_rows, BLOCK_BUCKETS)?;
        SpendTable::create(&store.spends, SPEND_BUCKETS)?;
        TransactionTable::create(&store.transactions, TX_BUCKETS)?;
        HistoryTable::create(&store.history_lookup, &store.history_rows, HISTORY_BUCKETS)?;
        StealthTable::create(&store.stealth_index, &store.stealth_rows)?;

        info!(prefix = %prefix.display(), "initialized database");
        Ok(())
    }

    /// Opens an initialized database, taking the directory lock.
    pub fn open(prefix: &Path, active_heights: ActiveHeights) -> Result<Self> {
        let lock = DirectoryLock::acquire(prefix)?;
        let store = Store::new(prefix);

        let blocks = BlockTable::open(&store.blocks_lookup, &store.blocks_rows)?;
        let spends = SpendTable::open(&store.spends)?;
        let transactions = TransactionTable::open(&store.transactions)?;
        let history = HistoryTable::open(&store.history_lookup, &store.history_rows)?;
        let stealth = StealthTable::open(&store.stealth_index, &store.stealth_rows)?;

        info!(
            prefix = %prefix.display(),
            last_height = ?blocks.last_height(),
            "opened database"
        );

        Ok(Self {
            blocks,
            spends,
            transactions,
            history,
            stealth,
            sequence: Sequence::new(),
            active_heights,
            _lock: lock,
        })
    }

    /// The reader-side sequence lock for this instance.
    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    /// Appends `block` at the next height. Auxiliary tables sync first;
    /// the block table's sync is the commit.
    pub fn push(&mut self, block: &Block) -> Result<()> {
        let _write = self.sequence.write();
        let height = next_height(self.blocks.last_height());

        for (index, tx) in block.txdata.iter().enumerate() {
            if is_special_duplicate(height, index) {
                continue;
            }

            let tx_hash = tx.compute_txid();

            if !tx.is_coinbase() {
                Self::push_inputs(
                    &mut self.spends,
                    &mut self.history,
                    &self.active_heights,
                    &tx_hash,
                    height,
                    &tx.input,
                )?;
            }
            Self::push_outputs(&mut self.history, &self.active_heights, &tx_hash, height, &tx.output)?;
            Self::push_stealth(&mut self.stealth, &tx_hash, &tx.output)?;

            self.transactions.store(height, index as u32, tx)?;
        }

        let stored = self.blocks.store(block)?;
        debug_assert_eq!(stored, height);

        self.spends.sync()?;
        self.transactions.sync()?;
        self.history.sync()?;
        self.stealth.sync(height)?;

        // Block header last: a crash before this line leaves the chain
        // short one block and the auxiliaries ahead, which re-push heals.
        self.blocks.sync()?;

        debug!(height, transactions = block.txdata.len(), "pushed block");
        Ok(())
    }

    /// Removes and returns the top block, reversing `push` exactly.
    pub fn pop(&mut self) -> Result<Block> {
        let _write = self.sequence.write();

        let height = self
            .blocks
            .last_height()
            .ok_or_else(|| eyre!("corrupt database: pop on empty chain"))?;
        let row = self
            .blocks
            .get_by_height(height)?
            .ok_or_else(|| eyre!("corrupt database: missing row at height {}", height))?;

        let mut transactions = Vec::with_capacity(row.tx_hashes.len());
        for (index, tx_hash) in row.tx_hashes.iter().enumerate().rev() {
            let entry = self
                .transactions
                .get(tx_hash)?
                .ok_or_else(|| eyre!("corrupt database: missing transaction {}", tx_hash))?;
            ensure!(
                entry.height == height && entry.index == index as u32,
                "corrupt database: transaction {} at ({}, {}), expected ({}, {})",
                tx_hash,
                entry.height,
                entry.index,
                height,
                index
            );

            self.transactions.remove(tx_hash)?;
            Self::pop_outputs(&mut self.history, &self.active_heights, height, &entry.transaction.output)?;
            if !entry.transaction.is_coinbase() {
                Self::pop_inputs(
                    &mut self.spends,
                    &mut self.history,
                    &self.active_heights,
                    height,
                    &entry.transaction.input,
                )?;
            }

            transactions.push(entry.transaction);
        }
        transactions.reverse();

        self.stealth.unlink(height)?;
        self.blocks.unlink(height)?;

        // Same ordering as push so a crash after pop recovers identically.
        self.spends.sync()?;
        self.transactions.sync()?;
        self.history.sync()?;
        self.blocks.sync()?;

        debug!(height, transactions = transactions.len(), "popped block");
        Ok(Block {
            header: row.header,
            txdata: transactions,
        })
    }

    fn push_inputs(
        spends: &mut SpendTable,
        history: &mut HistoryTable,
        active_heights: &ActiveHeights,
        tx_hash: &Txid,
        height: u32,
        inputs: &[TxIn],
    ) -> Result<()> {
        for (index, input) in inputs.iter().enumerate() {
            let spend = OutPoint::new(*tx_hash, index as u32);
            spends.store(&input.previous_output, &spend)?;

            if height < active_heights.history {
                continue;
            }
            let Some(address) = input_address_hash(&input.script_sig) else {
                continue;
            };
            history.add_spend(&address, &input.previous_output, &spend, height)?;
        }
        Ok(())
    }

    fn push_outputs(
        history: &mut HistoryTable,
        active_heights: &ActiveHeights,
        tx_hash: &Txid,
        height: u32,
        outputs: &[TxOut],
    ) -> Result<()> {
        if height < active_heights.history {
            return Ok(());
        }
        for (index, output) in outputs.iter().enumerate() {
            let Some(address) = payment_address_hash(&output.script_pubkey) else {
                continue;
            };
            let outpoint = OutPoint::new(*tx_hash, index as u32);
            history.add_output(&address, &outpoint, height, output.value.to_sat())?;
        }
        Ok(())
    }

    /// An output pair is a stealth payment when the first output carries
    /// the ephemeral key and prefix and the next yields a payment
    /// address. The last output can never start a pair.
    fn push_stealth(stealth: &mut StealthTable, tx_hash: &Txid, outputs: &[TxOut]) -> Result<()> {
        for index in 0..outputs.len().saturating_sub(1) {
            let ephemeral_script = &outputs[index].script_pubkey;
            let payment_script = &outputs[index + 1].script_pubkey;

            let Some(ephemeral_key) = extract_ephemeral_key(ephemeral_script) else {
                continue;
            };
            let Some(prefix) = extract_stealth_prefix(ephemeral_script) else {
                continue;
            };
            let Some(address_hash) = payment_address_hash(payment_script) else {
                continue;
            };

            stealth.store(
                prefix,
                &StealthRow {
                    ephemeral_key,
                    address_hash,
                    tx_hash: tx_hash.to_byte_array(),
                },
            )?;
        }
        Ok(())
    }

    fn pop_inputs(
        spends: &mut SpendTable,
        history: &mut HistoryTable,
        active_heights: &ActiveHeights,
        height: u32,
        inputs: &[TxIn],
    ) -> Result<()> {
        for input in inputs.iter().rev() {
            ensure!(
                spends.remove(&input.previous_output)?,
                "corrupt database: spend of {} missing on rollback",
                input.previous_output
            );

            if height < active_heights.history {
                continue;
            }
            if let Some(address) = input_address_hash(&input.script_sig) {
                history.delete_last(&address)?;
            }
        }
        Ok(())
    }

    fn pop_outputs(
        history: &mut HistoryTable,
        active_heights: &ActiveHeights,
        height: u32,
        outputs: &[TxOut],
    ) -> Result<()> {
        if height < active_heights.history {
            return Ok(());
        }
        for output in outputs.iter().rev() {
            if let Some(address) = payment_address_hash(&output.script_pubkey) {
                history.delete_last(&address)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_height_starts_at_zero() {
        assert_eq!(next_height(None), 0);
        assert_eq!(next_height(Some(0)), 1);
        assert_eq!(next_height(Some(41)), 42);
    }

    #[test]
    fn only_the_two_historical_duplicates_are_special() {
        assert!(is_special_duplicate(91_842, 0));
        assert!(is_special_duplicate(91_880, 0));
        assert!(!is_special_duplicate(91_842, 1));
        assert!(!is_special_duplicate(91_881, 0));
        assert!(!is_special_duplicate(0, 0));
    }
}
