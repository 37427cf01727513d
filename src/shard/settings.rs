//! Shard geometry, fixed at creation and persisted in a control file.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::MemoryMap;

pub const SHARD_MAGIC: &[u8; 8] = b"coinshrd";
pub const SHARD_VERSION: u16 = 1;
pub const SHARD_SETTINGS_HEADER_SIZE: usize = 32;

/// Geometry of a history shard. `total_key_size` is the full key in
/// bytes; `sharded_bitsize` leading bits are consumed by an outer shard
/// selector and not stored in rows; the remaining `scan_bitsize` bits
/// form the scan key. `bucket_bitsize` top scan-key bits index each
/// entry's bucket array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSettings {
    pub shard_max_entries: u32,
    pub total_key_size: usize,
    pub sharded_bitsize: usize,
    pub bucket_bitsize: usize,
    pub row_value_size: usize,
}

impl ShardSettings {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.shard_max_entries > 0, "invalid shard: no entry slots");
        ensure!(
            self.total_key_size * 8 > self.sharded_bitsize,
            "invalid shard: sharded bits {} consume the whole {}-byte key",
            self.sharded_bitsize,
            self.total_key_size
        );
        ensure!(
            self.bucket_bitsize > 0 && self.bucket_bitsize <= 16,
            "invalid shard: bucket bitsize {} outside [1, 16]",
            self.bucket_bitsize
        );
        ensure!(
            self.bucket_bitsize <= self.scan_bitsize(),
            "invalid shard: bucket bitsize {} exceeds scan bitsize {}",
            self.bucket_bitsize,
            self.scan_bitsize()
        );
        ensure!(self.row_value_size > 0, "invalid shard: empty row value");
        Ok(())
    }

    pub fn scan_bitsize(&self) -> usize {
        self.total_key_size * 8 - self.sharded_bitsize
    }

    pub fn scan_size(&self) -> usize {
        self.scan_bitsize().div_ceil(8)
    }

    pub fn number_buckets(&self) -> usize {
        1 << self.bucket_bitsize
    }

    pub fn row_size(&self) -> usize {
        self.scan_size() + self.row_value_size
    }

    /// Saves the settings into a control file, replacing its contents.
    pub fn save(&self, file: &mut MemoryMap) -> Result<()> {
        self.validate()?;

        let header = ShardSettingsHeader {
            magic: *SHARD_MAGIC,
            version: U16::new(SHARD_VERSION),
            total_key_size: U16::new(self.total_key_size as u16),
            sharded_bitsize: U16::new(self.sharded_bitsize as u16),
            bucket_bitsize: U16::new(self.bucket_bitsize as u16),
            row_value_size: U32::new(self.row_value_size as u32),
            shard_max_entries: U32::new(self.shard_max_entries),
            reserved: [0u8; 8],
        };

        file.reserve(SHARD_SETTINGS_HEADER_SIZE as u64)?;
        file.slice_mut(0, SHARD_SETTINGS_HEADER_SIZE)?
            .copy_from_slice(header.as_bytes());
        Ok(())
    }

    /// Loads and validates settings from a control file.
    pub fn load(file: &MemoryMap) -> Result<Self> {
        let bytes = file.slice(0, SHARD_SETTINGS_HEADER_SIZE)?;
        let header = ShardSettingsHeader::from_bytes(bytes)?;

        let settings = Self {
            shard_max_entries: header.shard_max_entries(),
            total_key_size: header.total_key_size() as usize,
            sharded_bitsize: header.sharded_bitsize() as usize,
            bucket_bitsize: header.bucket_bitsize() as usize,
            row_value_size: header.row_value_size() as usize,
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ShardSettingsHeader {
    magic: [u8; 8],
    version: U16,
    total_key_size: U16,
    sharded_bitsize: U16,
    bucket_bitsize: U16,
    row_value_size: U32,
    shard_max_entries: U32,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<ShardSettingsHeader>() == SHARD_SETTINGS_HEADER_SIZE);

impl ShardSettingsHeader {
    fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= SHARD_SETTINGS_HEADER_SIZE,
            "buffer too small for shard settings: {} < {}",
            bytes.len(),
            SHARD_SETTINGS_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..SHARD_SETTINGS_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse shard settings: {:?}", e))?;

        ensure!(
            &header.magic == SHARD_MAGIC,
            "corrupt shard settings: bad magic"
        );
        ensure!(
            header.version.get() == SHARD_VERSION,
            "unsupported shard version: {} (expected {})",
            header.version.get(),
            SHARD_VERSION
        );

        Ok(header)
    }

    le_getters! {
        total_key_size: u16,
        sharded_bitsize: u16,
        bucket_bitsize: u16,
        row_value_size: u32,
        shard_max_entries: u32,
    }
}
