//! The shard proper: buffered adds, per-height entry commits, prefix
//! scans and block-level rollback.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::serial::{Deserializer, Serializer};
use crate::shard::{top_bits, KeyPrefix, ShardSettings};
use crate::storage::MemoryMap;

struct BufferedRow {
    scan_key: SmallVec<[u8; 20]>,
    value: Vec<u8>,
}

pub struct HistoryShard {
    settings: ShardSettings,
    entries_end: u64,
    rows: Vec<BufferedRow>,
}

impl HistoryShard {
    /// First byte past the height-slot region; also the initial
    /// `entries_end`.
    fn slots_end(settings: &ShardSettings) -> u64 {
        8 + 8 * settings.shard_max_entries as u64
    }

    /// Writes an empty shard: the watermark and one zeroed slot per
    /// reservable height.
    pub fn initialize_new(file: &mut MemoryMap, settings: ShardSettings) -> Result<Self> {
        settings.validate()?;

        let slots_end = Self::slots_end(&settings);
        file.reserve(slots_end)?;

        let mut serial = Serializer::new(file.slice_mut(0, slots_end as usize)?);
        serial.write_u64(slots_end)?;
        for _ in 0..settings.shard_max_entries {
            serial.write_u64(0)?;
        }

        Ok(Self {
            settings,
            entries_end: slots_end,
            rows: Vec::new(),
        })
    }

    /// Reads and validates the watermark of an initialized shard.
    pub fn start(file: &MemoryMap, settings: ShardSettings) -> Result<Self> {
        settings.validate()?;

        let slots_end = Self::slots_end(&settings);
        let Ok(header) = file.slice(0, 8) else {
            bail!("corrupt shard: watermark past end of file");
        };
        let entries_end = Deserializer::new(header).read_u64()?;

        ensure!(
            entries_end >= slots_end && entries_end <= file.size(),
            "corrupt shard: entries end {} outside [{}, {}]",
            entries_end,
            slots_end,
            file.size()
        );

        Ok(Self {
            settings,
            entries_end,
            rows: Vec::new(),
        })
    }

    pub fn settings(&self) -> &ShardSettings {
        &self.settings
    }

    /// Current watermark; everything below it is committed entries.
    pub fn entries_end(&self) -> u64 {
        self.entries_end
    }

    /// Buffers one row in memory. Nothing reaches the file until `sync`.
    pub fn add(&mut self, scan_key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(
            scan_key.len() == self.settings.scan_size(),
            "invalid scan key length {} (expected {})",
            scan_key.len(),
            self.settings.scan_size()
        );
        ensure!(
            value.len() == self.settings.row_value_size,
            "invalid row value length {} (expected {})",
            value.len(),
            self.settings.row_value_size
        );

        self.rows.push(BufferedRow {
            scan_key: SmallVec::from_slice(scan_key),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn slot_offset(&self, height: u32) -> u64 {
        8 + 8 * height as u64
    }

    /// Committed entry offset for `height`.
    fn entry_position(&self, file: &MemoryMap, height: u32) -> Result<u64> {
        ensure!(
            height < self.settings.shard_max_entries,
            "invalid height {} (max entries {})",
            height,
            self.settings.shard_max_entries
        );
        let slot = file.slice(self.slot_offset(height), 8)?;
        Deserializer::new(slot).read_u64()
    }

    /// Size of the committed entry at `position`, validated against the
    /// watermark.
    fn entry_size_at(&self, file: &MemoryMap, position: u64) -> Result<u64> {
        let header = file.slice(position, 2)?;
        let row_count = Deserializer::new(header).read_u16()? as u64;

        let size = 2
            + 2 * self.settings.number_buckets() as u64
            + row_count * self.settings.row_size() as u64;
        ensure!(
            position + size <= self.entries_end,
            "corrupt shard: entry at {} with {} rows overflows entries end {}",
            position,
            row_count,
            self.entries_end
        );
        Ok(size)
    }

    /// Commits the buffered rows as the entry for `height`:
    /// sort, write rows + bucket index, link the height slot, then move
    /// the watermark. The watermark store is the commit point.
    pub fn sync(&mut self, file: &mut MemoryMap, height: u32) -> Result<()> {
        ensure!(
            height < self.settings.shard_max_entries,
            "invalid height {} (max entries {})",
            height,
            self.settings.shard_max_entries
        );
        ensure!(
            self.rows.len() <= u16::MAX as usize,
            "invalid entry: {} rows exceed the 16-bit row count",
            self.rows.len()
        );

        self.rows
            .sort_by(|a, b| a.scan_key.as_slice().cmp(b.scan_key.as_slice()));

        let number_buckets = self.settings.number_buckets();
        let row_count = self.rows.len();
        let entry_size =
            2 + 2 * number_buckets as u64 + (row_count * self.settings.row_size()) as u64;

        let entry_position = self.entries_end;
        file.reserve(entry_position + entry_size)?;

        // First row index per bucket; buckets past the last row keep
        // row_count, which scans read as "no rows here or later".
        let mut bucket_index = vec![row_count as u16; number_buckets];
        let mut begin = 0usize;
        for (row, buffered) in self.rows.iter().enumerate() {
            let bucket = top_bits(&buffered.scan_key, self.settings.bucket_bitsize) as usize;
            let end = bucket + 1;
            for slot in &mut bucket_index[begin..end.max(begin)] {
                *slot = row as u16;
            }
            begin = begin.max(end);
        }

        {
            let mut serial =
                Serializer::new(file.slice_mut(entry_position, entry_size as usize)?);
            serial.write_u16(row_count as u16)?;
            for index in &bucket_index {
                serial.write_u16(*index)?;
            }
            for row in &self.rows {
                serial.write_bytes(&row.scan_key)?;
                serial.write_bytes(&row.value)?;
            }
        }

        // Link the height slot, then publish through the watermark.
        Serializer::new(file.slice_mut(self.slot_offset(height), 8)?)
            .write_u64(entry_position)?;
        self.entries_end = entry_position + entry_size;
        Serializer::new(file.slice_mut(0, 8)?).write_u64(self.entries_end)?;

        self.rows.clear();
        Ok(())
    }

    /// Truncates every entry for blocks at or above `height` by rewinding
    /// the watermark past the entry of `height - 1`. Stale slots above
    /// become unreachable.
    pub fn unlink(&mut self, file: &mut MemoryMap, height: u32) -> Result<()> {
        ensure!(height > 0, "invalid unlink height 0");

        let previous = self.entry_position(file, height - 1)?;
        ensure!(
            previous >= Self::slots_end(&self.settings) && previous < self.entries_end,
            "corrupt shard: height {} has no committed entry",
            height - 1
        );

        self.entries_end = previous + self.entry_size_at(file, previous)?;
        Serializer::new(file.slice_mut(0, 8)?).write_u64(self.entries_end)?;
        Ok(())
    }

    /// Rewinds the shard to its empty state; the rollback of the very
    /// first entry, which `unlink` cannot express.
    pub fn reset(&mut self, file: &mut MemoryMap) -> Result<()> {
        self.entries_end = Self::slots_end(&self.settings);
        Serializer::new(file.slice_mut(0, 8)?).write_u64(self.entries_end)?;
        Ok(())
    }

    /// Visits the value of every row whose scan key starts with `prefix`,
    /// in every entry from `from_height`'s onward. Within an entry rows
    /// arrive in ascending scan-key order; the walk stops at the first
    /// mismatch, relying on the sort.
    pub fn scan(
        &self,
        file: &MemoryMap,
        prefix: &KeyPrefix,
        from_height: u32,
        mut read: impl FnMut(&[u8]),
    ) -> Result<()> {
        ensure!(
            prefix.bit_count() <= self.settings.scan_bitsize(),
            "invalid prefix: {} bits exceed scan bitsize {}",
            prefix.bit_count(),
            self.settings.scan_bitsize()
        );

        let slots_end = Self::slots_end(&self.settings);
        let mut entry = self.entry_position(file, from_height)?;
        if entry == 0 && self.entries_end == slots_end {
            // Nothing committed yet.
            return Ok(());
        }
        ensure!(
            entry >= slots_end && entry <= self.entries_end,
            "corrupt shard: height {} slot points at {}",
            from_height,
            entry
        );

        // The walk is strictly sequential from here to the watermark.
        file.prefetch(entry, (self.entries_end - entry) as usize);

        let bucket = prefix.bucket(self.settings.bucket_bitsize) as usize;
        let scan_size = self.settings.scan_size();
        let row_size = self.settings.row_size();

        while entry != self.entries_end {
            let entry_size = self.entry_size_at(file, entry)?;
            let bytes = file.slice(entry, entry_size as usize)?;
            let mut header = Deserializer::new(bytes);
            let row_count = header.read_u16()? as usize;

            let mut start = Deserializer::new(&bytes[2 + 2 * bucket..]).read_u16()? as usize;
            ensure!(
                start <= row_count,
                "corrupt shard: bucket {} starts past {} rows",
                bucket,
                row_count
            );

            let rows_sector = 2 + 2 * self.settings.number_buckets();
            while start < row_count {
                let row = &bytes[rows_sector + start * row_size..][..row_size];
                if !prefix.matches(&row[..scan_size]) {
                    break;
                }
                read(&row[scan_size..]);
                start += 1;
            }

            entry += entry_size;
        }

        Ok(())
    }
}
