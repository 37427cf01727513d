//! Little-endian read/write cursors over mapped bytes.
//!
//! All multi-byte integers in the engine's file formats are little-endian.
//! [`Serializer`] and [`Deserializer`] are thin positioned cursors over a
//! byte slice; components use them for sequential runs (shard entries,
//! hash items) and for one-shot header fields.

use eyre::{ensure, Result};

/// Writes little-endian values at an advancing position in a byte slice.
pub struct Serializer<'a> {
    data: &'a mut [u8],
    position: usize,
}

impl<'a> Serializer<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8]> {
        ensure!(
            self.position + len <= self.data.len(),
            "serializer overrun: {} + {} > {}",
            self.position,
            len,
            self.data.len()
        );
        let slice = &mut self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.reserve(2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.reserve(8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

/// Reads little-endian values at an advancing position in a byte slice.
pub struct Deserializer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.position + len <= self.data.len(),
            "deserializer overrun: {} + {} > {}",
            self.position,
            len,
            self.data.len()
        );
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("len 2")))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }
}
