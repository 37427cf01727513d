//! # Memory-Mapped File
//!
//! `MemoryMap` owns a file descriptor plus a shared writable mapping of
//! the whole file, and can grow both on demand. It is the single point
//! through which every on-disk component reads and writes bytes.
//!
//! ## Design
//!
//! Traditional engines copy page data between kernel buffers and a user
//! space cache. Mapping the file into the address space eliminates that
//! copy; the OS pages data in and out transparently. The trade-offs:
//!
//! - reads may fault and block on disk I/O;
//! - a resize remaps the file, invalidating every outstanding pointer.
//!
//! The second point is why `resize` takes `&mut self`: the borrow checker
//! statically proves no `&[u8]` from `data()` survives a remap. Callers
//! that must remember a location across an allocation store an offset.
//!
//! ## Durability
//!
//! Writes land in the page cache and reach disk when the OS decides, or
//! when [`MemoryMap::sync`] is called. The engine's crash safety comes
//! from write *ordering* (single aligned commit stores), not from
//! flushing; see the database façade.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

/// Multiplies a required size by the growth factor, keeping doubling as
/// the floor so repeated small appends stay amortised-constant.
fn grown_size(needed: u64, current: u64) -> u64 {
    (needed + needed / 2).max(current * 2)
}

#[derive(Debug)]
pub struct MemoryMap {
    file: File,
    mmap: MmapMut,
    size: u64,
}

impl MemoryMap {
    /// Maps an existing, non-empty file read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            size > 0,
            "cannot map empty database file '{}'",
            path.display()
        );

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally, leading to undefined behavior. This is safe
        // because:
        // 1. Database files are guarded by the directory lock against other
        //    processes of this engine, and are not meant to be touched by
        //    anything else.
        // 2. The mmap lifetime is tied to MemoryMap, preventing
        //    use-after-unmap.
        // 3. All access goes through data()/data_mut(), whose borrows cannot
        //    outlive a resize.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self { file, mmap, size })
    }

    /// The whole mapped file.
    pub fn data(&self) -> &[u8] {
        &self.mmap[..self.size as usize]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..self.size as usize]
    }

    /// Bounds-checked sub-slice at an absolute file offset.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len as u64);
        ensure!(
            end.is_some_and(|end| end <= self.size),
            "read past end of file: {} + {} > {}",
            offset,
            len,
            self.size
        );
        Ok(&self.mmap[offset as usize..(offset + len as u64) as usize])
    }

    pub fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len as u64);
        ensure!(
            end.is_some_and(|end| end <= self.size),
            "write past end of file: {} + {} > {}",
            offset,
            len,
            self.size
        );
        Ok(&mut self.mmap[offset as usize..(offset + len as u64) as usize])
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Truncates the file to `new_size` bytes and remaps it. Files never
    /// shrink; a smaller size is a caller bug and is rejected.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size <= self.size {
            ensure!(
                new_size == self.size,
                "refusing to shrink mapped file from {} to {}",
                self.size,
                new_size
            );
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mapping before resize")?;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: map_mut is unsafe because the old mapping becomes invalid.
        // This is safe because:
        // 1. resize() takes &mut self, so no data() borrows exist.
        // 2. The old mapping was flushed above and is dropped on assignment.
        // 3. The file was extended to new_size before remapping.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap file after resize")?
        };

        self.size = new_size;

        Ok(())
    }

    /// Ensures at least `needed` bytes are addressable, applying the
    /// growth policy when they are not.
    pub fn reserve(&mut self, needed: u64) -> Result<()> {
        if needed <= self.size {
            return Ok(());
        }
        self.resize(grown_size(needed, self.size))
    }

    /// Flushes dirty pages to disk (msync). The engine's commit path never
    /// calls this; tools and tests may.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mapping to disk")
    }

    /// Hints the kernel that a range is about to be read sequentially.
    pub fn prefetch(&self, offset: u64, len: usize) {
        if offset >= self.size {
            return;
        }
        let len = len.min((self.size - offset) as usize);

        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is a hint; the range was
        // clamped to the mapping above, so the pointer arithmetic stays
        // inside the mapped region.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(offset as usize) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }

        #[cfg(not(unix))]
        let _ = len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn touch(path: &std::path::Path) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(b"H").unwrap();
    }

    #[test]
    fn open_rejects_missing_and_empty_files() {
        let dir = tempdir().unwrap();

        assert!(MemoryMap::open(dir.path().join("absent")).is_err());

        let empty = dir.path().join("empty");
        std::fs::File::create(&empty).unwrap();
        assert!(MemoryMap::open(&empty).is_err());
    }

    #[test]
    fn resize_makes_new_bytes_addressable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        touch(&path);

        let mut map = MemoryMap::open(&path).unwrap();
        assert_eq!(map.size(), 1);

        map.resize(4096).unwrap();
        assert_eq!(map.size(), 4096);
        map.data_mut()[4095] = 0xcc;
        assert_eq!(map.data()[4095], 0xcc);
    }

    #[test]
    fn resize_never_shrinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        touch(&path);

        let mut map = MemoryMap::open(&path).unwrap();
        map.resize(1024).unwrap();
        assert!(map.resize(512).is_err());
        assert_eq!(map.size(), 1024);
    }

    #[test]
    fn reserve_applies_growth_policy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        touch(&path);

        let mut map = MemoryMap::open(&path).unwrap();
        map.resize(100).unwrap();

        // needed * 3/2 dominates.
        map.reserve(1000).unwrap();
        assert_eq!(map.size(), 1500);

        // doubling dominates for small overshoots.
        map.reserve(1501).unwrap();
        assert_eq!(map.size(), 3000);

        // already satisfied: no change.
        map.reserve(10).unwrap();
        assert_eq!(map.size(), 3000);
    }

    #[test]
    fn data_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        touch(&path);

        {
            let mut map = MemoryMap::open(&path).unwrap();
            map.resize(64).unwrap();
            map.data_mut()[10..14].copy_from_slice(b"coin");
            map.sync().unwrap();
        }

        let map = MemoryMap::open(&path).unwrap();
        assert_eq!(&map.data()[10..14], b"coin");
    }
}
