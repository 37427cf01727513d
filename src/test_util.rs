//! Shared unit-test helpers.

use std::io::Write;

use tempfile::TempDir;

use crate::storage::MemoryMap;

/// A mapped one-byte scratch file in a fresh temp directory. The
/// directory guard must stay alive for the mapping to remain valid.
pub fn mapped_file() -> (TempDir, MemoryMap) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scratch");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"H").unwrap();
    drop(file);
    (dir, MemoryMap::open(&path).unwrap())
}
