//! Read-only memory mapping of an input file.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::Result;

/// A file mapped read-only for the lifetime of this value.
///
/// The mapping is released when the value is dropped. The returned byte
/// span is safe for concurrent reads across worker threads.
pub struct MappedFile {
    path: PathBuf,
    mmap: Mmap,
    len: u64,
}

impl MappedFile {
    /// Open and map a file read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // Safety: the mapping is read-only and the engine never writes to
        // the CSV while indexes or queries hold it open.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            len,
        })
    }

    /// The full mapped byte span.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();

        let mapped = MappedFile::open(&path).unwrap();
        assert_eq!(mapped.len(), 8);
        assert_eq!(mapped.data(), b"a,b\n1,2\n");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MappedFile::open(&dir.path().join("nope.csv")).is_err());
    }
}
