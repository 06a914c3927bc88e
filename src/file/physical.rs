//! Memory-mapped bytecode blob backend.
//!
//! Blobs extracted from large protected binaries are mapped instead of read so that only the
//! pages touched by inference are paged in. The mapping is read-only and lives as long as the
//! [`Physical`] value.

use std::{fs, path::Path};

use memmap2::Mmap;

use super::Backend;
use crate::{
    Error::{Error, FileError, OutOfBounds},
    Result,
};

/// A blob backend that memory-maps a file from disk.
#[derive(Debug)]
pub struct Physical {
    /// Memory-mapped file data
    data: Mmap,
}

impl Physical {
    /// Memory-map the file at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or
    /// [`crate::Error::Error`] if memory mapping fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path).map_err(FileError)?;

        // The mapping is read-only and the blob is never written by this process.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|error| Error(error.to_string()))?;

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if offset_end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(&self.data[offset..offset_end])
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn physical() {
        let path = std::env::temp_dir().join(format!("vmscope-physical-{}.bin", std::process::id()));
        {
            let mut file = fs::File::create(&path).unwrap();
            file.write_all(&[0x10, 0x20, 0x30, 0x40]).unwrap();
        }

        let physical = Physical::new(&path).unwrap();
        assert_eq!(physical.len(), 4);
        assert_eq!(physical.data_slice(1, 2).unwrap(), &[0x20, 0x30]);
        assert!(physical.data_slice(3, 2).is_err());

        drop(physical);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file() {
        let result = Physical::new("/nonexistent/vmscope/blob.bin");
        assert!(matches!(result, Err(FileError(_))));
    }
}
