//! Bytecode blob access.
//!
//! The encrypted bytecode of all exports lives in a single blob inside the protected binary.
//! Extracting it is the job of an external collaborator; this module wraps the extracted
//! bytes and provides bounds-checked random access to them. The blob is fully materialised
//! (either owned in memory or memory-mapped) before any decoding starts, so the inference
//! loop never performs blocking I/O.
//!
//! # Key Components
//!
//! - [`BytecodeBlob`] - The blob handed to the disassembler
//! - [`Backend`] - Trait for different data sources (disk files, memory buffers)
//!
//! # Examples
//!
//! ```rust
//! use vmscope::file::BytecodeBlob;
//!
//! let blob = BytecodeBlob::from_mem(vec![0x00, 0x01, 0x02, 0x03]);
//! assert_eq!(blob.len(), 4);
//! assert_eq!(blob.read_u16(2)?, 0x0302);
//! # Ok::<(), vmscope::Error>(())
//! ```
//!
//! # Thread Safety
//!
//! [`BytecodeBlob`] is immutable, `Send` and `Sync`, and is shared by reference across
//! exports processed in parallel.

mod memory;
mod physical;

use std::{fmt, path::Path};

use memory::Memory;
use physical::Physical;

use crate::{utils::io::read_le_at, Error::OutOfBounds, Result};

/// Backend trait for blob data sources.
///
/// All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Errors
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// The encrypted bytecode blob of a protected binary.
pub struct BytecodeBlob {
    backend: Box<dyn Backend>,
}

impl BytecodeBlob {
    /// Memory-maps a blob that was dumped to disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(BytecodeBlob {
            backend: Box::new(Physical::new(path)?),
        })
    }

    /// Wraps an in-memory blob.
    #[must_use]
    pub fn from_mem(data: Vec<u8>) -> Self {
        BytecodeBlob {
            backend: Box::new(Memory::new(data)),
        }
    }

    /// Returns the whole blob.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.backend.data()
    }

    /// Returns `len` bytes at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the blob.
    pub fn data_slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let offset = usize::try_from(offset).map_err(|_| OutOfBounds)?;
        self.backend.data_slice(offset, len)
    }

    /// Reads the raw byte at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` is past the end.
    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        Ok(self.data_slice(offset, 1)?[0])
    }

    /// Reads an unencrypted little-endian `u16` at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the read exceeds the blob.
    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        let mut cursor = 0;
        read_le_at(self.data_slice(offset, 2)?, &mut cursor)
    }

    /// Reads an unencrypted little-endian `i32` at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the read exceeds the blob.
    pub fn read_i32(&self, offset: u64) -> Result<i32> {
        let mut cursor = 0;
        read_le_at(self.data_slice(offset, 4)?, &mut cursor)
    }

    /// Length of the blob in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    /// Returns `true` if the blob holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backend.len() == 0
    }
}

impl fmt::Debug for BytecodeBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytecodeBlob")
            .field("len", &self.len())
            .finish()
    }
}

impl From<Vec<u8>> for BytecodeBlob {
    fn from(data: Vec<u8>) -> Self {
        BytecodeBlob::from_mem(data)
    }
}
