//! The read-only inputs of a devirtualization run.

use std::path::Path;

use crate::{
    file::BytecodeBlob,
    vm::{ExportTable, OpcodeTable, ReferenceTable},
    Result,
};

/// Everything recovered from a protected binary that inference needs: the bytecode blob,
/// the byte to semantic table, the export table and the reference table.
///
/// The image is shared by reference between exports and threads. Only the exit keys of the
/// export table change, and only between driver passes.
///
/// # Examples
///
/// ```rust,no_run
/// use vmscope::{
///     file::BytecodeBlob,
///     vm::{ExportTable, OpcodeTableBuilder, ReferenceTable},
///     VmImage,
/// };
///
/// let table = OpcodeTableBuilder::sequential().build()?;
/// let image = VmImage::from_file(
///     "koi.bin",
///     table,
///     ExportTable::new(),
///     ReferenceTable::new(),
/// )?;
/// println!("{} bytes of bytecode", image.blob().len());
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Debug)]
pub struct VmImage {
    blob: BytecodeBlob,
    table: OpcodeTable,
    exports: ExportTable,
    references: ReferenceTable,
}

impl VmImage {
    /// Bundles already loaded inputs.
    #[must_use]
    pub fn new(
        blob: BytecodeBlob,
        table: OpcodeTable,
        exports: ExportTable,
        references: ReferenceTable,
    ) -> Self {
        VmImage {
            blob,
            table,
            exports,
            references,
        }
    }

    /// Memory-maps the bytecode blob at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn from_file(
        path: impl AsRef<Path>,
        table: OpcodeTable,
        exports: ExportTable,
        references: ReferenceTable,
    ) -> Result<Self> {
        Ok(Self::new(
            BytecodeBlob::from_file(path)?,
            table,
            exports,
            references,
        ))
    }

    /// The bytecode blob.
    #[must_use]
    pub fn blob(&self) -> &BytecodeBlob {
        &self.blob
    }

    /// The byte to semantic table.
    #[must_use]
    pub fn table(&self) -> &OpcodeTable {
        &self.table
    }

    /// The export table.
    #[must_use]
    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// Mutable access to the export table, used to record learned exit keys.
    pub fn exports_mut(&mut self) -> &mut ExportTable {
        &mut self.exports
    }

    /// The reference table.
    #[must_use]
    pub fn references(&self) -> &ReferenceTable {
        &self.references
    }
}
