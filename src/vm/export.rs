//! Exported VM functions.
//!
//! The protected binary replaces each virtualized method body with a stub that enters the
//! interpreter with an export id. The export table (parsed from the custom stream by an
//! external collaborator) maps the id to the code offset in the bytecode blob, the initial
//! decryption key and the method signature.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Signature of an exported VM function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSignature {
    /// Raw signature flags, see [`crate::vm::OpcodeTable::flag_instance`]
    pub flags: u8,
    /// Reference ids of the parameter types, including the instance parameter if present
    pub parameter_types: Vec<u32>,
    /// Reference id of the return type
    pub return_type: u32,
}

impl ExportSignature {
    /// Number of stack slots a caller pushes for this function.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameter_types.len()
    }

    /// Returns `true` if the instance bit `mask` is set in the signature flags.
    #[must_use]
    pub fn is_instance(&self, mask: u8) -> bool {
        self.flags & mask != 0
    }
}

/// One exported VM function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Export id
    pub id: u32,
    /// Offset of the first instruction in the bytecode blob
    pub code_offset: u64,
    /// Decryption key at `code_offset`; absent when the export has no code (offset 0)
    pub entry_key: Option<u32>,
    /// Decryption key after the function returns, if learned from a previous run
    pub exit_key: Option<u32>,
    /// Function signature
    pub signature: ExportSignature,
}

impl ExportInfo {
    /// Creates an export with a known entry key.
    #[must_use]
    pub fn new(id: u32, code_offset: u64, entry_key: u32, signature: ExportSignature) -> Self {
        ExportInfo {
            id,
            code_offset,
            entry_key: Some(entry_key),
            exit_key: None,
            signature,
        }
    }
}

/// All exports of a protected binary, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    exports: BTreeMap<u32, ExportInfo>,
}

impl ExportTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an export.
    pub fn insert(&mut self, export: ExportInfo) {
        self.exports.insert(export.id, export);
    }

    /// Looks up an export by id.
    ///
    /// # Errors
    /// Returns [`Error::ExportNotFound`] if the id is unknown.
    pub fn get(&self, id: u32) -> Result<&ExportInfo> {
        self.exports.get(&id).ok_or(Error::ExportNotFound(id))
    }

    /// Finds the export whose code starts at `offset`.
    ///
    /// An export at offset 0 only matches if it carries an entry key; without one it has no
    /// code.
    #[must_use]
    pub fn by_offset(&self, offset: u64) -> Option<&ExportInfo> {
        self.exports.values().find(|export| {
            export.code_offset == offset && (offset != 0 || export.entry_key.is_some())
        })
    }

    /// Records a learned exit key.
    ///
    /// # Errors
    /// Returns [`Error::ExportNotFound`] if the id is unknown.
    pub fn set_exit_key(&mut self, id: u32, key: u32) -> Result<()> {
        let export = self.exports.get_mut(&id).ok_or(Error::ExportNotFound(id))?;
        export.exit_key = Some(key);
        Ok(())
    }

    /// Iterates over all exports in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &ExportInfo> {
        self.exports.values()
    }

    /// Number of exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exports.len()
    }

    /// Returns `true` if the table holds no exports.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

impl FromIterator<ExportInfo> for ExportTable {
    fn from_iter<I: IntoIterator<Item = ExportInfo>>(iter: I) -> Self {
        let mut table = ExportTable::new();
        for export in iter {
            table.insert(export);
        }
        table
    }
}
