//! Basic blocks of decoded VM instructions.

use std::fmt;

use crate::{
    disassembler::{Annotation, VmInstruction},
    vm::{FlowControl, VmCall},
};

/// A maximal run of contiguous instructions with a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Offset of the first instruction
    pub offset: u64,
    /// Instructions in ascending offset order
    pub instructions: Vec<VmInstruction>,
}

impl BasicBlock {
    /// Creates an empty block starting at `offset`.
    #[must_use]
    pub fn new(offset: u64) -> Self {
        BasicBlock {
            offset,
            instructions: Vec::new(),
        }
    }

    /// Offset one past the last instruction.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.instructions
            .last()
            .map_or(self.offset, VmInstruction::next_offset)
    }

    /// Returns `true` if an instruction of this block starts at or spans `offset`.
    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        (self.offset..self.end()).contains(&offset)
    }

    /// The final instruction.
    #[must_use]
    pub fn terminator(&self) -> Option<&VmInstruction> {
        self.instructions.last()
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if the block holds no instruction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Returns `true` if the block ends in `RET`.
    #[must_use]
    pub fn is_return(&self) -> bool {
        self.terminator()
            .is_some_and(|instruction| instruction.flow() == FlowControl::Return)
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "loc_{:04x}:", self.offset)?;
        for instruction in &self.instructions {
            writeln!(f, "    {instruction}")?;
        }
        Ok(())
    }
}

/// Returns `true` if no instruction executes after `instruction` on its path.
pub(crate) fn ends_path(instruction: &VmInstruction) -> bool {
    if instruction.opcode.is_terminal() {
        return true;
    }
    matches!(
        &instruction.annotation,
        Some(Annotation::VCall(vcall)) if matches!(vcall.call, VmCall::Exit | VmCall::Throw)
    )
}
