use std::fmt;

use crate::{
    analysis::{ProgramState, SymbolicValue},
    disassembler::Annotation,
    vm::{FlowControl, OpCodeInfo, VmOpCode, VmRegister},
};

/// The decoded operand of a VM instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmOperand {
    /// No operand
    None,
    /// A register (`POP`, `PUSHR_*`)
    Register(VmRegister),
    /// 32-bit immediate (`PUSHI_DWORD`)
    Dword(u32),
    /// 64-bit immediate (`PUSHI_QWORD`)
    Qword(u64),
}

impl VmOperand {
    /// The immediate, zero-extended to 64 bits.
    #[must_use]
    pub const fn immediate(self) -> Option<u64> {
        match self {
            VmOperand::Dword(value) => Some(value as u64),
            VmOperand::Qword(value) => Some(value),
            VmOperand::None | VmOperand::Register(_) => None,
        }
    }

    /// The register operand.
    #[must_use]
    pub const fn register(self) -> Option<VmRegister> {
        match self {
            VmOperand::Register(register) => Some(register),
            _ => None,
        }
    }
}

impl fmt::Display for VmOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmOperand::None => Ok(()),
            VmOperand::Register(register) => write!(f, "{register}"),
            VmOperand::Dword(value) => write!(f, "0x{value:08x}"),
            VmOperand::Qword(value) => write!(f, "0x{value:016x}"),
        }
    }
}

/// A decoded VM instruction.
///
/// Created by [`crate::disassembler::StreamDecoder::decode_at`] and completed by the
/// inference disassembler, which fills in the merged state before execution, the consumed
/// values and the annotation. Instructions are never mutated once inference for their
/// export has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInstruction {
    /// Offset of the opcode byte in the bytecode blob
    pub offset: u64,
    /// Opcode
    pub opcode: VmOpCode,
    /// Operand
    pub operand: VmOperand,
    /// Encoded size in bytes (2, 3, 6 or 10)
    pub size: u64,
    /// Resolved semantics of computed operands
    pub annotation: Option<Annotation>,
    /// Program state before execution
    pub state: ProgramState,
    /// Consumed values: popped slots in pop order, or the register read by `PUSHR_*`
    pub dependencies: Vec<SymbolicValue>,
}

impl VmInstruction {
    /// Creates an instruction at `offset` whose state holds only the decoding key.
    #[must_use]
    pub fn new(offset: u64, key: u32, opcode: VmOpCode, operand: VmOperand) -> Self {
        VmInstruction {
            offset,
            opcode,
            operand,
            size: opcode.size(),
            annotation: None,
            state: ProgramState::new(offset, key),
            dependencies: Vec::new(),
        }
    }

    /// Offset of the following instruction in the stream.
    #[must_use]
    pub const fn next_offset(&self) -> u64 {
        self.offset + self.size
    }

    /// Static descriptor of the opcode.
    #[must_use]
    pub const fn info(&self) -> OpCodeInfo {
        self.opcode.info()
    }

    /// Control flow behaviour of the opcode.
    #[must_use]
    pub const fn flow(&self) -> FlowControl {
        self.opcode.info().flow
    }

    /// Jump candidates, if the instruction carries a jump annotation.
    #[must_use]
    pub fn jump_targets(&self) -> &[u64] {
        self.annotation
            .as_ref()
            .and_then(Annotation::jump_targets)
            .unwrap_or(&[])
    }
}

impl fmt::Display for VmInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}: {}", self.offset, self.opcode)?;
        if self.operand != VmOperand::None {
            write!(f, " {}", self.operand)?;
        }
        if let Some(annotation) = &self.annotation {
            write!(f, "  ; {annotation}")?;
        }
        Ok(())
    }
}
