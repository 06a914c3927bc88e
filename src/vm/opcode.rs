//! The abstract VM instruction set.
//!
//! The protected binary never stores these opcodes directly: every build of the obfuscator
//! assigns each opcode a random byte value, which is recovered from the runtime binary by an
//! external collaborator and supplied through [`crate::vm::OpcodeTable`]. This module only
//! describes the semantics that are independent of those byte values: operand encoding,
//! control flow behaviour and the fixed part of each opcode's stack effect.
//!
//! # Key Types
//! - [`VmOpCode`] - The opcode enumeration
//! - [`OpCodeInfo`] - Static descriptor of an opcode
//! - [`OperandKind`] - How the operand following the opcode is encoded
//! - [`FlowControl`] - How an opcode affects control flow

use std::fmt;

use strum::{EnumCount, EnumIter};

/// Encoding of the operand that follows an opcode and its padding byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// No operand
    None,
    /// One byte register id, translated through the opcode table
    Register,
    /// 32-bit little-endian immediate
    Dword,
    /// 64-bit little-endian immediate
    Qword,
}

impl OperandKind {
    /// Number of operand bytes in the stream.
    #[must_use]
    pub const fn size(self) -> u64 {
        match self {
            OperandKind::None => 0,
            OperandKind::Register => 1,
            OperandKind::Dword => 4,
            OperandKind::Qword => 8,
        }
    }
}

/// How an opcode affects control flow during inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowControl {
    /// Falls through to the next instruction
    Sequential,
    /// Unconditional jump to a computed target
    Jump,
    /// Jump to a computed target, or fall through
    ConditionalJump,
    /// Multi-way jump through a table, or fall through
    Switch,
    /// Call into another VM function, continues after the call
    Call,
    /// Return from the VM function, ends the path
    Return,
    /// Enters a protected region and registers an exception handler
    Try,
    /// Leaves a protected region
    Leave,
    /// Delegates to a runtime helper (see [`crate::vm::VmCall`])
    VCall,
}

/// Broad classification of an opcode, mostly useful for rendering and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCodeCategory {
    /// Integer and floating point arithmetic
    Arithmetic,
    /// Bitwise operations and shifts
    Bitwise,
    /// Comparisons setting the flags register
    Comparison,
    /// Conversions and sign extensions
    Conversion,
    /// Indirect loads and stores
    Memory,
    /// Register and immediate pushes/pops
    Stack,
    /// Jumps, calls, returns, exception handling
    ControlFlow,
    /// Everything else
    Misc,
}

/// The fixed part of an opcode's stack effect.
///
/// Some opcodes (`CALL`, `TRY`, `VCALL`) pop additional, data dependent slots; those are
/// handled by the inference disassembler and are not reflected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackBehavior {
    /// Number of slots popped
    pub pops: u8,
    /// Number of slots pushed
    pub pushes: u8,
}

/// Static descriptor of a [`VmOpCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCodeInfo {
    /// Canonical mnemonic, e.g. `PUSHI_DWORD`
    pub mnemonic: &'static str,
    /// Operand encoding
    pub operand: OperandKind,
    /// Control flow behaviour
    pub flow: FlowControl,
    /// Fixed stack effect
    pub stack: StackBehavior,
    /// Whether the opcode writes the `FL` register
    pub writes_flags: bool,
    /// Broad classification
    pub category: OpCodeCategory,
}

/// The VM opcodes.
///
/// # Examples
///
/// ```rust
/// use vmscope::vm::{FlowControl, OperandKind, VmOpCode};
///
/// let info = VmOpCode::PushiDword.info();
/// assert_eq!(info.mnemonic, "PUSHI_DWORD");
/// assert_eq!(info.operand, OperandKind::Dword);
/// assert_eq!(VmOpCode::PushiDword.size(), 6);
/// assert_eq!(VmOpCode::Jz.info().flow, FlowControl::ConditionalJump);
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount)]
pub enum VmOpCode {
    NorDword,
    NorQword,
    Cmp,
    CmpDword,
    CmpQword,
    CmpR32,
    CmpR64,
    Jz,
    Jnz,
    Jmp,
    Swt,
    AddDword,
    AddQword,
    AddR32,
    AddR64,
    SubR32,
    SubR64,
    MulDword,
    MulQword,
    MulR32,
    MulR64,
    DivDword,
    DivQword,
    DivR32,
    DivR64,
    RemDword,
    RemQword,
    RemR32,
    RemR64,
    ShrDword,
    ShrQword,
    ShlDword,
    ShlQword,
    FconvR32R64,
    FconvR64R32,
    FconvR32,
    FconvR64,
    IconvPtr,
    IconvR64,
    LindPtr,
    LindObject,
    LindByte,
    LindWord,
    LindDword,
    LindQword,
    SindPtr,
    SindObject,
    SindByte,
    SindWord,
    SindDword,
    SindQword,
    Pop,
    PushrObject,
    PushrByte,
    PushrWord,
    PushrDword,
    PushrQword,
    PushiDword,
    PushiQword,
    SxByte,
    SxWord,
    SxDword,
    Call,
    Ret,
    Nop,
    Try,
    Leave,
    Vcall,
}

const fn info(
    mnemonic: &'static str,
    operand: OperandKind,
    flow: FlowControl,
    pops: u8,
    pushes: u8,
    writes_flags: bool,
    category: OpCodeCategory,
) -> OpCodeInfo {
    OpCodeInfo {
        mnemonic,
        operand,
        flow,
        stack: StackBehavior { pops, pushes },
        writes_flags,
        category,
    }
}

impl VmOpCode {
    /// Returns the static descriptor of this opcode.
    #[must_use]
    pub const fn info(self) -> OpCodeInfo {
        use FlowControl as F;
        use OpCodeCategory as C;
        use OperandKind as O;

        match self {
            VmOpCode::NorDword => info("NOR_DWORD", O::None, F::Sequential, 2, 1, true, C::Bitwise),
            VmOpCode::NorQword => info("NOR_QWORD", O::None, F::Sequential, 2, 1, true, C::Bitwise),
            VmOpCode::Cmp => info("CMP", O::None, F::Sequential, 2, 0, true, C::Comparison),
            VmOpCode::CmpDword => info("CMP_DWORD", O::None, F::Sequential, 2, 0, true, C::Comparison),
            VmOpCode::CmpQword => info("CMP_QWORD", O::None, F::Sequential, 2, 0, true, C::Comparison),
            VmOpCode::CmpR32 => info("CMP_R32", O::None, F::Sequential, 2, 0, true, C::Comparison),
            VmOpCode::CmpR64 => info("CMP_R64", O::None, F::Sequential, 2, 0, true, C::Comparison),
            VmOpCode::Jz => info("JZ", O::None, F::ConditionalJump, 2, 0, false, C::ControlFlow),
            VmOpCode::Jnz => info("JNZ", O::None, F::ConditionalJump, 2, 0, false, C::ControlFlow),
            VmOpCode::Jmp => info("JMP", O::None, F::Jump, 1, 0, false, C::ControlFlow),
            VmOpCode::Swt => info("SWT", O::None, F::Switch, 2, 0, false, C::ControlFlow),
            VmOpCode::AddDword => info("ADD_DWORD", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::AddQword => info("ADD_QWORD", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::AddR32 => info("ADD_R32", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::AddR64 => info("ADD_R64", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::SubR32 => info("SUB_R32", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::SubR64 => info("SUB_R64", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::MulDword => info("MUL_DWORD", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::MulQword => info("MUL_QWORD", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::MulR32 => info("MUL_R32", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::MulR64 => info("MUL_R64", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::DivDword => info("DIV_DWORD", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::DivQword => info("DIV_QWORD", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::DivR32 => info("DIV_R32", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::DivR64 => info("DIV_R64", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::RemDword => info("REM_DWORD", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::RemQword => info("REM_QWORD", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::RemR32 => info("REM_R32", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::RemR64 => info("REM_R64", O::None, F::Sequential, 2, 1, true, C::Arithmetic),
            VmOpCode::ShrDword => info("SHR_DWORD", O::None, F::Sequential, 2, 1, true, C::Bitwise),
            VmOpCode::ShrQword => info("SHR_QWORD", O::None, F::Sequential, 2, 1, true, C::Bitwise),
            VmOpCode::ShlDword => info("SHL_DWORD", O::None, F::Sequential, 2, 1, true, C::Bitwise),
            VmOpCode::ShlQword => info("SHL_QWORD", O::None, F::Sequential, 2, 1, true, C::Bitwise),
            VmOpCode::FconvR32R64 => info("FCONV_R32_R64", O::None, F::Sequential, 1, 1, true, C::Conversion),
            VmOpCode::FconvR64R32 => info("FCONV_R64_R32", O::None, F::Sequential, 1, 1, true, C::Conversion),
            VmOpCode::FconvR32 => info("FCONV_R32", O::None, F::Sequential, 1, 1, true, C::Conversion),
            VmOpCode::FconvR64 => info("FCONV_R64", O::None, F::Sequential, 1, 1, true, C::Conversion),
            VmOpCode::IconvPtr => info("ICONV_PTR", O::None, F::Sequential, 1, 1, true, C::Conversion),
            VmOpCode::IconvR64 => info("ICONV_R64", O::None, F::Sequential, 1, 1, true, C::Conversion),
            VmOpCode::LindPtr => info("LIND_PTR", O::None, F::Sequential, 1, 1, false, C::Memory),
            VmOpCode::LindObject => info("LIND_OBJECT", O::None, F::Sequential, 1, 1, false, C::Memory),
            VmOpCode::LindByte => info("LIND_BYTE", O::None, F::Sequential, 1, 1, false, C::Memory),
            VmOpCode::LindWord => info("LIND_WORD", O::None, F::Sequential, 1, 1, false, C::Memory),
            VmOpCode::LindDword => info("LIND_DWORD", O::None, F::Sequential, 1, 1, false, C::Memory),
            VmOpCode::LindQword => info("LIND_QWORD", O::None, F::Sequential, 1, 1, false, C::Memory),
            VmOpCode::SindPtr => info("SIND_PTR", O::None, F::Sequential, 2, 0, false, C::Memory),
            VmOpCode::SindObject => info("SIND_OBJECT", O::None, F::Sequential, 2, 0, false, C::Memory),
            VmOpCode::SindByte => info("SIND_BYTE", O::None, F::Sequential, 2, 0, false, C::Memory),
            VmOpCode::SindWord => info("SIND_WORD", O::None, F::Sequential, 2, 0, false, C::Memory),
            VmOpCode::SindDword => info("SIND_DWORD", O::None, F::Sequential, 2, 0, false, C::Memory),
            VmOpCode::SindQword => info("SIND_QWORD", O::None, F::Sequential, 2, 0, false, C::Memory),
            VmOpCode::Pop => info("POP", O::Register, F::Sequential, 1, 0, false, C::Stack),
            VmOpCode::PushrObject => info("PUSHR_OBJECT", O::Register, F::Sequential, 0, 1, false, C::Stack),
            VmOpCode::PushrByte => info("PUSHR_BYTE", O::Register, F::Sequential, 0, 1, false, C::Stack),
            VmOpCode::PushrWord => info("PUSHR_WORD", O::Register, F::Sequential, 0, 1, false, C::Stack),
            VmOpCode::PushrDword => info("PUSHR_DWORD", O::Register, F::Sequential, 0, 1, false, C::Stack),
            VmOpCode::PushrQword => info("PUSHR_QWORD", O::Register, F::Sequential, 0, 1, false, C::Stack),
            VmOpCode::PushiDword => info("PUSHI_DWORD", O::Dword, F::Sequential, 0, 1, false, C::Stack),
            VmOpCode::PushiQword => info("PUSHI_QWORD", O::Qword, F::Sequential, 0, 1, false, C::Stack),
            VmOpCode::SxByte => info("SX_BYTE", O::None, F::Sequential, 1, 1, false, C::Conversion),
            VmOpCode::SxWord => info("SX_WORD", O::None, F::Sequential, 1, 1, false, C::Conversion),
            VmOpCode::SxDword => info("SX_DWORD", O::None, F::Sequential, 1, 1, false, C::Conversion),
            VmOpCode::Call => info("CALL", O::None, F::Call, 1, 0, false, C::ControlFlow),
            VmOpCode::Ret => info("RET", O::None, F::Return, 1, 0, false, C::ControlFlow),
            VmOpCode::Nop => info("NOP", O::None, F::Sequential, 0, 0, false, C::Misc),
            VmOpCode::Try => info("TRY", O::None, F::Try, 1, 0, false, C::ControlFlow),
            VmOpCode::Leave => info("LEAVE", O::None, F::Leave, 1, 0, false, C::ControlFlow),
            VmOpCode::Vcall => info("VCALL", O::None, F::VCall, 1, 0, false, C::Misc),
        }
    }

    /// Canonical mnemonic of this opcode.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    /// Encoded size of an instruction with this opcode: opcode byte, padding byte, operand.
    #[must_use]
    pub const fn size(self) -> u64 {
        2 + self.info().operand.size()
    }

    /// Returns `true` if the opcode ends the current path without a successor.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self.info().flow,
            FlowControl::Jump
                | FlowControl::ConditionalJump
                | FlowControl::Switch
                | FlowControl::Return
        )
    }
}

impl fmt::Display for VmOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
