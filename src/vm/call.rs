//! Runtime helper calls (`VCALL`), their `ECALL` sub-opcodes and exception handler kinds.

use std::fmt;

use strum::{EnumCount, EnumIter};

/// Runtime helpers reachable through the `VCALL` opcode.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount)]
pub enum VmCall {
    Exit,
    Break,
    Ecall,
    Cast,
    Ckfinite,
    Ckoverflow,
    Rangechk,
    Initobj,
    Ldfld,
    Ldftn,
    Token,
    Throw,
    Sizeof,
    Stfld,
    Box,
    Unbox,
    Localloc,
}

impl VmCall {
    /// Canonical name of the helper.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            VmCall::Exit => "EXIT",
            VmCall::Break => "BREAK",
            VmCall::Ecall => "ECALL",
            VmCall::Cast => "CAST",
            VmCall::Ckfinite => "CKFINITE",
            VmCall::Ckoverflow => "CKOVERFLOW",
            VmCall::Rangechk => "RANGECHK",
            VmCall::Initobj => "INITOBJ",
            VmCall::Ldfld => "LDFLD",
            VmCall::Ldftn => "LDFTN",
            VmCall::Token => "TOKEN",
            VmCall::Throw => "THROW",
            VmCall::Sizeof => "SIZEOF",
            VmCall::Stfld => "STFLD",
            VmCall::Box => "BOX",
            VmCall::Unbox => "UNBOX",
            VmCall::Localloc => "LOCALLOC",
        }
    }
}

impl fmt::Display for VmCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Call flavours of the `ECALL` helper, selected by bits 30-31 of the method id.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount)]
pub enum ECallOpCode {
    Call,
    Callvirt,
    Newobj,
    CallvirtConstrained,
}

impl ECallOpCode {
    /// Canonical name of the call flavour.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ECallOpCode::Call => "CALL",
            ECallOpCode::Callvirt => "CALLVIRT",
            ECallOpCode::Newobj => "NEWOBJ",
            ECallOpCode::CallvirtConstrained => "CALLVIRT_CONSTRAINED",
        }
    }
}

impl fmt::Display for ECallOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kinds of exception handlers registered by `TRY`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount)]
pub enum EhType {
    Catch,
    Filter,
    Fault,
    Finally,
}

impl EhType {
    /// Canonical name of the handler kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            EhType::Catch => "CATCH",
            EhType::Filter => "FILTER",
            EhType::Fault => "FAULT",
            EhType::Finally => "FINALLY",
        }
    }
}

impl fmt::Display for EhType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
