//! Description of the protected virtual machine.
//!
//! This module models everything the inference disassembler needs to know about the VM
//! that is not part of the encrypted bytecode itself: the abstract instruction set, the
//! per-binary byte assignments recovered from the runtime, and the export and reference
//! tables recovered from the custom metadata stream.
//!
//! # Key Components
//!
//! - [`VmOpCode`] / [`OpCodeInfo`] - Abstract instruction set with operand and flow metadata
//! - [`VmRegister`] / [`VmFlags`] - Register file and flags layout
//! - [`VmCall`] / [`ECallOpCode`] / [`EhType`] - Helper calls and exception handler kinds
//! - [`OpcodeTable`] / [`OpcodeTableBuilder`] - Validated byte to semantic mapping
//! - [`ExportTable`] / [`ExportInfo`] - Exported VM functions
//! - [`ReferenceTable`] / [`Reference`] - Metadata references used by helper calls
//!
//! # Thread Safety
//!
//! All types are plain data, `Send` and `Sync`, and are shared by reference across exports.

mod call;
mod export;
mod opcode;
mod reference;
mod register;
mod table;

pub use call::{ECallOpCode, EhType, VmCall};
pub use export::{ExportInfo, ExportSignature, ExportTable};
pub use opcode::{FlowControl, OpCodeCategory, OpCodeInfo, OperandKind, StackBehavior, VmOpCode};
pub use reference::{FieldReference, MethodReference, Reference, ReferenceTable, TypeReference};
pub use register::{VmFlag, VmFlags, VmRegister};
pub use table::{OpcodeTable, OpcodeTableBuilder, TableEntry};
