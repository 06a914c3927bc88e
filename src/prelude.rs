//! # vmscope Prelude
//!
//! Re-exports of the types needed to load an image, run inference and walk the results.
//! Import this module to get quick access to them.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all vmscope operations
pub use crate::Error;

/// The result type used throughout vmscope
pub use crate::Result;

// ================================================================================================
// Inputs
// ================================================================================================

/// The bytecode blob together with its tables
pub use crate::VmImage;

/// Raw bytecode access
pub use crate::file::BytecodeBlob;

/// Description of the virtual machine and its per-build byte assignment
pub use crate::vm::{
    ECallOpCode, EhType, ExportInfo, ExportSignature, ExportTable, FlowControl, OpcodeTable,
    OpcodeTableBuilder, Reference, ReferenceTable, VmCall, VmFlag, VmOpCode, VmRegister,
};

// ================================================================================================
// Running
// ================================================================================================

/// Tuning knobs
pub use crate::config::InferenceConfig;

/// Diagnostic events
pub use crate::diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics};

/// Whole-image driver
pub use crate::devirtualizer::{
    DevirtualizationReport, DevirtualizedExport, Devirtualizer, ExportFailure,
};

/// Single-export inference
pub use crate::analysis::{InferenceDisassembler, InferenceResult};

// ================================================================================================
// Results
// ================================================================================================

/// Decoded instructions and their annotations
pub use crate::disassembler::{Annotation, VmAssembler, VmInstruction, VmOperand};

/// Symbolic state
pub use crate::analysis::{ProgramState, SymbolicValue};

/// Control flow graphs
pub use crate::analysis::{build_graph, BasicBlock, CfgEdge, CfgEdgeKind, ControlFlowGraph};

/// Graph node ids
pub use crate::utils::graph::NodeId;
