//! Symbolic analysis of virtualized exports.
//!
//! The analysis runs in three layers:
//!
//! - [`InferenceDisassembler`] walks the bytecode of one export with a worklist, executing
//!   each instruction on a symbolic [`ProgramState`]. Every stack slot and register holds a
//!   [`SymbolicValue`], the set of instruction offsets that may have produced it.
//! - A dependency evaluator resolves computed operands (jump targets, call addresses,
//!   helper ids) by replaying the producing instructions on a small concrete machine.
//! - [`cfg`] turns the finished [`InferenceResult`] into a [`ControlFlowGraph`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use vmscope::prelude::*;
//!
//! let image = VmImage::from_file(path, table, exports, references)?;
//! let config = InferenceConfig::default();
//! let diagnostics = Diagnostics::new();
//!
//! let result = InferenceDisassembler::new(&image, &config, &diagnostics).disassemble(1)?;
//! let cfg = build_graph(&result)?;
//! ```

pub mod cfg;
mod evaluator;
mod inference;
mod state;
mod symbolic;
mod vcall;

pub use cfg::{build_graph, BasicBlock, CfgEdge, CfgEdgeKind, ControlFlowGraph};
pub use evaluator::{is_supported, DependencyEvaluator};
pub use inference::{InferenceDisassembler, InferenceResult};
pub use state::{
    ExceptionHandlerFrame, MergeOutcome, ProgramState, RegisterState, StackState,
};
pub use symbolic::SymbolicValue;
