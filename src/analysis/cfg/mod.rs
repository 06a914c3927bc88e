//! Control flow graphs of devirtualized exports.
//!
//! The graph is built after inference from the decoded instructions, the block headers the
//! inference discovered and the protected regions it entered. It reuses the generic
//! [`crate::utils::graph::DirectedGraph`] for storage and traversal.
//!
//! # Edge Types
//!
//! - **Fallthrough**: sequential flow into the next block
//! - **Jump arm**: one resolved target of `JMP`, `JZ`/`JNZ` or `SWT`, numbered in
//!   annotation order
//! - **Exception handler**: from the block holding a `TRY` into its handler or filter
//!
//! # Examples
//!
//! ```rust,ignore
//! use vmscope::analysis::build_graph;
//!
//! let result = disassembler.disassemble(1)?;
//! let cfg = build_graph(&result)?;
//!
//! for node in cfg.reverse_postorder() {
//!     print!("{}", cfg.block(node).unwrap());
//! }
//! ```

mod block;
mod edge;
mod graph;

pub use block::BasicBlock;
pub use edge::{CfgEdge, CfgEdgeKind};
pub use graph::{build_graph, ControlFlowGraph};
