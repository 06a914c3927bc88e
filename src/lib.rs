// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # vmscope
//!
//! An inference disassembler for virtualized .NET bytecode.
//!
//! Virtualizing protectors compile method bodies into the instruction set of a private
//! stack machine and ship an interpreter alongside. The bytecode is encrypted with a
//! rolling key that depends on every byte decoded before it, the byte values of opcodes,
//! registers and helper calls are shuffled per build, and branch targets are never stored
//! as operands. They are computed at run time from values on the stack.
//!
//! `vmscope` recovers the code anyway. Given the shuffled byte assignment, the export table
//! and the encrypted blob, it walks every export with an abstract interpreter that tracks
//! where each stack slot and register came from, replays the producing instructions to
//! resolve computed jump targets, and builds a control flow graph of the result.
//!
//! ## Features
//!
//! - **Rolling-key decoding** - Path-sensitive decryption of the instruction stream
//! - **Provenance tracking** - Symbolic states with per-slot sets of producing offsets
//! - **Computed branch resolution** - Bounded concrete replay of target computations
//! - **Helper call annotations** - `VCALL` helpers resolved against a reference table
//! - **Exception handling** - Protected regions and handler entries followed like branches
//! - **Control flow graphs** - Basic blocks, typed edges and Graphviz output
//! - **Parallel processing** - Exports are independent and can run on all cores
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vmscope::prelude::*;
//!
//! # fn tables() -> (OpcodeTable, ExportTable, ReferenceTable) { unimplemented!() }
//! let (table, exports, references) = tables();
//! let image = VmImage::from_file("bytecode.bin", table, exports, references)?;
//!
//! let mut devirtualizer = Devirtualizer::new(image, InferenceConfig::default());
//! let report = devirtualizer.run()?;
//!
//! for (id, export) in report.exports() {
//!     println!("export {id}: {} blocks", export.cfg.block_count());
//! }
//! for failure in report.failures() {
//!     println!("{failure}");
//! }
//! # Ok::<(), vmscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`vm`] - Description of the virtual machine: opcodes, registers, helper calls and the
//!   per-build byte assignment in [`vm::OpcodeTable`]
//! - [`file`] - The bytecode blob, memory mapped or in memory
//! - [`disassembler`] - Decoding, encoding and annotated instructions
//! - [`analysis`] - Symbolic states, inference and control flow graphs
//! - [`devirtualizer`] - Whole-image driver
//! - [`config`] and [`diagnostics`] - Tuning knobs and the event sink
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Error Handling
//!
//! Most failures are local to one export: an undecodable byte, a jump target that cannot be
//! computed, an exhausted iteration budget. The driver records those and moves on. Errors
//! that mean the tables or keys are wrong for the whole image, such as two paths reaching
//! an offset with different stack depths, are fatal and returned to the caller. See
//! [`Error::is_fatal`].

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use vmscope::prelude::*;
///
/// let config = InferenceConfig::default().with_parallel(true);
/// assert!(config.parallel);
/// ```
pub mod prelude;

/// Symbolic analysis: program states, inference and control flow graphs.
pub mod analysis;

/// Inference tuning knobs.
pub mod config;

/// Diagnostic events collected while disassembling.
pub mod diagnostics;

/// Decoding and encoding of VM instructions.
///
/// - [`disassembler::StreamDecoder`] - Decrypts and decodes one instruction at a position
/// - [`disassembler::VmAssembler`] - Encrypts instructions, the inverse of the decoder
/// - [`disassembler::VmInstruction`] - A decoded instruction with state and annotation
/// - [`disassembler::Annotation`] - Resolved meaning of computed operands
pub mod disassembler;

/// Whole-image driver.
pub mod devirtualizer;

/// Access to the raw bytecode blob.
pub mod file;

/// The inputs of a devirtualization run.
pub mod image;

/// Generic graph structures and byte helpers.
pub mod utils;

/// Description of the virtual machine.
pub mod vm;

/// `vmscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `vmscope` Error type
///
/// # Examples
///
/// ```rust
/// use vmscope::Error;
///
/// let error = Error::StackUnderflow { offset: 0x40 };
/// assert_eq!(error.offset(), Some(0x40));
/// assert!(!error.is_fatal());
/// ```
pub use error::Error;

/// The inputs of a devirtualization run. See [`image::VmImage`].
pub use image::VmImage;
