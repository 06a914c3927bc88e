//! VM bytecode decoding and encoding.
//!
//! This module provides the low-level building blocks of the inference disassembler: the
//! rolling-key [`StreamDecoder`], the [`VmInstruction`] representation, the closed set of
//! [`Annotation`]s attached to resolved instructions, and the inverse [`VmAssembler`].
//!
//! Control flow discovery lives in [`crate::analysis`]; decoding is never done ahead of
//! inference because the key at each offset depends on the path reaching it.
//!
//! # Key Types
//!
//! - [`StreamDecoder`] - Decodes one instruction at a known position and key
//! - [`VmInstruction`] / [`VmOperand`] - A decoded instruction
//! - [`Annotation`] - Resolved semantics of computed operands
//! - [`VmAssembler`] - Encodes and encrypts instructions

mod annotation;
mod assembler;
mod decoder;
mod instruction;

pub use annotation::{
    Annotation, CallAnnotation, CastAnnotation, ECallAnnotation, JumpAnnotation,
    ReferenceAnnotation, VCallAnnotation,
};
pub use assembler::{Labels, VmAssembler};
pub use decoder::{next_key, replay_key, StreamDecoder};
pub use instruction::{VmInstruction, VmOperand};
