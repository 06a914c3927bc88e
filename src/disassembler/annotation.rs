//! Semantic annotations attached to resolved instructions.
//!
//! Jumps, calls and helper calls carry operands that are computed at runtime. Once inference
//! resolves them, the concrete values are recorded as an [`Annotation`] on the consuming
//! instruction. The variant set is closed so downstream stages can match it exhaustively.

use std::fmt;

use crate::vm::{ECallOpCode, ExportSignature, Reference, VmCall};

/// A resolved metadata reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceAnnotation {
    /// Reference table id
    pub id: u32,
    /// The descriptor
    pub reference: Reference,
}

impl fmt::Display for ReferenceAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [0x{:08x}]", self.reference, self.id)
    }
}

/// Resolved targets of `JMP`, `JZ`/`JNZ` and `SWT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpAnnotation {
    /// Candidate targets; the index is the arm of the edge in the control flow graph.
    /// For conditional jumps the taken targets come first and the fallthrough last; for
    /// switches the table entries come first and the default (fallthrough) last.
    pub targets: Vec<u64>,
}

/// Resolved `CALL` into another VM function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAnnotation {
    /// Callee code offset
    pub address: u64,
    /// Callee signature, when the callee is a known export
    pub signature: Option<ExportSignature>,
    /// Callee export id, when the callee is a known export
    pub export: Option<u32>,
    /// The callee's signature carries the instance flag of the opcode table
    pub is_instance: bool,
}

/// Resolved `CAST` helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastAnnotation {
    /// Target type
    pub target: ReferenceAnnotation,
    /// `isinst` semantics (null on failure) instead of `castclass`
    pub is_safe: bool,
}

/// Resolved `ECALL` helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ECallAnnotation {
    /// Call flavour
    pub opcode: ECallOpCode,
    /// Called method
    pub method: ReferenceAnnotation,
    /// Constraint type, for [`ECallOpCode::CallvirtConstrained`]
    pub constrained: Option<ReferenceAnnotation>,
}

/// Any other `VCALL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VCallAnnotation {
    /// The helper
    pub call: VmCall,
    /// Resolved reference, for helpers that name a type or field
    pub reference: Option<ReferenceAnnotation>,
    /// The resolved raw argument (reference id with flags, or the rethrow flag)
    pub raw_id: Option<u64>,
}

/// The closed set of instruction annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// Jump candidates
    Jump(JumpAnnotation),
    /// VM function call
    Call(CallAnnotation),
    /// `BOX` of the referenced type
    Box(ReferenceAnnotation),
    /// `CAST` to the referenced type
    Cast(CastAnnotation),
    /// External method call
    ECall(ECallAnnotation),
    /// Function pointer load
    Ldftn(ReferenceAnnotation),
    /// Remaining helpers
    VCall(VCallAnnotation),
}

impl Annotation {
    /// Jump candidates, if this is a jump annotation.
    #[must_use]
    pub fn jump_targets(&self) -> Option<&[u64]> {
        match self {
            Annotation::Jump(jump) => Some(&jump.targets),
            _ => None,
        }
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Annotation::Jump(jump) => {
                f.write_str("-> ")?;
                for (i, target) in jump.targets.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{target:04x}")?;
                }
                Ok(())
            }
            Annotation::Call(call) => match call.export {
                Some(export) if call.is_instance => {
                    write!(f, "call instance export {export} @{:04x}", call.address)
                }
                Some(export) => write!(f, "call export {export} @{:04x}", call.address),
                None => write!(f, "call @{:04x}", call.address),
            },
            Annotation::Box(reference) => write!(f, "box {reference}"),
            Annotation::Cast(cast) => {
                let mnemonic = if cast.is_safe { "isinst" } else { "castclass" };
                write!(f, "{mnemonic} {}", cast.target)
            }
            Annotation::ECall(ecall) => {
                if let Some(constrained) = &ecall.constrained {
                    write!(f, "constrained {constrained} ")?;
                }
                write!(f, "{} {}", ecall.opcode, ecall.method)
            }
            Annotation::Ldftn(reference) => write!(f, "ldftn {reference}"),
            Annotation::VCall(vcall) => {
                write!(f, "{}", vcall.call)?;
                match (&vcall.reference, vcall.raw_id) {
                    (Some(reference), _) => write!(f, " {reference}"),
                    (None, Some(raw)) => write!(f, " {raw}"),
                    (None, None) => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::TypeReference;

    fn int32() -> ReferenceAnnotation {
        ReferenceAnnotation {
            id: 5,
            reference: Reference::Type(TypeReference {
                name: "System.Int32".to_string(),
            }),
        }
    }

    #[test]
    fn jump_display_lists_arms() {
        let jump = Annotation::Jump(JumpAnnotation {
            targets: vec![0x20, 0x0c],
        });
        assert_eq!(jump.to_string(), "-> 0020, 000c");
        assert_eq!(jump.jump_targets(), Some(&[0x20, 0x0c][..]));
    }

    #[test]
    fn reference_display() {
        assert_eq!(
            Annotation::Box(int32()).to_string(),
            "box System.Int32 [0x00000005]"
        );
        let cast = Annotation::Cast(CastAnnotation {
            target: int32(),
            is_safe: true,
        });
        assert_eq!(cast.to_string(), "isinst System.Int32 [0x00000005]");
        assert!(cast.jump_targets().is_none());
    }

    #[test]
    fn vcall_display() {
        let throw = Annotation::VCall(VCallAnnotation {
            call: VmCall::Throw,
            reference: None,
            raw_id: Some(1),
        });
        assert_eq!(throw.to_string(), "THROW 1");
    }
}
