//! Stack effects and annotations of `VCALL` helpers.
//!
//! Every helper takes its arguments from the evaluation stack, starting with the helper id
//! itself. Ids and metadata reference ids are pushed as (possibly obfuscated) constants, so
//! they are resolved through the [`DependencyEvaluator`] like jump targets.

use crate::{
    analysis::{DependencyEvaluator, ProgramState, SymbolicValue},
    disassembler::{
        Annotation, CastAnnotation, ECallAnnotation, ReferenceAnnotation, VCallAnnotation,
        VmInstruction,
    },
    vm::{ECallOpCode, OpcodeTable, ReferenceTable, VmCall},
    Error, Result,
};

/// Bits 30 and 31 of an `ECALL` method id select the call flavour.
const ECALL_SELECTOR_SHIFT: u32 = 30;
const ECALL_ID_MASK: u64 = 0x3FFF_FFFF;

/// Flag bit carried by the type ids of `CAST` and `UNBOX`.
const TYPE_FLAG: u64 = 0x8000_0000;

/// Applies `VCALL` helpers to a program state.
pub(crate) struct VCallResolver<'a> {
    table: &'a OpcodeTable,
    references: &'a ReferenceTable,
    evaluator: &'a DependencyEvaluator<'a>,
}

impl<'a> VCallResolver<'a> {
    pub(crate) fn new(
        table: &'a OpcodeTable,
        references: &'a ReferenceTable,
        evaluator: &'a DependencyEvaluator<'a>,
    ) -> Self {
        VCallResolver {
            table,
            references,
            evaluator,
        }
    }

    /// Executes the `VCALL` `instruction` on `post`, which starts as a copy of the state
    /// before the instruction.
    ///
    /// Returns `false` if the helper ends the current path (`EXIT`, `THROW`).
    pub(crate) fn apply(&self, instruction: &mut VmInstruction, post: &mut ProgramState) -> Result<bool> {
        let offset = instruction.offset;
        let id_value = pop(instruction, post)?;
        let id = self.evaluator.resolve_single(&id_value, offset, "vcall id")?;
        let call = self
            .table
            .vmcall(id)
            .ok_or_else(|| unresolvable_error!(offset, "unknown vcall id 0x{:x}", id))?;

        let continues = match call {
            VmCall::Ecall => {
                let annotation = self.ecall(instruction, post)?;
                instruction.annotation = Some(Annotation::ECall(annotation));
                true
            }
            VmCall::Cast => {
                let raw = self.resolve(instruction, post, "cast type")?;
                let target = self.reference(raw & !TYPE_FLAG, offset)?;
                pop(instruction, post)?;
                push_result(post, offset);
                instruction.annotation = Some(Annotation::Cast(CastAnnotation {
                    target,
                    is_safe: raw & TYPE_FLAG != 0,
                }));
                true
            }
            VmCall::Box => {
                let raw = self.resolve(instruction, post, "box type")?;
                let target = self.reference(raw, offset)?;
                pop(instruction, post)?;
                push_result(post, offset);
                instruction.annotation = Some(Annotation::Box(target));
                true
            }
            VmCall::Unbox => {
                let raw = self.resolve(instruction, post, "unbox type")?;
                let target = self.reference(raw & !TYPE_FLAG, offset)?;
                pop(instruction, post)?;
                push_result(post, offset);
                self.annotate(instruction, call, Some(target), Some(raw));
                true
            }
            VmCall::Ldftn => {
                let raw = self.resolve(instruction, post, "ldftn method")?;
                let method = self.reference(raw, offset)?;
                pop(instruction, post)?;
                push_result(post, offset);
                instruction.annotation = Some(Annotation::Ldftn(method));
                true
            }
            VmCall::Ldfld => {
                let raw = self.resolve(instruction, post, "field")?;
                let field = self.reference(raw, offset)?;
                pop(instruction, post)?;
                push_result(post, offset);
                self.annotate(instruction, call, Some(field), Some(raw));
                true
            }
            VmCall::Stfld => {
                let raw = self.resolve(instruction, post, "field")?;
                let field = self.reference(raw, offset)?;
                pop(instruction, post)?;
                pop(instruction, post)?;
                self.annotate(instruction, call, Some(field), Some(raw));
                true
            }
            VmCall::Initobj => {
                let raw = self.resolve(instruction, post, "initobj type")?;
                let target = self.reference(raw, offset)?;
                pop(instruction, post)?;
                self.annotate(instruction, call, Some(target), Some(raw));
                true
            }
            VmCall::Token | VmCall::Sizeof => {
                let raw = self.resolve(instruction, post, "token")?;
                let reference = self.reference(raw, offset)?;
                push_result(post, offset);
                self.annotate(instruction, call, Some(reference), Some(raw));
                true
            }
            VmCall::Localloc | VmCall::Ckfinite => {
                pop(instruction, post)?;
                push_result(post, offset);
                self.annotate(instruction, call, None, None);
                true
            }
            VmCall::Ckoverflow => {
                pop(instruction, post)?;
                self.annotate(instruction, call, None, None);
                true
            }
            VmCall::Rangechk => {
                for _ in 0..3 {
                    pop(instruction, post)?;
                }
                push_result(post, offset);
                self.annotate(instruction, call, None, None);
                true
            }
            VmCall::Throw => {
                let rethrow = self.resolve(instruction, post, "throw flag")?;
                if rethrow == 0 {
                    pop(instruction, post)?;
                }
                self.annotate(instruction, call, None, Some(rethrow));
                false
            }
            VmCall::Exit => {
                self.annotate(instruction, call, None, None);
                false
            }
            VmCall::Break => {
                self.annotate(instruction, call, None, None);
                true
            }
        };

        Ok(continues)
    }

    fn ecall(&self, instruction: &mut VmInstruction, post: &mut ProgramState) -> Result<ECallAnnotation> {
        let offset = instruction.offset;
        let raw = self.resolve(instruction, post, "ecall method")?;

        let selector = ((raw >> ECALL_SELECTOR_SHIFT) & 0b11) as u8;
        let opcode = self
            .table
            .ecall(selector)
            .ok_or_else(|| unresolvable_error!(offset, "unknown ecall selector {}", selector))?;

        let method = self.reference(raw & ECALL_ID_MASK, offset)?;
        let signature = method.reference.as_method().cloned().ok_or_else(|| {
            unresolvable_error!(offset, "ecall target {} is not a method", method.reference)
        })?;

        let constrained = if opcode == ECallOpCode::CallvirtConstrained {
            let raw = self.resolve(instruction, post, "constraint type")?;
            Some(self.reference(raw, offset)?)
        } else {
            None
        };

        let mut arguments = signature.parameter_count;
        if signature.has_this && opcode != ECallOpCode::Newobj {
            arguments += 1;
        }
        for _ in 0..arguments {
            pop(instruction, post)?;
        }

        if signature.returns_value || opcode == ECallOpCode::Newobj {
            push_result(post, offset);
        }

        Ok(ECallAnnotation {
            opcode,
            method,
            constrained,
        })
    }

    /// Pops the next argument and reduces it to a single constant.
    fn resolve(&self, instruction: &mut VmInstruction, post: &mut ProgramState, what: &str) -> Result<u64> {
        let value = pop(instruction, post)?;
        self.evaluator
            .resolve_single(&value, instruction.offset, what)
    }

    fn reference(&self, raw: u64, offset: u64) -> Result<ReferenceAnnotation> {
        let id = u32::try_from(raw)
            .map_err(|_| unresolvable_error!(offset, "reference id 0x{:x} exceeds 32 bits", raw))?;
        let reference = self
            .references
            .get(id)
            .ok_or(Error::ReferenceNotFound { id, offset })?;

        Ok(ReferenceAnnotation {
            id,
            reference: reference.clone(),
        })
    }

    fn annotate(
        &self,
        instruction: &mut VmInstruction,
        call: VmCall,
        reference: Option<ReferenceAnnotation>,
        raw_id: Option<u64>,
    ) {
        instruction.annotation = Some(Annotation::VCall(VCallAnnotation {
            call,
            reference,
            raw_id,
        }));
    }
}

/// Pops a slot and records it as a dependency of `instruction`.
pub(crate) fn pop(instruction: &mut VmInstruction, post: &mut ProgramState) -> Result<SymbolicValue> {
    let value = post.stack.pop(instruction.offset)?;
    instruction.dependencies.push(value.clone());
    Ok(value)
}

fn push_result(post: &mut ProgramState, offset: u64) {
    post.stack.push(SymbolicValue::from_offset(offset));
}
