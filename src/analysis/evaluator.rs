//! Bounded concrete evaluation of instruction provenance.
//!
//! Jump targets, call addresses, helper ids and reference ids are never stored as operands
//! of the consuming instruction. They are computed by a short chain of pushes and
//! arithmetic that precedes it. The [`DependencyEvaluator`] reconstructs that chain from the
//! recorded dependencies of each instruction and replays it on a tiny concrete machine.
//!
//! Only a fixed arithmetic subset is supported: `PUSHI_*`, `PUSHR_*`, `POP`, `ADD_*`,
//! `NOR_*`, `MUL_*`, `SHL_*`, `SHR_*` (DWORD and QWORD forms), `SX_*` and `NOP`. Anything
//! else in the chain (a memory load, a call result, a comparison) means the value is not a
//! compile-time constant of the protected code, and evaluation fails. So does reading a
//! register that was never written on the path, unless it is a calling-convention register
//! with a configured entry value.

use std::collections::{BTreeMap, BTreeSet};

use strum::EnumCount;

use crate::{
    analysis::SymbolicValue,
    config::InferenceConfig,
    disassembler::VmInstruction,
    vm::{VmOpCode, VmRegister},
    Result,
};

/// Returns `true` if the evaluator can execute `opcode`.
#[must_use]
pub const fn is_supported(opcode: VmOpCode) -> bool {
    matches!(
        opcode,
        VmOpCode::PushiDword
            | VmOpCode::PushiQword
            | VmOpCode::PushrObject
            | VmOpCode::PushrByte
            | VmOpCode::PushrWord
            | VmOpCode::PushrDword
            | VmOpCode::PushrQword
            | VmOpCode::Pop
            | VmOpCode::AddDword
            | VmOpCode::AddQword
            | VmOpCode::NorDword
            | VmOpCode::NorQword
            | VmOpCode::MulDword
            | VmOpCode::MulQword
            | VmOpCode::ShlDword
            | VmOpCode::ShlQword
            | VmOpCode::ShrDword
            | VmOpCode::ShrQword
            | VmOpCode::SxByte
            | VmOpCode::SxWord
            | VmOpCode::SxDword
            | VmOpCode::Nop
    )
}

const fn is_register_read(opcode: VmOpCode) -> bool {
    matches!(
        opcode,
        VmOpCode::PushrObject
            | VmOpCode::PushrByte
            | VmOpCode::PushrWord
            | VmOpCode::PushrDword
            | VmOpCode::PushrQword
    )
}

/// The concrete machine the closure is replayed on. Registers start with the configured
/// calling-convention values; every other register is unset until a `POP` writes it.
struct Machine {
    registers: [Option<u64>; VmRegister::COUNT],
    stack: Vec<u64>,
    consumer: u64,
}

impl Machine {
    fn read(&self, instruction: &VmInstruction, register: VmRegister) -> Result<u64> {
        self.registers[register.index()].ok_or_else(|| {
            unresolvable_error!(
                self.consumer,
                "{} at 0x{:08x} reads {}, which has no known value",
                instruction.opcode,
                instruction.offset,
                register
            )
        })
    }

    fn pop(&mut self) -> Result<u64> {
        self.stack.pop().ok_or_else(|| {
            unresolvable_error!(self.consumer, "dependency chain underflows its stack")
        })
    }

    fn binary(&mut self, op: impl FnOnce(u64, u64) -> u64) -> Result<()> {
        let op2 = self.pop()?;
        let op1 = self.pop()?;
        self.stack.push(op(op1, op2));
        Ok(())
    }

    fn unary(&mut self, op: impl FnOnce(u64) -> u64) -> Result<()> {
        let value = self.pop()?;
        self.stack.push(op(value));
        Ok(())
    }

    fn execute(&mut self, instruction: &VmInstruction) -> Result<()> {
        let register = |instruction: &VmInstruction| {
            instruction.operand.register().ok_or_else(|| {
                unresolvable_error!(instruction.offset, "{} without register", instruction.opcode)
            })
        };

        match instruction.opcode {
            VmOpCode::PushiDword | VmOpCode::PushiQword => {
                let value = instruction.operand.immediate().ok_or_else(|| {
                    unresolvable_error!(instruction.offset, "push without immediate")
                })?;
                self.stack.push(value);
            }
            VmOpCode::PushrObject | VmOpCode::PushrQword => {
                let value = self.read(instruction, register(instruction)?)?;
                self.stack.push(value);
            }
            VmOpCode::PushrDword => {
                let value = self.read(instruction, register(instruction)?)?;
                self.stack.push(value & 0xFFFF_FFFF);
            }
            VmOpCode::PushrWord => {
                let value = self.read(instruction, register(instruction)?)?;
                self.stack.push(value & 0xFFFF);
            }
            VmOpCode::PushrByte => {
                let value = self.read(instruction, register(instruction)?)?;
                self.stack.push(value & 0xFF);
            }
            VmOpCode::Pop => {
                let target = register(instruction)?;
                self.registers[target.index()] = Some(self.pop()?);
            }
            VmOpCode::AddDword => self.binary(|a, b| u64::from((a as u32).wrapping_add(b as u32)))?,
            VmOpCode::AddQword => self.binary(u64::wrapping_add)?,
            VmOpCode::NorDword => self.binary(|a, b| u64::from(!((a as u32) | (b as u32))))?,
            VmOpCode::NorQword => self.binary(|a, b| !(a | b))?,
            VmOpCode::MulDword => self.binary(|a, b| u64::from((a as u32).wrapping_mul(b as u32)))?,
            VmOpCode::MulQword => self.binary(u64::wrapping_mul)?,
            VmOpCode::ShlDword => {
                self.binary(|a, b| u64::from((a as u32).wrapping_shl(b as u32)))?;
            }
            VmOpCode::ShlQword => self.binary(|a, b| a.wrapping_shl(b as u32))?,
            VmOpCode::ShrDword => {
                self.binary(|a, b| u64::from((a as u32).wrapping_shr(b as u32)))?;
            }
            VmOpCode::ShrQword => self.binary(|a, b| a.wrapping_shr(b as u32))?,
            VmOpCode::SxByte => self.unary(|v| u64::from(i32::from(v as u8 as i8) as u32))?,
            VmOpCode::SxWord => self.unary(|v| u64::from(i32::from(v as u16 as i16) as u32))?,
            VmOpCode::SxDword => self.unary(|v| i64::from(v as u32 as i32) as u64)?,
            VmOpCode::Nop => {}
            other => {
                return Err(unresolvable_error!(
                    instruction.offset,
                    "unsupported pattern: {} in dependency chain",
                    other
                ))
            }
        }
        Ok(())
    }
}

/// Resolves symbolic values to concrete numbers by replaying their provenance.
///
/// # Examples
///
/// ```rust,ignore
/// let evaluator = DependencyEvaluator::new(&instructions, &config);
/// let targets = evaluator.resolve(&jump_target, jump_offset)?;
/// ```
pub struct DependencyEvaluator<'a> {
    instructions: &'a BTreeMap<u64, VmInstruction>,
    config: &'a InferenceConfig,
}

impl<'a> DependencyEvaluator<'a> {
    /// Creates an evaluator over the instructions discovered so far.
    #[must_use]
    pub fn new(instructions: &'a BTreeMap<u64, VmInstruction>, config: &'a InferenceConfig) -> Self {
        DependencyEvaluator {
            instructions,
            config,
        }
    }

    /// Resolves `value`, consumed by the instruction at `consumer`, to its candidate
    /// concrete values.
    ///
    /// Each source of `value` is evaluated separately; the results are sorted and
    /// de-duplicated.
    ///
    /// # Errors
    /// Returns [`crate::Error::Unresolvable`] if `value` has no provenance, the chain of any
    /// source contains an unsupported opcode, a value with ambiguous or missing provenance,
    /// a read of an unset register, or exceeds the configured closure limit.
    pub fn resolve(&self, value: &SymbolicValue, consumer: u64) -> Result<Vec<u64>> {
        if value.is_unknown() {
            return Err(unresolvable_error!(
                consumer,
                "consumed value has no provenance"
            ));
        }

        let mut candidates = value
            .iter()
            .map(|source| self.evaluate(source, consumer))
            .collect::<Result<Vec<u64>>>()?;
        candidates.sort_unstable();
        candidates.dedup();
        Ok(candidates)
    }

    /// Resolves `value` to exactly one concrete value.
    ///
    /// # Errors
    /// As [`DependencyEvaluator::resolve`], and if more than one candidate remains.
    pub fn resolve_single(&self, value: &SymbolicValue, consumer: u64, what: &str) -> Result<u64> {
        match self.resolve(value, consumer)?.as_slice() {
            [single] => Ok(*single),
            candidates => Err(unresolvable_error!(
                consumer,
                "{} has {} candidate values",
                what,
                candidates.len()
            )),
        }
    }

    /// Evaluates the value pushed by the instruction at `source`.
    ///
    /// # Errors
    /// See [`DependencyEvaluator::resolve`].
    pub fn evaluate(&self, source: u64, consumer: u64) -> Result<u64> {
        let closure = self.closure(source, consumer)?;

        let mut machine = Machine {
            registers: self.config.initial_registers,
            stack: Vec::with_capacity(closure.len()),
            consumer,
        };
        for offset in &closure {
            if let Some(instruction) = self.instructions.get(offset) {
                machine.execute(instruction)?;
            }
        }

        machine
            .stack
            .last()
            .copied()
            .ok_or_else(|| unresolvable_error!(consumer, "dependency chain produces no value"))
    }

    /// Collects the transitive dependencies of `source`, ordered by offset.
    fn closure(&self, source: u64, consumer: u64) -> Result<BTreeSet<u64>> {
        let mut closure = BTreeSet::new();
        let mut pending = vec![source];

        while let Some(offset) = pending.pop() {
            if !closure.insert(offset) {
                continue;
            }
            if closure.len() > self.config.max_dependency_closure {
                return Err(unresolvable_error!(
                    consumer,
                    "dependency closure exceeds {} instructions",
                    self.config.max_dependency_closure
                ));
            }

            let instruction = self.instructions.get(&offset).ok_or_else(|| {
                unresolvable_error!(consumer, "dependency at 0x{:08x} was never decoded", offset)
            })?;
            if !is_supported(instruction.opcode) {
                return Err(unresolvable_error!(
                    consumer,
                    "unsupported pattern: {} at 0x{:08x} in dependency chain",
                    instruction.opcode,
                    offset
                ));
            }

            for dependency in &instruction.dependencies {
                match dependency.single() {
                    Some(producer) => pending.push(producer),
                    None if dependency.is_unknown() && is_register_read(instruction.opcode) => {}
                    None if dependency.is_unknown() => {
                        return Err(unresolvable_error!(
                            consumer,
                            "{} at 0x{:08x} consumes a value of unknown origin",
                            instruction.opcode,
                            offset
                        ))
                    }
                    None => {
                        return Err(unresolvable_error!(
                            consumer,
                            "{} at 0x{:08x} consumes a value with {} possible sources",
                            instruction.opcode,
                            offset,
                            dependency.len()
                        ))
                    }
                }
            }
        }

        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disassembler::VmOperand, Error};

    /// Builds a straight-line program, wiring dependencies the way inference does.
    fn program(ops: &[(VmOpCode, VmOperand)]) -> BTreeMap<u64, VmInstruction> {
        let mut instructions = BTreeMap::new();
        let mut stack: Vec<SymbolicValue> = Vec::new();
        let mut registers: BTreeMap<VmRegister, SymbolicValue> = BTreeMap::new();
        let mut offset = 0x10;

        for &(opcode, operand) in ops {
            let mut instruction = VmInstruction::new(offset, 0, opcode, operand);
            let info = opcode.info();
            match opcode {
                VmOpCode::PushrObject
                | VmOpCode::PushrByte
                | VmOpCode::PushrWord
                | VmOpCode::PushrDword
                | VmOpCode::PushrQword => {
                    let register = operand.register().unwrap();
                    instruction
                        .dependencies
                        .push(registers.get(&register).cloned().unwrap_or_default());
                }
                VmOpCode::Pop => {
                    instruction.dependencies.push(stack.pop().unwrap());
                    registers.insert(
                        operand.register().unwrap(),
                        SymbolicValue::from_offset(offset),
                    );
                }
                _ => {
                    for _ in 0..info.stack.pops {
                        instruction
                            .dependencies
                            .push(stack.pop().unwrap_or_default());
                    }
                }
            }
            for _ in 0..info.stack.pushes {
                stack.push(SymbolicValue::from_offset(offset));
            }
            offset = instruction.next_offset();
            instructions.insert(instruction.offset, instruction);
        }
        instructions
    }

    fn last_offset(instructions: &BTreeMap<u64, VmInstruction>) -> u64 {
        *instructions.keys().last().unwrap()
    }

    #[test]
    fn constant_push() {
        let instructions = program(&[(VmOpCode::PushiDword, VmOperand::Dword(26))]);
        let config = InferenceConfig::default();
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        assert_eq!(evaluator.evaluate(0x10, 0x100).unwrap(), 26);
    }

    #[test]
    fn register_plus_offset() {
        let instructions = program(&[
            (VmOpCode::PushrQword, VmOperand::Register(VmRegister::Bp)),
            (VmOpCode::PushiDword, VmOperand::Dword(8)),
            (VmOpCode::AddQword, VmOperand::None),
        ]);
        let config = InferenceConfig::default().with_initial_register(VmRegister::Bp, 0x4000);
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        let add = last_offset(&instructions);
        let value = SymbolicValue::from_offset(add);
        assert_eq!(evaluator.resolve(&value, 0x100).unwrap(), vec![0x4008]);
    }

    #[test]
    fn dword_arithmetic_truncates() {
        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(0xFFFF_FFFF)),
            (VmOpCode::PushiDword, VmOperand::Dword(2)),
            (VmOpCode::AddDword, VmOperand::None),
        ]);
        let config = InferenceConfig::default();
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        assert_eq!(evaluator.evaluate(last_offset(&instructions), 0).unwrap(), 1);
    }

    #[test]
    fn nor_shift_and_sign_extension() {
        let config = InferenceConfig::default();

        // ~(0 | 0) as a dword, then shifted right by 28
        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(0)),
            (VmOpCode::PushiDword, VmOperand::Dword(0)),
            (VmOpCode::NorDword, VmOperand::None),
            (VmOpCode::PushiDword, VmOperand::Dword(28)),
            (VmOpCode::ShrDword, VmOperand::None),
        ]);
        let evaluator = DependencyEvaluator::new(&instructions, &config);
        assert_eq!(evaluator.evaluate(last_offset(&instructions), 0).unwrap(), 0xF);

        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(0x80)),
            (VmOpCode::SxByte, VmOperand::None),
        ]);
        let evaluator = DependencyEvaluator::new(&instructions, &config);
        assert_eq!(
            evaluator.evaluate(last_offset(&instructions), 0).unwrap(),
            0xFFFF_FF80
        );

        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(0xFFFF_FFFE)),
            (VmOpCode::SxDword, VmOperand::None),
            (VmOpCode::PushiDword, VmOperand::Dword(3)),
            (VmOpCode::MulQword, VmOperand::None),
        ]);
        let evaluator = DependencyEvaluator::new(&instructions, &config);
        assert_eq!(
            evaluator.evaluate(last_offset(&instructions), 0).unwrap(),
            (-6_i64) as u64
        );
    }

    #[test]
    fn values_flow_through_registers() {
        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(5)),
            (VmOpCode::Pop, VmOperand::Register(VmRegister::R3)),
            (VmOpCode::PushrDword, VmOperand::Register(VmRegister::R3)),
            (VmOpCode::PushiDword, VmOperand::Dword(1)),
            (VmOpCode::ShlDword, VmOperand::None),
        ]);
        let config = InferenceConfig::default();
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        assert_eq!(evaluator.evaluate(last_offset(&instructions), 0).unwrap(), 10);
    }

    #[test]
    fn unwritten_register_fails() {
        let instructions = program(&[
            (VmOpCode::PushrQword, VmOperand::Register(VmRegister::R5)),
            (VmOpCode::PushiDword, VmOperand::Dword(4)),
            (VmOpCode::AddQword, VmOperand::None),
        ]);
        let add = last_offset(&instructions);

        let config = InferenceConfig::default();
        let error = DependencyEvaluator::new(&instructions, &config)
            .evaluate(add, 0x80)
            .unwrap_err();
        assert!(matches!(error, Error::Unresolvable { offset: 0x80, .. }));
        assert!(error.to_string().contains("R5"));

        let config = InferenceConfig::default().with_initial_register(VmRegister::R5, 0x20);
        let evaluator = DependencyEvaluator::new(&instructions, &config);
        assert_eq!(evaluator.evaluate(add, 0x80).unwrap(), 0x24);
    }

    #[test]
    fn stack_pointer_has_an_entry_value() {
        let instructions = program(&[(VmOpCode::PushrQword, VmOperand::Register(VmRegister::Sp))]);
        let config = InferenceConfig::default();
        let evaluator = DependencyEvaluator::new(&instructions, &config);
        assert_eq!(evaluator.evaluate(0x10, 0).unwrap(), 0);

        let config = InferenceConfig::default().without_initial_register(VmRegister::Sp);
        let evaluator = DependencyEvaluator::new(&instructions, &config);
        assert!(evaluator.evaluate(0x10, 0).is_err());
    }

    #[test]
    fn unsupported_opcode_fails() {
        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(0x40)),
            (VmOpCode::LindDword, VmOperand::None),
        ]);
        let config = InferenceConfig::default();
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        let error = evaluator.evaluate(last_offset(&instructions), 0x99).unwrap_err();
        assert!(matches!(error, Error::Unresolvable { offset: 0x99, .. }));
        assert!(error.to_string().contains("LIND_DWORD"));
    }

    #[test]
    fn unknown_stack_origin_fails() {
        // The ADD pops two slots, but only one was pushed.
        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(1)),
            (VmOpCode::AddDword, VmOperand::None),
        ]);
        let config = InferenceConfig::default();
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        assert!(evaluator.evaluate(last_offset(&instructions), 0).is_err());
        assert!(evaluator.resolve(&SymbolicValue::unknown(), 0).is_err());
    }

    #[test]
    fn multiple_direct_sources_yield_candidates() {
        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(0x30)),
            (VmOpCode::PushiDword, VmOperand::Dword(0x20)),
            (VmOpCode::PushiDword, VmOperand::Dword(0x30)),
        ]);
        let config = InferenceConfig::default();
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        let value: SymbolicValue = instructions.keys().copied().collect();
        assert_eq!(evaluator.resolve(&value, 0).unwrap(), vec![0x20, 0x30]);
        assert!(evaluator.resolve_single(&value, 0, "target").is_err());
    }

    #[test]
    fn ambiguous_inner_dependency_fails() {
        let mut instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(1)),
            (VmOpCode::PushiDword, VmOperand::Dword(2)),
            (VmOpCode::PushiDword, VmOperand::Dword(3)),
            (VmOpCode::AddDword, VmOperand::None),
        ]);
        let add = last_offset(&instructions);
        if let Some(instruction) = instructions.get_mut(&add) {
            instruction.dependencies[1] = SymbolicValue::from_iter([0x10, 0x16]);
        }
        let config = InferenceConfig::default();
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        let error = evaluator.evaluate(add, 0).unwrap_err();
        assert!(error.to_string().contains("2 possible sources"));
    }

    #[test]
    fn closure_limit() {
        let instructions = program(&[
            (VmOpCode::PushiDword, VmOperand::Dword(1)),
            (VmOpCode::PushiDword, VmOperand::Dword(2)),
            (VmOpCode::AddDword, VmOperand::None),
        ]);
        let config = InferenceConfig::default().with_max_dependency_closure(2);
        let evaluator = DependencyEvaluator::new(&instructions, &config);

        let error = evaluator.evaluate(last_offset(&instructions), 0).unwrap_err();
        assert!(error.to_string().contains("exceeds 2"));
    }
}
