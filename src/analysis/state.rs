//! Abstract machine state tracked per instruction offset.

use std::fmt;

use strum::EnumCount;

use crate::{
    analysis::SymbolicValue,
    vm::{EhType, VmRegister},
    Error, Result,
};

/// The register file, one [`SymbolicValue`] per [`VmRegister`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterState {
    registers: [SymbolicValue; VmRegister::COUNT],
}

impl RegisterState {
    /// Current value of `register`.
    #[must_use]
    pub fn get(&self, register: VmRegister) -> &SymbolicValue {
        &self.registers[register.index()]
    }

    /// Overwrites `register`.
    pub fn set(&mut self, register: VmRegister, value: SymbolicValue) {
        self.registers[register.index()] = value;
    }

    /// Unions every register of `other` into `self`. Returns `true` if anything grew.
    pub fn merge(&mut self, other: &RegisterState) -> bool {
        self.registers
            .iter_mut()
            .zip(other.registers.iter())
            .fold(false, |changed, (mine, theirs)| mine.merge(theirs) | changed)
    }
}

/// The symbolic evaluation stack. The last element is the top of stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackState {
    slots: Vec<SymbolicValue>,
}

impl StackState {
    /// Pushes a value.
    pub fn push(&mut self, value: SymbolicValue) {
        self.slots.push(value);
    }

    /// Pops the top of stack.
    ///
    /// # Errors
    /// Returns [`Error::StackUnderflow`] for the instruction at `offset` if the stack is
    /// empty.
    pub fn pop(&mut self, offset: u64) -> Result<SymbolicValue> {
        self.slots.pop().ok_or(Error::StackUnderflow { offset })
    }

    /// Number of slots.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Unions `other` into `self` slot by slot.
    ///
    /// # Errors
    /// Returns [`Error::StateConsistency`] if the depths differ.
    pub fn merge(&mut self, other: &StackState, offset: u64) -> Result<bool> {
        if self.slots.len() != other.slots.len() {
            return Err(consistency_error!(
                offset,
                "stack depth mismatch: {} vs {}",
                self.slots.len(),
                other.slots.len()
            ));
        }

        Ok(self
            .slots
            .iter_mut()
            .zip(other.slots.iter())
            .fold(false, |changed, (mine, theirs)| mine.merge(theirs) | changed))
    }

    /// Slots from bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = &SymbolicValue> {
        self.slots.iter()
    }
}

/// A protected region registered by `TRY`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExceptionHandlerFrame {
    /// Offset of the `TRY` instruction that opened the region
    pub try_start: u64,
    /// Handler kind
    pub kind: EhType,
    /// Handler entry offset
    pub handler: u64,
    /// Filter entry offset, for [`EhType::Filter`]
    pub filter: Option<u64>,
    /// Caught type reference id, for [`EhType::Catch`]
    pub catch_type: Option<u32>,
}

impl fmt::Display for ExceptionHandlerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} try@{:04x} handler@{:04x}",
            self.kind, self.try_start, self.handler
        )?;
        if let Some(filter) = self.filter {
            write!(f, " filter@{filter:04x}")?;
        }
        if let Some(catch_type) = self.catch_type {
            write!(f, " type 0x{catch_type:08x}")?;
        }
        Ok(())
    }
}

/// Result of merging an incoming state into a stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Some provenance set grew
    pub changed: bool,
    /// The incoming key differed from the stored key, which was kept
    pub key_diverged: bool,
}

/// The abstract machine state before an instruction executes.
///
/// Branches always receive an owned copy (`clone`), so paths never alias each other's
/// stacks or registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramState {
    /// Offset of the instruction about to execute
    pub ip: u64,
    /// Decryption key at `ip`
    pub key: u32,
    /// Register file
    pub registers: RegisterState,
    /// Evaluation stack
    pub stack: StackState,
    /// Active protected regions, innermost last
    pub eh_stack: Vec<ExceptionHandlerFrame>,
}

impl ProgramState {
    /// A fresh state at `ip` with every register unknown and an empty stack.
    #[must_use]
    pub fn new(ip: u64, key: u32) -> Self {
        ProgramState {
            ip,
            key,
            ..Self::default()
        }
    }

    /// Merges `other` into `self`.
    ///
    /// The stored key is kept on divergence and reported through [`MergeOutcome`].
    ///
    /// # Errors
    /// Returns [`Error::StateConsistency`] if stack depths or exception handler stacks
    /// differ.
    pub fn merge_with(&mut self, other: &ProgramState) -> Result<MergeOutcome> {
        if self.eh_stack != other.eh_stack {
            return Err(consistency_error!(
                self.ip,
                "exception handler stack mismatch: {} vs {} frames",
                self.eh_stack.len(),
                other.eh_stack.len()
            ));
        }

        let stack_changed = self.stack.merge(&other.stack, self.ip)?;
        let registers_changed = self.registers.merge(&other.registers);

        Ok(MergeOutcome {
            changed: stack_changed || registers_changed,
            key_diverged: self.key != other.key,
        })
    }
}
