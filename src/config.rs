//! Configuration for the inference disassembler.
//!
//! Loading configuration files is left to the embedding application; this module only
//! provides the in-process settings with their defaults and builder methods.

use strum::EnumCount;

use crate::{diagnostics::DiagnosticSeverity, vm::VmRegister};

/// Settings shared by all exports of one devirtualization run.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Maximum worklist iterations per export (default: 1 000 000).
    pub max_iterations: usize,

    /// Maximum number of instructions in one dependency closure (default: 4096).
    pub max_dependency_closure: usize,

    /// Concrete values of the calling-convention registers at export entry (default: `BP`
    /// and `SP` are zero, every other register is unset).
    ///
    /// The dependency evaluator reads these when a register has not been written on the
    /// path. Reading an unset register that way is unresolvable.
    pub initial_registers: [Option<u64>; VmRegister::COUNT],

    /// Decoding key for exports whose code offset is 0 (default: 0).
    pub default_entry_key: u32,

    /// Register receiving the exception object at handler entry (default: `R0`).
    pub exception_register: VmRegister,

    /// Register receiving the return value of `CALL` (default: `R0`).
    pub return_register: VmRegister,

    /// Process exports on the rayon thread pool (default: false).
    pub parallel: bool,

    /// Skip the runtime initialisation helper export (default: true).
    pub skip_helper_init: bool,

    /// Number of passes used to learn callee exit keys (default: 2).
    ///
    /// After each pass the exit keys of successfully processed exports are recorded, and
    /// exports whose calls hit a callee without a known exit key are processed again.
    pub exit_key_rounds: usize,

    /// Minimum severity recorded by the diagnostics sink (default: `Info`).
    pub min_severity: DiagnosticSeverity,
}

fn calling_convention() -> [Option<u64>; VmRegister::COUNT] {
    let mut registers = [None; VmRegister::COUNT];
    registers[VmRegister::Bp.index()] = Some(0);
    registers[VmRegister::Sp.index()] = Some(0);
    registers
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1_000_000,
            max_dependency_closure: 4096,
            initial_registers: calling_convention(),
            default_entry_key: 0,
            exception_register: VmRegister::R0,
            return_register: VmRegister::R0,
            parallel: false,
            skip_helper_init: true,
            exit_key_rounds: 2,
            min_severity: DiagnosticSeverity::Info,
        }
    }
}

impl InferenceConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worklist iteration ceiling.
    #[must_use]
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Sets the dependency closure size limit.
    #[must_use]
    pub fn with_max_dependency_closure(mut self, max: usize) -> Self {
        self.max_dependency_closure = max;
        self
    }

    /// Seeds `register` with a concrete entry value for the dependency evaluator.
    #[must_use]
    pub fn with_initial_register(mut self, register: VmRegister, value: u64) -> Self {
        self.initial_registers[register.index()] = Some(value);
        self
    }

    /// Removes the entry value of `register`, so reads before any write are unresolvable.
    #[must_use]
    pub fn without_initial_register(mut self, register: VmRegister) -> Self {
        self.initial_registers[register.index()] = None;
        self
    }

    /// Sets the decoding key used for exports at offset 0.
    #[must_use]
    pub fn with_default_entry_key(mut self, key: u32) -> Self {
        self.default_entry_key = key;
        self
    }

    /// Enables or disables parallel processing of exports.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Controls whether the runtime initialisation helper export is skipped.
    #[must_use]
    pub fn with_skip_helper_init(mut self, skip: bool) -> Self {
        self.skip_helper_init = skip;
        self
    }

    /// Sets the number of exit key learning passes. Values below 1 are treated as 1.
    #[must_use]
    pub fn with_exit_key_rounds(mut self, rounds: usize) -> Self {
        self.exit_key_rounds = rounds.max(1);
        self
    }

    /// Sets the minimum recorded diagnostic severity.
    #[must_use]
    pub fn with_min_severity(mut self, severity: DiagnosticSeverity) -> Self {
        self.min_severity = severity;
        self
    }
}
