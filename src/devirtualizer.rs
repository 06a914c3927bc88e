//! Whole-image devirtualization.
//!
//! The [`Devirtualizer`] runs inference over every export of a [`VmImage`], builds the
//! control flow graph of each one and collects failures without letting one broken export
//! stop the rest. Only errors that invalidate the whole image (an inconsistent stack depth
//! or exception handler stack) abort the run.
//!
//! # Exit keys
//!
//! The decoding key after a `CALL` is the key the callee returns with, which is only known
//! once the callee itself has been inferred. Until then inference stops the path at the
//! call. Every round records the exit keys it discovered in the export table and re-runs the
//! exports that called a callee whose key was still missing. Rounds stop when nothing new
//! was learned or [`InferenceConfig::exit_key_rounds`] is exhausted; exports still waiting
//! on a key are reported with a warning.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmscope::prelude::*;
//!
//! let image = VmImage::from_file("bytecode.bin", table, exports, references)?;
//! let mut devirtualizer = Devirtualizer::new(image, InferenceConfig::default());
//!
//! let report = devirtualizer.run()?;
//! for (id, export) in report.exports() {
//!     println!("{}", export.cfg.to_dot(Some(&format!("export {id}"))));
//! }
//! println!("{}", devirtualizer.diagnostics().summary());
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::{Duration, Instant},
};

use rayon::prelude::*;

use crate::{
    analysis::{build_graph, ControlFlowGraph, InferenceDisassembler, InferenceResult},
    config::InferenceConfig,
    diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
    image::VmImage,
    Error, Result,
};

/// A successfully devirtualized export.
#[derive(Debug)]
pub struct DevirtualizedExport {
    /// Instructions, annotations and block headers found by inference
    pub result: InferenceResult,
    /// Control flow graph built from `result`
    pub cfg: ControlFlowGraph,
}

/// An export that could not be devirtualized.
#[derive(Debug)]
pub struct ExportFailure {
    /// Export id
    pub export_id: u32,
    /// Offset of the failing instruction, when known
    pub offset: Option<u64>,
    /// The error that stopped inference
    pub error: Error,
}

impl ExportFailure {
    fn new(export_id: u32, error: Error) -> Self {
        ExportFailure {
            export_id,
            offset: error.offset(),
            error,
        }
    }
}

impl fmt::Display for ExportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(
                f,
                "export {} failed at 0x{:08x}: {}",
                self.export_id, offset, self.error
            ),
            None => write!(f, "export {} failed: {}", self.export_id, self.error),
        }
    }
}

/// Outcome of [`Devirtualizer::run`].
#[derive(Debug, Default)]
pub struct DevirtualizationReport {
    exports: BTreeMap<u32, DevirtualizedExport>,
    failures: BTreeMap<u32, ExportFailure>,
    skipped: BTreeSet<u32>,
    rounds: usize,
    elapsed: Duration,
}

impl DevirtualizationReport {
    /// Devirtualized exports in ascending id order.
    pub fn exports(&self) -> impl Iterator<Item = (u32, &DevirtualizedExport)> {
        self.exports.iter().map(|(&id, export)| (id, export))
    }

    /// The devirtualized export with id `id`.
    #[must_use]
    pub fn export(&self, id: u32) -> Option<&DevirtualizedExport> {
        self.exports.get(&id)
    }

    /// Failed exports in ascending id order.
    pub fn failures(&self) -> impl Iterator<Item = &ExportFailure> {
        self.failures.values()
    }

    /// The failure of export `id`.
    #[must_use]
    pub fn failure(&self, id: u32) -> Option<&ExportFailure> {
        self.failures.get(&id)
    }

    /// Exports that were not processed (the runtime initialisation helper).
    #[must_use]
    pub fn skipped(&self) -> &BTreeSet<u32> {
        &self.skipped
    }

    /// Number of inference rounds that ran.
    #[must_use]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Wall clock time of the run.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Returns `true` if every processed export succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of devirtualized exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exports.len()
    }

    /// Returns `true` if no export was devirtualized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// One-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} exports devirtualized, {} failed, {} skipped in {} rounds ({:.2?})",
            self.exports.len(),
            self.failures.len(),
            self.skipped.len(),
            self.rounds,
            self.elapsed
        )
    }
}

/// Drives inference and graph construction over a whole [`VmImage`].
pub struct Devirtualizer {
    image: VmImage,
    config: InferenceConfig,
    diagnostics: Diagnostics,
}

impl Devirtualizer {
    /// Creates a devirtualizer owning `image`.
    ///
    /// Diagnostics below [`InferenceConfig::min_severity`] are dropped.
    #[must_use]
    pub fn new(image: VmImage, config: InferenceConfig) -> Self {
        let diagnostics = Diagnostics::with_min_severity(config.min_severity);
        Devirtualizer {
            image,
            config,
            diagnostics,
        }
    }

    /// The image, including exit keys learned so far.
    #[must_use]
    pub fn image(&self) -> &VmImage {
        &self.image
    }

    /// Consumes the devirtualizer and returns the image.
    #[must_use]
    pub fn into_image(self) -> VmImage {
        self.image
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Everything reported so far.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Devirtualizes a single export with the exit keys known so far.
    ///
    /// # Errors
    /// Returns the inference or graph error of the export.
    pub fn devirtualize(&self, export_id: u32) -> Result<DevirtualizedExport> {
        let result = InferenceDisassembler::new(&self.image, &self.config, &self.diagnostics)
            .disassemble(export_id)?;
        let cfg = build_graph(&result)?;
        Ok(DevirtualizedExport { result, cfg })
    }

    /// Devirtualizes every export.
    ///
    /// Per-export failures are collected in the report.
    ///
    /// # Errors
    /// Returns the first fatal error (see [`Error::is_fatal`]).
    pub fn run(&mut self) -> Result<DevirtualizationReport> {
        let start = Instant::now();
        let helper = self.image.table().helper_init();

        let mut report = DevirtualizationReport::default();
        let mut pending = Vec::new();
        for export in self.image.exports().iter() {
            if self.config.skip_helper_init && export.id == helper {
                report.skipped.insert(export.id);
            } else {
                pending.push(export.id);
            }
        }

        self.diagnostics.info(
            DiagnosticCategory::General,
            format!("devirtualizing {} exports", pending.len()),
        );

        let mut results: BTreeMap<u32, InferenceResult> = BTreeMap::new();
        while !pending.is_empty() {
            report.rounds += 1;

            for (id, outcome) in self.infer_all(&pending) {
                match outcome {
                    Ok(result) => {
                        report.failures.remove(&id);
                        results.insert(id, result);
                    }
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(error) => {
                        results.remove(&id);
                        report.failures.insert(id, ExportFailure::new(id, error));
                    }
                }
            }

            let learned = self.learn_exit_keys(&results)?;
            if learned.is_empty() || report.rounds >= self.config.exit_key_rounds {
                break;
            }

            pending = results
                .iter()
                .filter(|(_, result)| !result.pending_exit_keys.is_disjoint(&learned))
                .map(|(&id, _)| id)
                .chain(report.failures.keys().copied())
                .collect();
            pending.sort_unstable();
            pending.dedup();

            self.diagnostics.debug(
                DiagnosticCategory::Export,
                format!(
                    "round {} learned {} exit keys, re-running {} exports",
                    report.rounds,
                    learned.len(),
                    pending.len()
                ),
            );
        }

        for (id, result) in &results {
            if !result.pending_exit_keys.is_empty() {
                let missing: Vec<String> = result
                    .pending_exit_keys
                    .iter()
                    .map(u32::to_string)
                    .collect();
                self.diagnostics.push(
                    Diagnostic::new(
                        DiagnosticSeverity::Warning,
                        DiagnosticCategory::Export,
                        format!(
                            "export {id} stops after calls, exit key of export {} was unknown",
                            missing.join(", ")
                        ),
                    )
                    .with_export(*id),
                );
            }
        }

        for (id, result) in results {
            match build_graph(&result) {
                Ok(cfg) => {
                    report.exports.insert(id, DevirtualizedExport { result, cfg });
                }
                Err(error) => {
                    report.failures.insert(id, ExportFailure::new(id, error));
                }
            }
        }

        for failure in report.failures.values() {
            let mut diagnostic = Diagnostic::new(
                DiagnosticSeverity::Error,
                DiagnosticCategory::Export,
                failure.to_string(),
            )
            .with_export(failure.export_id);
            if let Some(offset) = failure.offset {
                diagnostic = diagnostic.with_offset(offset);
            }
            self.diagnostics.push(diagnostic);
        }

        report.elapsed = start.elapsed();
        self.diagnostics
            .info(DiagnosticCategory::General, report.summary());

        Ok(report)
    }

    /// Runs inference over `ids`, in parallel if configured.
    fn infer_all(&self, ids: &[u32]) -> Vec<(u32, Result<InferenceResult>)> {
        let disassembler =
            InferenceDisassembler::new(&self.image, &self.config, &self.diagnostics);

        if self.config.parallel {
            ids.par_iter()
                .map(|&id| (id, disassembler.disassemble(id)))
                .collect()
        } else {
            ids.iter()
                .map(|&id| (id, disassembler.disassemble(id)))
                .collect()
        }
    }

    /// Stores newly discovered exit keys and returns the ids whose key changed.
    fn learn_exit_keys(&mut self, results: &BTreeMap<u32, InferenceResult>) -> Result<BTreeSet<u32>> {
        let mut learned = BTreeSet::new();

        for (&id, result) in results {
            let Some(key) = result.exit_key else {
                continue;
            };
            if self.image.exports().get(id)?.exit_key != Some(key) {
                self.image.exports_mut().set_exit_key(id, key)?;
                learned.insert(id);
            }
        }

        Ok(learned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        disassembler::{next_key, StreamDecoder, VmOperand},
        file::BytecodeBlob,
        test::{assemble, canonical_table, create_export, reference_table, HELPER_INIT},
        vm::{ExportInfo, ExportTable, OpcodeTable, VmOpCode},
    };

    fn image(table: OpcodeTable, blob: BytecodeBlob, exports: Vec<ExportInfo>) -> VmImage {
        VmImage::new(
            blob,
            table,
            exports.into_iter().collect::<ExportTable>(),
            reference_table(),
        )
    }

    fn dword(value: u32) -> VmOperand {
        VmOperand::Dword(value)
    }

    /// Three exports in one blob:
    ///
    /// | id          | offset | body                              |
    /// |-------------|--------|-----------------------------------|
    /// | 1           | 0      | `PUSHI 26; RET`                   |
    /// | 3           | 8      | `PUSHI 0x100; LIND_DWORD; JMP`    |
    /// | HELPER_INIT | 18     | `PUSHI 0x100; LIND_DWORD; JMP`    |
    fn mixed_image() -> VmImage {
        let table = canonical_table();
        let blob = assemble(&table, 0x10, |asm, _| {
            asm.emit(VmOpCode::PushiDword, dword(26))?;
            asm.op(VmOpCode::Ret)?;
            asm.set_key(0x30);
            asm.emit(VmOpCode::PushiDword, dword(0x100))?;
            asm.op(VmOpCode::LindDword)?;
            asm.op(VmOpCode::Jmp)?;
            asm.set_key(0x40);
            asm.emit(VmOpCode::PushiDword, dword(0x100))?;
            asm.op(VmOpCode::LindDword)?;
            asm.op(VmOpCode::Jmp)?;
            Ok(())
        });
        image(
            table,
            blob,
            vec![
                create_export(1, 0, 0x10, 0),
                create_export(3, 8, 0x30, 0),
                create_export(HELPER_INIT, 18, 0x40, 0),
            ],
        )
    }

    #[test]
    fn failures_do_not_stop_other_exports() {
        let mut devirtualizer = Devirtualizer::new(mixed_image(), InferenceConfig::default());
        let report = devirtualizer.run().unwrap();

        assert_eq!(report.len(), 1);
        let export = report.export(1).unwrap();
        assert_eq!(export.result.len(), 2);
        assert_eq!(export.cfg.block_count(), 1);

        let failure = report.failure(3).unwrap();
        assert_eq!(failure.offset, Some(16));
        assert!(matches!(failure.error, Error::Unresolvable { .. }));
        assert!(!report.is_complete());

        assert_eq!(report.skipped(), &BTreeSet::from([HELPER_INIT]));
        assert!(report.failure(HELPER_INIT).is_none());

        let errors = devirtualizer.diagnostics().errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].export, Some(3));
    }

    #[test]
    fn helper_init_can_be_included() {
        let config = InferenceConfig::default().with_skip_helper_init(false);
        let report = Devirtualizer::new(mixed_image(), config).run().unwrap();

        assert!(report.skipped().is_empty());
        assert!(report.failure(HELPER_INIT).is_some());
    }

    #[test]
    fn parallel_matches_sequential() {
        let sequential = Devirtualizer::new(mixed_image(), InferenceConfig::default())
            .run()
            .unwrap();
        let parallel =
            Devirtualizer::new(mixed_image(), InferenceConfig::default().with_parallel(true))
                .run()
                .unwrap();

        assert_eq!(
            sequential.export(1).unwrap().result,
            parallel.export(1).unwrap().result
        );
        assert_eq!(
            sequential.failure(3).unwrap().offset,
            parallel.failure(3).unwrap().offset
        );
    }

    #[test]
    fn fatal_errors_abort_the_run() {
        let table = canonical_table();
        let blob = assemble(&table, 0x10, |asm, labels| {
            asm.emit(VmOpCode::PushiDword, dword(0))?;
            asm.emit(VmOpCode::PushiDword, labels.dword("join"))?;
            asm.op(VmOpCode::Jz)?;
            let key = asm.key();
            asm.emit(VmOpCode::PushiDword, dword(5))?;
            asm.set_key(key);
            asm.label("join");
            asm.emit(VmOpCode::PushiDword, dword(0))?;
            asm.op(VmOpCode::Ret)?;
            Ok(())
        });
        let image = image(table, blob, vec![create_export(1, 0, 0x10, 0)]);

        let error = Devirtualizer::new(image, InferenceConfig::default())
            .run()
            .unwrap_err();
        assert!(error.is_fatal());
        assert_eq!(error.offset(), Some(20));
    }

    /// Export 1 calls export 2 and continues with the key export 2 returns with. The
    /// callee's entry key is chosen so that the caller's running key decodes the byte after
    /// the call as `LEAVE`.
    fn call_image() -> (VmImage, u32, u32) {
        let table = canonical_table();
        let pushi = table.opcode_byte(VmOpCode::PushiDword);
        let call = table.opcode_byte(VmOpCode::Call);
        let ret = table.opcode_byte(VmOpCode::Ret);
        let leave = table.opcode_byte(VmOpCode::Leave);
        let roll = |key: u32, bytes: &[u8]| bytes.iter().fold(key, |key, &b| next_key(key, b));

        let caller_key = 0x11;
        let running = roll(caller_key, &[pushi, 0, 16, 0, 0, 0, call, 0]);
        let callee_exit = |entry: u32| roll(entry, &[pushi, 0, 0, 0, 0, 0, ret, 0]);
        let callee_key = (0u32..0x100)
            .find(|&entry| callee_exit(entry) as u8 == pushi ^ leave ^ running as u8)
            .unwrap();
        let exit = callee_exit(callee_key);

        let blob = assemble(&table, caller_key, |asm, _| {
            asm.emit(VmOpCode::PushiDword, dword(16))?;
            asm.op(VmOpCode::Call)?;
            asm.set_key(exit);
            asm.emit(VmOpCode::PushiDword, dword(7))?;
            asm.op(VmOpCode::Ret)?;
            asm.set_key(callee_key);
            asm.emit(VmOpCode::PushiDword, dword(0))?;
            asm.op(VmOpCode::Ret)?;
            Ok(())
        });
        let image = image(
            table,
            blob,
            vec![
                create_export(1, 0, caller_key, 0),
                create_export(2, 16, callee_key, 0),
            ],
        );
        (image, running, exit)
    }

    #[test]
    fn exit_keys_are_learned_across_rounds() {
        let (image, running, exit) = call_image();

        let decoder = StreamDecoder::new(image.blob(), image.table());
        let (misdecoded, _) = decoder.decode_at(8, running).unwrap();
        assert_eq!(misdecoded.opcode, VmOpCode::Leave);

        let mut devirtualizer = Devirtualizer::new(image, InferenceConfig::default());
        let report = devirtualizer.run().unwrap();

        assert_eq!(report.rounds(), 2);
        assert!(report.is_complete());
        let caller = &report.export(1).unwrap().result;
        assert!(caller.pending_exit_keys.is_empty());
        assert_eq!(caller.len(), 4);
        let after_call = caller.instruction(8).unwrap();
        assert_eq!(after_call.opcode, VmOpCode::PushiDword);
        assert_eq!(after_call.state.key, exit);
        assert_eq!(
            devirtualizer.image().exports().get(2).unwrap().exit_key,
            Some(exit)
        );
    }

    #[test]
    fn paths_stop_at_calls_with_unknown_exit_keys() {
        let (image, _, _) = call_image();
        let config = InferenceConfig::default().with_exit_key_rounds(1);

        let mut devirtualizer = Devirtualizer::new(image, config);
        let report = devirtualizer.run().unwrap();

        assert_eq!(report.rounds(), 1);
        assert!(report.is_complete());
        let caller = report.export(1).unwrap();
        assert_eq!(caller.result.pending_exit_keys, BTreeSet::from([2]));
        assert_eq!(caller.result.len(), 2);
        assert!(caller.result.instruction(8).is_none());
        assert_eq!(caller.cfg.block_count(), 1);

        let warnings = devirtualizer.diagnostics().by_export(1);
        assert!(warnings
            .iter()
            .any(|d| d.severity == DiagnosticSeverity::Warning && d.message.contains("export 2")));
    }

    #[test]
    fn single_export() {
        let devirtualizer = Devirtualizer::new(mixed_image(), InferenceConfig::default());

        let export = devirtualizer.devirtualize(1).unwrap();
        assert_eq!(export.cfg.exits().len(), 1);
        assert!(matches!(
            devirtualizer.devirtualize(9),
            Err(Error::ExportNotFound(9))
        ));
    }
}
