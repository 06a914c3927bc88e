//! Worklist-driven inference disassembly of a single export.
//!
//! Virtualized code cannot be disassembled linearly: every byte is encrypted with a rolling
//! key that depends on the path reaching it, and branch targets are computed values rather
//! than operands. The [`InferenceDisassembler`] therefore interprets the export abstractly.
//! It follows paths from the entry, decodes each instruction with the key of the path,
//! tracks where every stack slot and register value came from, and asks the
//! [`DependencyEvaluator`] for concrete values whenever control flow depends on one.
//!
//! States meeting at the same offset are merged. Provenance sets only grow and the set of
//! offsets is finite, so the worklist reaches a fixpoint. Once it drains, every instruction
//! is executed once more against its final state so annotations computed from an earlier,
//! smaller state are refreshed; this repeats until nothing changes.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
};

use crate::{
    analysis::{
        vcall::{pop, VCallResolver},
        DependencyEvaluator, ExceptionHandlerFrame, ProgramState, SymbolicValue,
    },
    config::InferenceConfig,
    diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
    disassembler::{Annotation, CallAnnotation, JumpAnnotation, StreamDecoder, VmInstruction},
    image::VmImage,
    vm::{EhType, ExportInfo, FlowControl, VmOpCode, VmRegister},
    Error, Result,
};

/// Everything inference learned about one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResult {
    /// Export id
    pub export_id: u32,
    /// Entry offset
    pub entry: u64,
    /// Reachable instructions with their final state and annotation
    pub instructions: BTreeMap<u64, VmInstruction>,
    /// Offsets that start a basic block: the entry, jump and call targets, handler entries
    pub block_headers: BTreeSet<u64>,
    /// Protected regions opened by `TRY`, ordered by their `TRY` offset
    pub eh_frames: Vec<ExceptionHandlerFrame>,
    /// Stack depth observed at `RET`, including the return address slot
    pub return_depth: Option<usize>,
    /// Key after the first `RET`
    pub exit_key: Option<u32>,
    /// Call targets that do not match any export
    pub unresolved_callees: BTreeSet<u64>,
    /// Ids of called exports whose exit key was not known. Paths stop at those calls until
    /// a later pass supplies the key.
    pub pending_exit_keys: BTreeSet<u32>,
    /// Worklist iterations spent
    pub iterations: usize,
}

impl InferenceResult {
    /// The instruction at `offset`.
    #[must_use]
    pub fn instruction(&self, offset: u64) -> Option<&VmInstruction> {
        self.instructions.get(&offset)
    }

    /// Number of reachable instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if no instruction was reached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instructions in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = &VmInstruction> {
        self.instructions.values()
    }
}

impl fmt::Display for InferenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "export {} @{:04x}", self.export_id, self.entry)?;
        for instruction in self.instructions.values() {
            if self.block_headers.contains(&instruction.offset) {
                writeln!(f, "loc_{:04x}:", instruction.offset)?;
            }
            writeln!(f, "    {instruction}")?;
        }
        Ok(())
    }
}

/// Side effects of executing one instruction, committed after execution so the evaluator
/// can borrow the instruction map while the instruction runs.
#[derive(Debug, Default)]
struct Effects {
    successors: Vec<ProgramState>,
    headers: Vec<u64>,
    frame: Option<ExceptionHandlerFrame>,
    ret: Option<(usize, u32)>,
    unresolved_callee: Option<u64>,
    pending_exit_key: Option<u32>,
}

/// Disassembles exports of a [`VmImage`] by abstract interpretation.
///
/// The disassembler itself is immutable and can be shared between threads; each call to
/// [`InferenceDisassembler::disassemble`] keeps its state private.
///
/// # Examples
///
/// ```rust,ignore
/// let diagnostics = Diagnostics::new();
/// let config = InferenceConfig::default();
/// let disassembler = InferenceDisassembler::new(&image, &config, &diagnostics);
///
/// let result = disassembler.disassemble(3)?;
/// println!("{result}");
/// ```
pub struct InferenceDisassembler<'a> {
    image: &'a VmImage,
    config: &'a InferenceConfig,
    diagnostics: &'a Diagnostics,
}

impl<'a> InferenceDisassembler<'a> {
    /// Creates a disassembler over `image`.
    #[must_use]
    pub fn new(image: &'a VmImage, config: &'a InferenceConfig, diagnostics: &'a Diagnostics) -> Self {
        InferenceDisassembler {
            image,
            config,
            diagnostics,
        }
    }

    /// Disassembles the export with id `export_id`.
    ///
    /// # Errors
    /// Returns [`Error::ExportNotFound`] for an unknown id, and otherwise the errors of
    /// [`InferenceDisassembler::disassemble_export`].
    pub fn disassemble(&self, export_id: u32) -> Result<InferenceResult> {
        let export = self.image.exports().get(export_id)?;
        self.disassemble_export(export)
    }

    /// Disassembles `export`.
    ///
    /// # Errors
    /// Per-export failures: [`Error::Decode`], [`Error::Unresolvable`],
    /// [`Error::StackUnderflow`], [`Error::IterationLimit`] and
    /// [`Error::ReferenceNotFound`]. A [`Error::StateConsistency`] error means the tables or
    /// keys are wrong for the whole image.
    pub fn disassemble_export(&self, export: &ExportInfo) -> Result<InferenceResult> {
        let entry_key = export.entry_key.unwrap_or(self.config.default_entry_key);

        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticSeverity::Info,
                DiagnosticCategory::Inference,
                format!(
                    "inferring export {} from 0x{:08x} with key 0x{:08x}",
                    export.id, export.code_offset, entry_key
                ),
            )
            .with_export(export.id),
        );

        let result = ExportInference::new(self, export).run(entry_key)?;

        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticSeverity::Info,
                DiagnosticCategory::Inference,
                format!(
                    "export {} done: {} instructions, {} blocks, {} iterations",
                    export.id,
                    result.instructions.len(),
                    result.block_headers.len(),
                    result.iterations
                ),
            )
            .with_export(export.id),
        );

        Ok(result)
    }
}

/// Mutable state of inference over one export.
struct ExportInference<'a> {
    image: &'a VmImage,
    config: &'a InferenceConfig,
    diagnostics: &'a Diagnostics,
    export: &'a ExportInfo,
    decoder: StreamDecoder<'a>,
    states: BTreeMap<u64, ProgramState>,
    instructions: BTreeMap<u64, VmInstruction>,
    queue: VecDeque<ProgramState>,
    headers: BTreeSet<u64>,
    eh_frames: BTreeSet<ExceptionHandlerFrame>,
    return_depth: Option<usize>,
    exit_key: Option<u32>,
    unresolved_callees: BTreeSet<u64>,
    pending_exit_keys: BTreeSet<u32>,
    iterations: usize,
}

impl<'a> ExportInference<'a> {
    fn new(disassembler: &InferenceDisassembler<'a>, export: &'a ExportInfo) -> Self {
        ExportInference {
            image: disassembler.image,
            config: disassembler.config,
            diagnostics: disassembler.diagnostics,
            export,
            decoder: StreamDecoder::new(disassembler.image.blob(), disassembler.image.table()),
            states: BTreeMap::new(),
            instructions: BTreeMap::new(),
            queue: VecDeque::new(),
            headers: BTreeSet::new(),
            eh_frames: BTreeSet::new(),
            return_depth: None,
            exit_key: None,
            unresolved_callees: BTreeSet::new(),
            pending_exit_keys: BTreeSet::new(),
            iterations: 0,
        }
    }

    fn seed(&mut self, entry_key: u32) {
        let entry = self.export.code_offset;
        self.headers.insert(entry);
        self.queue.push_back(ProgramState::new(entry, entry_key));
    }

    fn run(mut self, entry_key: u32) -> Result<InferenceResult> {
        let entry = self.export.code_offset;
        self.seed(entry_key);

        self.drain()?;
        while self.revalidate()? {
            self.drain()?;
        }

        Ok(InferenceResult {
            export_id: self.export.id,
            entry,
            instructions: self.instructions,
            block_headers: self.headers,
            eh_frames: self.eh_frames.into_iter().collect(),
            return_depth: self.return_depth,
            exit_key: self.exit_key,
            unresolved_callees: self.unresolved_callees,
            pending_exit_keys: self.pending_exit_keys,
            iterations: self.iterations,
        })
    }

    fn tick(&mut self) -> Result<()> {
        self.iterations += 1;
        if self.iterations > self.config.max_iterations {
            return Err(Error::IterationLimit(self.config.max_iterations));
        }
        Ok(())
    }

    fn report(&self, severity: DiagnosticSeverity, offset: u64, message: String) {
        self.diagnostics.push(
            Diagnostic::new(severity, DiagnosticCategory::Inference, message)
                .with_export(self.export.id)
                .with_offset(offset),
        );
    }

    /// Runs the worklist until no state changes.
    fn drain(&mut self) -> Result<()> {
        while self.step()? {}
        Ok(())
    }

    /// Processes one queued state. Returns `false` once the queue is empty.
    fn step(&mut self) -> Result<bool> {
        let Some(incoming) = self.queue.pop_front() else {
            return Ok(false);
        };
        self.tick()?;
        let offset = incoming.ip;

        let state = match self.states.get_mut(&offset) {
            Some(stored) => {
                let outcome = stored.merge_with(&incoming)?;
                let state = stored.clone();
                if outcome.key_diverged {
                    self.report(
                        DiagnosticSeverity::Warning,
                        offset,
                        format!(
                            "path arrives with key 0x{:08x}, keeping 0x{:08x}",
                            incoming.key, state.key
                        ),
                    );
                }
                if !outcome.changed {
                    return Ok(true);
                }
                state
            }
            None => {
                self.states.insert(offset, incoming.clone());
                incoming
            }
        };

        let (instruction, effects) = self.execute(state)?;
        self.commit(instruction, effects)?;
        Ok(true)
    }

    /// Re-executes every instruction against its final state. Returns `true` if any
    /// annotation changed, in which case new successors were queued.
    fn revalidate(&mut self) -> Result<bool> {
        let offsets: Vec<u64> = self.states.keys().copied().collect();
        let mut changed = false;

        for offset in offsets {
            self.tick()?;
            let Some(state) = self.states.get(&offset).cloned() else {
                continue;
            };

            let (instruction, effects) = self.execute(state)?;
            let stale = self
                .instructions
                .get(&offset)
                .map_or(true, |existing| existing.annotation != instruction.annotation);
            if stale {
                changed = true;
                self.commit(instruction, effects)?;
            }
        }

        Ok(changed)
    }

    fn commit(&mut self, instruction: VmInstruction, effects: Effects) -> Result<()> {
        let offset = instruction.offset;

        let previous = self.instructions.get(&offset);
        if let Some(existing) = previous {
            if existing.opcode != instruction.opcode || existing.operand != instruction.operand {
                return Err(consistency_error!(
                    offset,
                    "instruction re-decoded as {} {} instead of {} {}",
                    instruction.opcode,
                    instruction.operand,
                    existing.opcode,
                    existing.operand
                ));
            }
        }

        if self.diagnostics.enabled(DiagnosticSeverity::Debug)
            && matches!(instruction.annotation, Some(Annotation::Jump(_)))
            && previous.and_then(|p| p.annotation.as_ref()) != instruction.annotation.as_ref()
        {
            if let Some(annotation) = &instruction.annotation {
                self.report(
                    DiagnosticSeverity::Debug,
                    offset,
                    format!("{} resolved {}", instruction.opcode, annotation),
                );
            }
        }

        self.headers.extend(effects.headers);
        if let Some(frame) = effects.frame {
            self.eh_frames.insert(frame);
        }
        if let Some((depth, key)) = effects.ret {
            self.record_return(offset, depth, key);
        }
        if let Some(address) = effects.unresolved_callee {
            if self.unresolved_callees.insert(address) {
                self.report(
                    DiagnosticSeverity::Warning,
                    offset,
                    format!("call target 0x{address:08x} is not a known export"),
                );
            }
        }
        if let Some(callee) = effects.pending_exit_key {
            if self.pending_exit_keys.insert(callee) {
                self.report(
                    DiagnosticSeverity::Debug,
                    offset,
                    format!("exit key of export {callee} unknown, path stops after the call"),
                );
            }
        }

        self.queue.extend(effects.successors);
        self.instructions.insert(offset, instruction);
        Ok(())
    }

    fn record_return(&mut self, offset: u64, depth: usize, key: u32) {
        match self.return_depth {
            Some(known) if known != depth => self.report(
                DiagnosticSeverity::Warning,
                offset,
                format!("return with stack depth {depth}, keeping {known}"),
            ),
            Some(_) => {}
            None => self.return_depth = Some(depth),
        }

        match self.exit_key {
            Some(known) if known != key => self.report(
                DiagnosticSeverity::Warning,
                offset,
                format!("return with exit key 0x{key:08x}, keeping 0x{known:08x}"),
            ),
            Some(_) => {}
            None => self.exit_key = Some(key),
        }
    }

    /// Decodes and executes the instruction at `state.ip`.
    fn execute(&self, state: ProgramState) -> Result<(VmInstruction, Effects)> {
        let (mut instruction, next_key) = self.decoder.decode_at(state.ip, state.key)?;
        let offset = instruction.offset;

        let mut post = state.clone();
        post.ip = instruction.next_offset();
        post.key = next_key;
        instruction.state = state;

        let evaluator = DependencyEvaluator::new(&self.instructions, self.config);
        let mut effects = Effects::default();

        match instruction.flow() {
            FlowControl::Sequential => {
                Self::sequential(&mut instruction, &mut post)?;
                effects.successors.push(post);
            }
            FlowControl::Jump => {
                let target = pop(&mut instruction, &mut post)?;
                let targets = evaluator.resolve(&target, offset)?;
                Self::branch(&mut instruction, targets, &post, &mut effects);
            }
            FlowControl::ConditionalJump => {
                let target = pop(&mut instruction, &mut post)?;
                pop(&mut instruction, &mut post)?;

                let fallthrough = post.ip;
                let mut targets = evaluator.resolve(&target, offset)?;
                targets.retain(|&target| target != fallthrough);
                targets.push(fallthrough);
                Self::branch(&mut instruction, targets, &post, &mut effects);
            }
            FlowControl::Switch => {
                let address = pop(&mut instruction, &mut post)?;
                pop(&mut instruction, &mut post)?;

                let address = evaluator.resolve_single(&address, offset, "switch table")?;
                let mut targets = self.switch_targets(offset, address, post.ip)?;
                targets.push(post.ip);
                Self::branch(&mut instruction, targets, &post, &mut effects);
            }
            FlowControl::Call => {
                if self.call(&evaluator, &mut instruction, &mut post, &mut effects)? {
                    effects.successors.push(post);
                }
            }
            FlowControl::Return => {
                pop(&mut instruction, &mut post)?;
                effects.ret = Some((instruction.state.stack.depth(), post.key));
            }
            FlowControl::Try => {
                self.enter_try(&evaluator, &mut instruction, &mut post, &mut effects)?;
                effects.successors.push(post);
            }
            FlowControl::Leave => {
                let handler = pop(&mut instruction, &mut post)?;
                let handler = evaluator.resolve_single(&handler, offset, "leave target")?;
                match post.eh_stack.last() {
                    Some(frame) if frame.handler == handler => {}
                    Some(frame) => {
                        return Err(consistency_error!(
                            offset,
                            "LEAVE for handler 0x{:08x} inside {}",
                            handler,
                            frame
                        ))
                    }
                    None => {
                        return Err(consistency_error!(
                            offset,
                            "LEAVE outside of any protected region"
                        ))
                    }
                }
                post.eh_stack.pop();
                effects.successors.push(post);
            }
            FlowControl::VCall => {
                let resolver =
                    VCallResolver::new(self.image.table(), self.image.references(), &evaluator);
                if resolver.apply(&mut instruction, &mut post)? {
                    effects.successors.push(post);
                }
            }
        }

        Ok((instruction, effects))
    }

    /// Applies the fixed stack effect of a sequential opcode.
    fn sequential(instruction: &mut VmInstruction, post: &mut ProgramState) -> Result<()> {
        let offset = instruction.offset;
        let info = instruction.info();

        for _ in 0..info.stack.pops {
            pop(instruction, post)?;
        }

        match (instruction.opcode, instruction.operand.register()) {
            (VmOpCode::Pop, Some(register)) => {
                post.registers.set(register, SymbolicValue::from_offset(offset));
            }
            (_, Some(register)) => {
                let value = post.registers.get(register).clone();
                instruction.dependencies.push(value);
            }
            (_, None) => {}
        }

        for _ in 0..info.stack.pushes {
            post.stack.push(SymbolicValue::from_offset(offset));
        }
        if info.writes_flags {
            post.registers
                .set(VmRegister::Fl, SymbolicValue::from_offset(offset));
        }
        Ok(())
    }

    fn branch(
        instruction: &mut VmInstruction,
        targets: Vec<u64>,
        post: &ProgramState,
        effects: &mut Effects,
    ) {
        for &target in &targets {
            let mut successor = post.clone();
            successor.ip = target;
            effects.successors.push(successor);
            effects.headers.push(target);
        }
        instruction.annotation = Some(Annotation::Jump(JumpAnnotation { targets }));
    }

    /// Reads the unencrypted switch table at `address`.
    fn switch_targets(&self, offset: u64, address: u64, base: u64) -> Result<Vec<u64>> {
        let blob = self.image.blob();
        let outside =
            |_: Error| unresolvable_error!(offset, "switch table 0x{:08x} is outside the blob", address);

        let count_offset = address
            .checked_sub(2)
            .ok_or_else(|| unresolvable_error!(offset, "switch table address 0x{:x}", address))?;
        let count = blob.read_u16(count_offset).map_err(outside)?;

        (0..u64::from(count))
            .map(|arm| {
                let relative = blob.read_i32(address + arm * 4).map_err(outside)?;
                base.checked_add_signed(i64::from(relative)).ok_or_else(|| {
                    unresolvable_error!(offset, "switch arm {} points before the blob", arm)
                })
            })
            .collect()
    }

    /// Applies a `CALL`. Returns `false` if the path has to stop at the call because the
    /// key of the code after it is the callee's exit key, which is not known yet.
    fn call(
        &self,
        evaluator: &DependencyEvaluator<'_>,
        instruction: &mut VmInstruction,
        post: &mut ProgramState,
        effects: &mut Effects,
    ) -> Result<bool> {
        let offset = instruction.offset;
        let target = pop(instruction, post)?;
        let address = evaluator.resolve_single(&target, offset, "call target")?;

        let mut resumes = true;
        let annotation = match self.image.exports().by_offset(address) {
            Some(callee) => {
                for _ in 0..callee.signature.parameter_count() {
                    pop(instruction, post)?;
                }
                match callee.exit_key {
                    Some(key) => post.key = key,
                    None => {
                        effects.pending_exit_key = Some(callee.id);
                        resumes = false;
                    }
                }
                CallAnnotation {
                    address,
                    signature: Some(callee.signature.clone()),
                    export: Some(callee.id),
                    is_instance: callee
                        .signature
                        .is_instance(self.image.table().flag_instance()),
                }
            }
            None => {
                effects.unresolved_callee = Some(address);
                CallAnnotation {
                    address,
                    signature: None,
                    export: None,
                    is_instance: false,
                }
            }
        };

        post.registers
            .set(self.config.return_register, SymbolicValue::from_offset(offset));
        effects.headers.push(address);
        instruction.annotation = Some(Annotation::Call(annotation));
        Ok(resumes)
    }

    /// Opens a protected region and queues its handler entries.
    fn enter_try(
        &self,
        evaluator: &DependencyEvaluator<'_>,
        instruction: &mut VmInstruction,
        post: &mut ProgramState,
        effects: &mut Effects,
    ) -> Result<()> {
        let offset = instruction.offset;

        let kind = pop(instruction, post)?;
        let kind = evaluator.resolve_single(&kind, offset, "exception handler type")?;
        let kind = self.image.table().eh_type(kind).ok_or_else(|| {
            unresolvable_error!(offset, "unknown exception handler type 0x{:x}", kind)
        })?;

        let (catch_type, filter) = match kind {
            EhType::Catch => {
                let catch_type = pop(instruction, post)?;
                let catch_type = evaluator.resolve_single(&catch_type, offset, "catch type")?;
                let catch_type = u32::try_from(catch_type).map_err(|_| {
                    unresolvable_error!(offset, "catch type 0x{:x} exceeds 32 bits", catch_type)
                })?;
                (Some(catch_type), None)
            }
            EhType::Filter => {
                let filter = pop(instruction, post)?;
                (None, Some(evaluator.resolve_single(&filter, offset, "filter")?))
            }
            EhType::Fault | EhType::Finally => (None, None),
        };

        let handler = pop(instruction, post)?;
        let handler = evaluator.resolve_single(&handler, offset, "handler")?;

        let mut entry = ProgramState::new(handler, post.key);
        entry.registers = post.registers.clone();
        entry
            .registers
            .set(self.config.exception_register, SymbolicValue::from_offset(offset));
        entry.eh_stack = post.eh_stack.clone();

        if let Some(filter) = filter {
            let mut filter_entry = entry.clone();
            filter_entry.ip = filter;
            effects.successors.push(filter_entry);
            effects.headers.push(filter);
        }
        effects.successors.push(entry);
        effects.headers.push(handler);

        let frame = ExceptionHandlerFrame {
            try_start: offset,
            kind,
            handler,
            filter,
            catch_type,
        };
        post.eh_stack.push(frame.clone());
        effects.frame = Some(frame);
        Ok(())
    }
}
