//! End-to-end inference tests.
//!
//! Every test assembles a small program with `VmAssembler` against a scrambled byte
//! assignment, runs it through the public inference API and checks the recovered
//! instructions, annotations and control flow graph.

use std::collections::BTreeSet;

use strum::IntoEnumIterator;
use vmscope::{
    analysis::{build_graph, CfgEdgeKind, DependencyEvaluator, InferenceResult},
    disassembler::{Annotation, Labels, VmAssembler, VmOperand},
    prelude::*,
};

/// A total table whose byte assignment differs from declaration order.
fn scrambled_table() -> OpcodeTable {
    let mut builder = OpcodeTableBuilder::new().helper_init(0x40).flag_instance(0x08);

    for (i, opcode) in VmOpCode::iter().enumerate() {
        builder = builder.opcode(((i * 73 + 5) % 256) as u8, opcode);
    }
    for (i, register) in VmRegister::iter().enumerate() {
        builder = builder.register((i * 11 + 1) as u8, register);
    }
    for (i, flag) in VmFlag::iter().enumerate() {
        builder = builder.flag(1 << ((i + 5) % 8), flag);
    }
    for (i, call) in VmCall::iter().enumerate() {
        builder = builder.vmcall(((i * 29 + 3) % 256) as u8, call);
    }
    for (selector, opcode) in [1, 3, 0, 2].into_iter().zip(ECallOpCode::iter()) {
        builder = builder.ecall(selector, opcode);
    }
    for (i, kind) in EhType::iter().enumerate() {
        builder = builder.eh_type((i * 2 + 5) as u8, kind);
    }

    builder.build().unwrap()
}

fn signature() -> ExportSignature {
    ExportSignature {
        flags: 0,
        parameter_types: Vec::new(),
        return_type: 0,
    }
}

fn image<F>(key: u32, program: F) -> VmImage
where
    F: for<'a> Fn(&mut VmAssembler<'a>, &Labels) -> Result<()>,
{
    let table = scrambled_table();
    let bytes = VmAssembler::assemble(&table, key, program).unwrap();
    let exports: ExportTable = [ExportInfo::new(1, 0, key, signature())]
        .into_iter()
        .collect();
    VmImage::new(
        BytecodeBlob::from_mem(bytes),
        table,
        exports,
        ReferenceTable::new(),
    )
}

fn infer(image: &VmImage, config: &InferenceConfig) -> Result<InferenceResult> {
    let diagnostics = Diagnostics::new();
    InferenceDisassembler::new(image, config, &diagnostics).disassemble(1)
}

#[test]
fn constant_return() -> Result<()> {
    let image = image(0x2B, |asm, _| {
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(26))?;
        asm.op(VmOpCode::Ret)?;
        Ok(())
    });
    let config = InferenceConfig::default();

    let result = infer(&image, &config)?;
    assert_eq!(result.len(), 2);
    assert_eq!(result.return_depth, Some(1));

    let evaluator = DependencyEvaluator::new(&result.instructions, &config);
    assert_eq!(evaluator.evaluate(0, 6)?, 26);
    Ok(())
}

#[test]
fn register_relative_jump() -> Result<()> {
    let image = image(0x1000, |asm, _| {
        asm.emit(VmOpCode::PushrQword, VmOperand::Register(VmRegister::Bp))?;
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(8))?;
        asm.op(VmOpCode::AddQword)?;
        asm.op(VmOpCode::Jmp)?;
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
        asm.op(VmOpCode::Ret)?;
        Ok(())
    });
    let config = InferenceConfig::default().with_initial_register(VmRegister::Bp, 5);

    let result = infer(&image, &config)?;
    let jump = result.instruction(11).unwrap();
    match &jump.annotation {
        Some(Annotation::Jump(annotation)) => assert_eq!(annotation.targets, vec![13]),
        other => panic!("unexpected annotation: {other:?}"),
    }
    assert!(result.block_headers.contains(&13));
    Ok(())
}

#[test]
fn conditional_jump_arms() -> Result<()> {
    let image = image(9, |asm, labels| {
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
        asm.emit(VmOpCode::PushiDword, labels.dword("taken"))?;
        asm.op(VmOpCode::Jz)?;
        let key = asm.key();
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
        asm.op(VmOpCode::Ret)?;
        asm.set_key(key);
        asm.label("taken");
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(1))?;
        asm.op(VmOpCode::Ret)?;
        Ok(())
    });

    let result = infer(&image, &InferenceConfig::default())?;
    let cfg = build_graph(&result)?;

    assert_eq!(cfg.block_count(), 3);
    let arms: Vec<(u64, Option<usize>)> = cfg
        .outgoing_edges(cfg.entry())
        .map(|(_, _, edge)| (edge.target(), edge.kind().arm()))
        .collect();
    assert_eq!(arms, vec![(22, Some(0)), (14, Some(1))]);
    assert_eq!(cfg.exits().len(), 2);
    Ok(())
}

#[test]
fn switch_arms() -> Result<()> {
    let image = image(0x4242, |asm, labels| {
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(1))?;
        asm.emit(
            VmOpCode::PushiDword,
            VmOperand::Dword(labels.offset("table") as u32 + 2),
        )?;
        asm.op(VmOpCode::Swt)?;
        let key = asm.key();
        asm.label("default");
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
        asm.op(VmOpCode::Ret)?;
        asm.set_key(key);
        asm.label("arm0");
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(1))?;
        asm.op(VmOpCode::Ret)?;
        asm.set_key(key);
        asm.label("arm1");
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(2))?;
        asm.op(VmOpCode::Ret)?;
        asm.label("table");
        let base = labels.offset("default") as i32;
        asm.emit_switch_table(&[
            labels.offset("arm0") as i32 - base,
            labels.offset("arm1") as i32 - base,
        ]);
        Ok(())
    });

    let result = infer(&image, &InferenceConfig::default())?;
    assert_eq!(result.instruction(12).unwrap().jump_targets(), &[22, 30, 14]);

    let cfg = build_graph(&result)?;
    let targets: Vec<u64> = cfg
        .outgoing_edges(cfg.entry())
        .map(|(_, _, edge)| edge.target())
        .collect();
    assert_eq!(targets, vec![22, 30, 14]);
    Ok(())
}

#[test]
fn handler_entry_has_empty_stack() -> Result<()> {
    let table = scrambled_table();
    let catch = u32::from(table.eh_type_id(EhType::Catch));
    let image = image(0x77, move |asm, labels| {
        asm.emit(VmOpCode::PushiDword, labels.dword("handler"))?;
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(1))?;
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(catch))?;
        asm.op(VmOpCode::Try)?;
        let key = asm.key();
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(3))?;
        asm.emit(VmOpCode::PushiDword, labels.dword("handler"))?;
        asm.op(VmOpCode::Leave)?;
        asm.op(VmOpCode::Ret)?;
        asm.set_key(key);
        asm.label("handler");
        asm.emit(VmOpCode::PushrDword, VmOperand::Register(VmRegister::R0))?;
        asm.op(VmOpCode::Ret)?;
        Ok(())
    });

    let result = infer(&image, &InferenceConfig::default())?;
    assert_eq!(result.eh_frames.len(), 1);
    let frame = &result.eh_frames[0];
    assert_eq!(frame.kind, EhType::Catch);
    assert_eq!(frame.catch_type, Some(1));

    let handler = result.instruction(frame.handler).unwrap();
    assert_eq!(handler.state.stack.depth(), 0);
    assert!(handler.state.eh_stack.is_empty());

    let cfg = build_graph(&result)?;
    let kinds: Vec<CfgEdgeKind> = cfg
        .outgoing_edges(cfg.entry())
        .map(|(_, _, edge)| edge.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![CfgEdgeKind::ExceptionHandler {
            kind: EhType::Catch
        }]
    );
    Ok(())
}

#[test]
fn unwritten_register_target_fails_only_its_export() {
    let image = image(0x3C, |asm, _| {
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
        asm.emit(VmOpCode::PushrQword, VmOperand::Register(VmRegister::R5))?;
        asm.op(VmOpCode::Jmp)?;
        Ok(())
    });

    let mut devirtualizer = Devirtualizer::new(image, InferenceConfig::default());
    let report = devirtualizer.run().unwrap();

    assert!(report.is_empty());
    let failure = report.failure(1).unwrap();
    assert_eq!(failure.offset, Some(9));
    assert!(matches!(failure.error, Error::Unresolvable { .. }));
    assert!(failure.error.to_string().contains("R5"));
}

#[test]
fn incomplete_table_is_rejected() {
    let result = OpcodeTableBuilder::sequential()
        .without_opcode(VmOpCode::Swt)
        .build();

    match result {
        Err(error @ Error::IncompleteTable { .. }) => assert!(error.is_fatal()),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn depth_mismatch_is_fatal() {
    let image = image(0x10, |asm, labels| {
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
        asm.emit(VmOpCode::PushiDword, labels.dword("join"))?;
        asm.op(VmOpCode::Jz)?;
        let key = asm.key();
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(5))?;
        asm.set_key(key);
        asm.label("join");
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
        asm.op(VmOpCode::Ret)?;
        Ok(())
    });

    let mut devirtualizer = Devirtualizer::new(image, InferenceConfig::default());
    match devirtualizer.run() {
        Err(Error::StateConsistency { offset, .. }) => assert_eq!(offset, 20),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn loop_reaches_fixpoint() -> Result<()> {
    let image = image(0x5A, |asm, labels| {
        asm.label("top");
        asm.emit(VmOpCode::PushrDword, VmOperand::Register(VmRegister::R2))?;
        asm.emit(VmOpCode::PushiDword, labels.dword("top"))?;
        asm.op(VmOpCode::Jnz)?;
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
        asm.op(VmOpCode::Ret)?;
        Ok(())
    });

    let result = infer(&image, &InferenceConfig::default())?;
    assert_eq!(result.block_headers, BTreeSet::from([0, 11]));

    let cfg = build_graph(&result)?;
    let head = cfg.block_at(0).unwrap();
    assert!(cfg.predecessors(head).any(|node| node == head));
    Ok(())
}
