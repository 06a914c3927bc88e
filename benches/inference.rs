//! Benchmarks for inference and graph construction.
//!
//! The synthetic export is a ladder of conditional jumps: every rung tests a register,
//! returns on one arm and continues to the next rung on the other. Each rung adds two
//! blocks and one resolved branch, so the cost scales with the number of rungs.

extern crate vmscope;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use vmscope::{
    analysis::build_graph,
    disassembler::{StreamDecoder, VmAssembler, VmOperand},
    prelude::*,
};

const RUNG: u64 = 3 + 6 + 2 + 6 + 2;

fn ladder(rungs: u64) -> VmImage {
    let table = OpcodeTableBuilder::sequential().build().unwrap();
    let mut asm = VmAssembler::new(&table, 0xBEEF);

    let registers = [
        VmRegister::R0,
        VmRegister::R1,
        VmRegister::R2,
        VmRegister::R3,
        VmRegister::R4,
        VmRegister::R5,
        VmRegister::R6,
        VmRegister::R7,
    ];
    for rung in 0..rungs {
        let register = registers[(rung % 8) as usize];
        asm.emit(VmOpCode::PushrDword, VmOperand::Register(register))
            .unwrap();
        asm.emit(
            VmOpCode::PushiDword,
            VmOperand::Dword(((rung + 1) * RUNG) as u32),
        )
        .unwrap();
        asm.op(VmOpCode::Jz).unwrap();
        let key = asm.key();
        asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0)).unwrap();
        asm.op(VmOpCode::Ret).unwrap();
        asm.set_key(key);
    }
    asm.emit(VmOpCode::PushiDword, VmOperand::Dword(1)).unwrap();
    asm.op(VmOpCode::Ret).unwrap();

    let bytes = asm.finish();
    let exports: ExportTable = [ExportInfo::new(
        1,
        0,
        0xBEEF,
        ExportSignature {
            flags: 0,
            parameter_types: Vec::new(),
            return_type: 0,
        },
    )]
    .into_iter()
    .collect();

    VmImage::new(
        BytecodeBlob::from_mem(bytes),
        table,
        exports,
        ReferenceTable::new(),
    )
}

/// Benchmark decoding the ladder linearly, without any state tracking.
///
/// Every rung after a `RET` is keyed like the jump that reaches it.
fn bench_decode(c: &mut Criterion) {
    let image = ladder(256);
    let decoder = StreamDecoder::new(image.blob(), image.table());

    c.bench_function("decode_ladder_256", |b| {
        b.iter(|| {
            let mut position = 0;
            let mut key = 0xBEEF;
            let mut branch_key = key;
            while position < image.blob().len() as u64 {
                let (instruction, next) = decoder.decode_at(position, key).unwrap();
                position = instruction.next_offset();
                key = match instruction.opcode {
                    VmOpCode::Jz => {
                        branch_key = next;
                        next
                    }
                    VmOpCode::Ret => branch_key,
                    _ => next,
                };
            }
            black_box(key)
        });
    });
}

/// Benchmark inference of a single export for growing ladder sizes.
fn bench_inference(c: &mut Criterion) {
    let mut group = c.benchmark_group("inference");
    let config = InferenceConfig::default().with_min_severity(DiagnosticSeverity::Error);

    for rungs in [16, 128, 512] {
        let image = ladder(rungs);
        group.bench_with_input(BenchmarkId::from_parameter(rungs), &image, |b, image| {
            b.iter(|| {
                let diagnostics = Diagnostics::with_min_severity(DiagnosticSeverity::Error);
                let result = InferenceDisassembler::new(image, &config, &diagnostics)
                    .disassemble(1)
                    .unwrap();
                black_box(result)
            });
        });
    }
    group.finish();
}

/// Benchmark graph construction from a finished inference result.
fn bench_build_graph(c: &mut Criterion) {
    let image = ladder(512);
    let config = InferenceConfig::default();
    let diagnostics = Diagnostics::new();
    let result = InferenceDisassembler::new(&image, &config, &diagnostics)
        .disassemble(1)
        .unwrap();

    c.bench_function("build_graph_512", |b| {
        b.iter(|| black_box(build_graph(black_box(&result)).unwrap()));
    });
}

criterion_group!(benches, bench_decode, bench_inference, bench_build_graph);
criterion_main!(benches);
