//! Shared fixtures for unit tests.
//!
//! The canonical table scrambles every enumeration so tests never accidentally depend on
//! declaration order, the way real protected binaries never do.

use strum::IntoEnumIterator;

use crate::{
    disassembler::{Labels, VmAssembler},
    file::BytecodeBlob,
    vm::{
        ECallOpCode, EhType, ExportInfo, ExportSignature, FieldReference, MethodReference,
        OpcodeTable, OpcodeTableBuilder, Reference, ReferenceTable, TypeReference, VmCall,
        VmFlag, VmOpCode, VmRegister,
    },
    Result,
};

/// Export id of the runtime initialisation helper in [`canonical_table`].
pub const HELPER_INIT: u32 = 0x7F;

/// Instance flag mask of export signatures in [`canonical_table`].
pub const FLAG_INSTANCE: u8 = 0x20;

/// Builds a total table with a scrambled byte assignment.
pub fn canonical_table() -> OpcodeTable {
    let mut builder = OpcodeTableBuilder::new()
        .helper_init(HELPER_INIT)
        .flag_instance(FLAG_INSTANCE);

    for (i, opcode) in VmOpCode::iter().enumerate() {
        builder = builder.opcode(((i * 37 + 11) % 256) as u8, opcode);
    }
    for (i, register) in VmRegister::iter().enumerate() {
        builder = builder.register(((i * 5 + 3) % 256) as u8, register);
    }
    for (i, flag) in VmFlag::iter().enumerate() {
        builder = builder.flag(1 << ((i + 3) % 8), flag);
    }
    for (i, call) in VmCall::iter().enumerate() {
        builder = builder.vmcall(((i * 13 + 7) % 256) as u8, call);
    }
    for (selector, opcode) in [2, 0, 3, 1].into_iter().zip(ECallOpCode::iter()) {
        builder = builder.ecall(selector, opcode);
    }
    for (i, kind) in EhType::iter().enumerate() {
        builder = builder.eh_type((i * 3 + 1) as u8, kind);
    }

    builder.build().unwrap()
}

/// Assembles a program starting at offset 0 with `key` and wraps it in a blob.
pub fn assemble<'a, F>(table: &'a OpcodeTable, key: u32, program: F) -> BytecodeBlob
where
    F: Fn(&mut VmAssembler<'a>, &Labels) -> Result<()>,
{
    BytecodeBlob::from_mem(VmAssembler::assemble(table, key, program).unwrap())
}

pub fn create_export(id: u32, code_offset: u64, entry_key: u32, parameters: usize) -> ExportInfo {
    ExportInfo::new(
        id,
        code_offset,
        entry_key,
        ExportSignature {
            flags: 0,
            parameter_types: vec![0x0100_0001; parameters],
            return_type: 0x0100_0002,
        },
    )
}

pub fn create_type_ref(name: &str) -> Reference {
    Reference::Type(TypeReference {
        name: name.to_string(),
    })
}

pub fn create_method_ref(
    name: &str,
    parameter_count: usize,
    has_this: bool,
    returns_value: bool,
) -> Reference {
    Reference::Method(MethodReference {
        declaring_type: "System.Object".to_string(),
        name: name.to_string(),
        parameter_count,
        has_this,
        returns_value,
    })
}

pub fn create_field_ref(name: &str) -> Reference {
    Reference::Field(FieldReference {
        declaring_type: "Sample.Holder".to_string(),
        name: name.to_string(),
        is_static: false,
    })
}

/// A small reference table used by the helper call tests.
///
/// | id | reference                                 |
/// |----|-------------------------------------------|
/// | 1  | type `System.String`                      |
/// | 2  | method `Concat(string, string) -> string` |
/// | 3  | instance method `ToString() -> string`    |
/// | 4  | field `Sample.Holder::value`              |
/// | 5  | constructor `.ctor(int)`                  |
pub fn reference_table() -> ReferenceTable {
    [
        (1, create_type_ref("System.String")),
        (2, create_method_ref("Concat", 2, false, true)),
        (3, create_method_ref("ToString", 0, true, true)),
        (4, create_field_ref("value")),
        (5, create_method_ref(".ctor", 1, true, false)),
    ]
    .into_iter()
    .collect()
}
