//! Encrypting bytecode assembler.
//!
//! [`VmAssembler`] is the inverse of [`crate::disassembler::StreamDecoder`]: it translates
//! opcodes and registers through an [`OpcodeTable`] and encrypts every byte with the
//! rolling key. It is used to synthesise bytecode for tests and benchmarks, and to re-encode
//! patched functions.
//!
//! Since jump targets are pushed as immediates *before* the jump, and every decoded operand
//! byte feeds the key of all following bytes, forward references cannot be patched after the
//! fact. [`VmAssembler::assemble`] therefore runs the caller's program twice: the first pass
//! records label offsets (all instruction sizes are fixed), the second pass emits the final
//! bytes with the labels resolved.

use std::collections::BTreeMap;

use crate::{
    disassembler::{decoder::next_key, VmOperand},
    utils::io::write_le,
    vm::{OpcodeTable, OperandKind, VmOpCode},
    Result,
};

/// Label offsets recorded during the first pass of [`VmAssembler::assemble`].
#[derive(Debug, Clone, Default)]
pub struct Labels {
    offsets: BTreeMap<&'static str, u64>,
    keys: BTreeMap<&'static str, u32>,
}

impl Labels {
    /// Offset of `name`, or 0 while the first pass has not reached it.
    #[must_use]
    pub fn offset(&self, name: &str) -> u64 {
        self.offsets.get(name).copied().unwrap_or(0)
    }

    /// Offset of `name` as a `PUSHI_DWORD` operand.
    #[must_use]
    pub fn dword(&self, name: &str) -> VmOperand {
        VmOperand::Dword(self.offset(name) as u32)
    }

    /// Rolling key at `name`, or 0 while unknown.
    #[must_use]
    pub fn key(&self, name: &str) -> u32 {
        self.keys.get(name).copied().unwrap_or(0)
    }
}

/// Encodes and encrypts VM instructions into a flat blob.
///
/// # Examples
///
/// ```rust
/// use vmscope::{
///     disassembler::{VmAssembler, VmOperand},
///     vm::{OpcodeTableBuilder, VmOpCode},
/// };
///
/// let table = OpcodeTableBuilder::sequential().build()?;
/// let bytes = VmAssembler::assemble(&table, 0x10, |asm, labels| {
///     asm.emit(VmOpCode::PushiDword, labels.dword("exit"))?;
///     asm.emit(VmOpCode::Jmp, VmOperand::None)?;
///     asm.label("exit");
///     asm.emit(VmOpCode::PushiDword, VmOperand::Dword(0))?;
///     asm.emit(VmOpCode::Ret, VmOperand::None)?;
///     Ok(())
/// })?;
/// assert_eq!(bytes.len(), 6 + 2 + 6 + 2);
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct VmAssembler<'a> {
    table: &'a OpcodeTable,
    bytes: Vec<u8>,
    key: u32,
    labels: Labels,
}

impl<'a> VmAssembler<'a> {
    /// Creates an assembler writing from offset 0 with the rolling key `key`.
    #[must_use]
    pub fn new(table: &'a OpcodeTable, key: u32) -> Self {
        VmAssembler {
            table,
            bytes: Vec::new(),
            key,
            labels: Labels::default(),
        }
    }

    /// Runs `program` twice, resolving labels between the passes, and returns the bytes of
    /// the second pass.
    ///
    /// # Errors
    /// Propagates errors from `program`.
    pub fn assemble<F>(table: &'a OpcodeTable, key: u32, program: F) -> Result<Vec<u8>>
    where
        F: Fn(&mut VmAssembler<'a>, &Labels) -> Result<()>,
    {
        let mut first = VmAssembler::new(table, key);
        program(&mut first, &Labels::default())?;

        let mut second = VmAssembler::new(table, key);
        program(&mut second, &first.labels)?;
        Ok(second.finish())
    }

    /// Offset the next byte will be written at.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Current rolling key.
    #[must_use]
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Replaces the rolling key, e.g. to emit code reached only by a jump from a path whose
    /// key differs from the linear one.
    pub fn set_key(&mut self, key: u32) {
        self.key = key;
    }

    /// Records the current position and key under `name`.
    pub fn label(&mut self, name: &'static str) -> u64 {
        let position = self.position();
        self.labels.offsets.insert(name, position);
        self.labels.keys.insert(name, self.key);
        position
    }

    /// Labels recorded so far.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    fn encrypt(&mut self, decoded: u8) {
        self.bytes.push(decoded ^ (self.key as u8));
        self.key = next_key(self.key, decoded);
    }

    /// Encodes one instruction and returns its offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the operand does not match the opcode's operand
    /// kind.
    pub fn emit(&mut self, opcode: VmOpCode, operand: VmOperand) -> Result<u64> {
        let offset = self.position();
        let mut operand_bytes = Vec::with_capacity(8);

        match (opcode.info().operand, operand) {
            (OperandKind::None, VmOperand::None) => {}
            (OperandKind::Register, VmOperand::Register(register)) => {
                operand_bytes.push(self.table.register_byte(register));
            }
            (OperandKind::Dword, VmOperand::Dword(value)) => write_le(&mut operand_bytes, value),
            (OperandKind::Qword, VmOperand::Qword(value)) => write_le(&mut operand_bytes, value),
            (kind, operand) => {
                return Err(malformed_error!(
                    "{} expects a {:?} operand, got {:?}",
                    opcode,
                    kind,
                    operand
                ))
            }
        }

        self.encrypt(self.table.opcode_byte(opcode));
        self.encrypt(0);
        for byte in operand_bytes {
            self.encrypt(byte);
        }

        Ok(offset)
    }

    /// Emits an operand-less instruction.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `opcode` takes an operand.
    pub fn op(&mut self, opcode: VmOpCode) -> Result<u64> {
        self.emit(opcode, VmOperand::None)
    }

    /// Appends unencrypted bytes (switch tables) without touching the key.
    pub fn emit_raw(&mut self, data: &[u8]) -> u64 {
        let offset = self.position();
        self.bytes.extend_from_slice(data);
        offset
    }

    /// Appends a switch table: `u16` count followed by `i32` relative entries. Returns the
    /// table address, which points at the first entry.
    pub fn emit_switch_table(&mut self, entries: &[i32]) -> u64 {
        let mut raw = Vec::with_capacity(2 + entries.len() * 4);
        write_le(&mut raw, entries.len() as u16);
        for &entry in entries {
            write_le(&mut raw, entry);
        }
        self.emit_raw(&raw) + 2
    }

    /// Pads with unencrypted zero bytes up to `offset`.
    pub fn pad_to(&mut self, offset: u64) {
        while self.position() < offset {
            self.bytes.push(0);
        }
    }

    /// Returns the assembled bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
