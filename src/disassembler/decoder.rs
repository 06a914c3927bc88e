//! Rolling-key instruction decoding.
//!
//! Every byte of an instruction is stored XOR-encrypted with the low byte of a 32-bit key
//! that evolves with each decoded byte:
//!
//! ```text
//! decoded = raw ^ (key & 0xFF)
//! key     = key * 7 + decoded      (wrapping)
//! ```
//!
//! An instruction is the opcode byte, one padding byte, and 0, 1, 4 or 8 operand bytes
//! depending on the opcode's [`crate::vm::OperandKind`]. Because the key depends on every
//! byte decoded so far, the key at a given offset depends on the path that reached it, and
//! decoding must happen per path during inference.
//!
//! # Example
//!
//! ```rust
//! use vmscope::{
//!     disassembler::{StreamDecoder, VmAssembler, VmOperand},
//!     file::BytecodeBlob,
//!     vm::{OpcodeTableBuilder, VmOpCode},
//! };
//!
//! let table = OpcodeTableBuilder::sequential().build()?;
//! let mut assembler = VmAssembler::new(&table, 0x5EED);
//! assembler.emit(VmOpCode::PushiDword, VmOperand::Dword(26))?;
//! assembler.emit(VmOpCode::Ret, VmOperand::None)?;
//! let blob = BytecodeBlob::from_mem(assembler.finish());
//!
//! let decoder = StreamDecoder::new(&blob, &table);
//! let (push, key) = decoder.decode_at(0, 0x5EED)?;
//! assert_eq!(push.operand, VmOperand::Dword(26));
//! let (ret, _) = decoder.decode_at(push.next_offset(), key)?;
//! assert_eq!(ret.opcode, VmOpCode::Ret);
//! # Ok::<(), vmscope::Error>(())
//! ```

use crate::{
    disassembler::{VmInstruction, VmOperand},
    file::BytecodeBlob,
    utils::io::read_le,
    vm::{OpcodeTable, OperandKind},
    Result,
};

/// Advances the rolling key over one decoded byte.
#[must_use]
#[inline]
pub const fn next_key(key: u32, decoded: u8) -> u32 {
    key.wrapping_mul(7).wrapping_add(decoded as u32)
}

/// Reads and decrypts bytes from a position, tracking the rolling key.
struct KeyedReader<'a> {
    data: &'a [u8],
    position: u64,
    key: u32,
}

impl<'a> KeyedReader<'a> {
    fn new(data: &'a [u8], position: u64, key: u32) -> Self {
        KeyedReader {
            data,
            position,
            key,
        }
    }

    fn next_byte(&mut self) -> Option<u8> {
        let index = usize::try_from(self.position).ok()?;
        let raw = *self.data.get(index)?;
        let decoded = raw ^ (self.key as u8);
        self.key = next_key(self.key, decoded);
        self.position += 1;
        Some(decoded)
    }

    fn fill(&mut self, buffer: &mut [u8]) -> Option<()> {
        for slot in buffer.iter_mut() {
            *slot = self.next_byte()?;
        }
        Some(())
    }
}

/// Decodes single instructions out of a [`BytecodeBlob`].
///
/// The decoder is stateless: [`StreamDecoder::decode_at`] is a pure function of the position
/// and the key, so it can be shared freely.
#[derive(Debug, Clone, Copy)]
pub struct StreamDecoder<'a> {
    blob: &'a BytecodeBlob,
    table: &'a OpcodeTable,
}

impl<'a> StreamDecoder<'a> {
    /// Creates a decoder over `blob` translating bytes through `table`.
    #[must_use]
    pub fn new(blob: &'a BytecodeBlob, table: &'a OpcodeTable) -> Self {
        StreamDecoder { blob, table }
    }

    /// Decodes the instruction at `position` using `key`, and returns it together with the
    /// key for the following byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::Decode`] if the opcode or register byte is not part of the
    /// table, or the blob ends inside the instruction.
    pub fn decode_at(&self, position: u64, key: u32) -> Result<(VmInstruction, u32)> {
        let mut reader = KeyedReader::new(self.blob.data(), position, key);

        let opcode_byte = reader
            .next_byte()
            .ok_or_else(|| decode_error!(position, "stream ends before the opcode"))?;
        let opcode = self
            .table
            .opcode(opcode_byte)
            .ok_or_else(|| decode_error!(position, "unknown opcode byte 0x{:02x}", opcode_byte))?;

        reader
            .next_byte()
            .ok_or_else(|| decode_error!(position, "stream ends inside {}", opcode))?;

        let truncated = || decode_error!(position, "stream ends inside the operand of {}", opcode);
        let operand = match opcode.info().operand {
            OperandKind::None => VmOperand::None,
            OperandKind::Register => {
                let byte = reader.next_byte().ok_or_else(truncated)?;
                let register = self.table.register(byte).ok_or_else(|| {
                    decode_error!(position, "unknown register byte 0x{:02x}", byte)
                })?;
                VmOperand::Register(register)
            }
            OperandKind::Dword => {
                let mut bytes = [0u8; 4];
                reader.fill(&mut bytes).ok_or_else(truncated)?;
                VmOperand::Dword(read_le::<u32>(&bytes)?)
            }
            OperandKind::Qword => {
                let mut bytes = [0u8; 8];
                reader.fill(&mut bytes).ok_or_else(truncated)?;
                VmOperand::Qword(read_le::<u64>(&bytes)?)
            }
        };

        Ok((
            VmInstruction::new(position, key, opcode, operand),
            reader.key,
        ))
    }
}

/// Recomputes the key at `end` by decrypting every byte from `start` with the initial
/// `key`.
///
/// For a straight-line run of instructions this must equal the key returned by decoding the
/// run instruction by instruction.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the range exceeds the blob or is reversed.
pub fn replay_key(blob: &BytecodeBlob, start: u64, key: u32, end: u64) -> Result<u32> {
    let len = end
        .checked_sub(start)
        .and_then(|len| usize::try_from(len).ok())
        .ok_or(crate::Error::OutOfBounds)?;

    Ok(blob
        .data_slice(start, len)?
        .iter()
        .fold(key, |key, &raw| next_key(key, raw ^ (key as u8))))
}
