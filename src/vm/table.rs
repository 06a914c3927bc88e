//! The byte to semantic lookup table.
//!
//! Every protected binary ships its own random assignment of byte values to opcodes,
//! registers, flags, helper calls, ecall flavours and exception handler kinds. The assignment
//! is recovered from the runtime binary by an external collaborator and handed to this crate
//! as an [`OpcodeTable`]. The table is immutable once built, shared by reference across all
//! exports (and threads), and guaranteed to be total: [`OpcodeTableBuilder::build`] refuses
//! to produce a table that misses or duplicates an entry.
//!
//! # Examples
//!
//! ```rust
//! use vmscope::vm::{OpcodeTableBuilder, VmOpCode, VmRegister};
//!
//! let table = OpcodeTableBuilder::sequential().build()?;
//! let byte = table.opcode_byte(VmOpCode::Ret);
//! assert_eq!(table.opcode(byte), Some(VmOpCode::Ret));
//! assert_eq!(table.register(table.register_byte(VmRegister::Sp)), Some(VmRegister::Sp));
//! # Ok::<(), vmscope::Error>(())
//! ```

use std::fmt;

use strum::{EnumCount, IntoEnumIterator};

use crate::{
    vm::{ECallOpCode, EhType, VmCall, VmFlag, VmFlags, VmOpCode, VmRegister},
    Error, Result,
};

/// An enumeration that is mapped from raw bytes by the [`OpcodeTable`].
pub trait TableEntry: Copy + Eq + fmt::Debug + IntoEnumIterator + EnumCount {
    /// Name of the enumeration, used in error messages.
    const KIND: &'static str;

    /// Dense position of the entry inside its enumeration.
    fn ordinal(self) -> usize;
}

macro_rules! table_entry {
    ($ty:ty, $kind:literal) => {
        impl TableEntry for $ty {
            const KIND: &'static str = $kind;

            fn ordinal(self) -> usize {
                self as usize
            }
        }
    };
}

table_entry!(VmOpCode, "opcode");
table_entry!(VmRegister, "register");
table_entry!(VmFlag, "flag");
table_entry!(VmCall, "vmcall");
table_entry!(ECallOpCode, "ecall opcode");
table_entry!(EhType, "eh type");

/// A total, bijective mapping between bytes and one enumeration.
#[derive(Debug, Clone)]
struct ByteMap<T> {
    forward: [Option<T>; 256],
    reverse: Vec<u8>,
}

impl<T: TableEntry> ByteMap<T> {
    fn build(entries: &[(u8, T)]) -> Result<Self> {
        let mut forward: [Option<T>; 256] = [None; 256];
        let mut reverse: Vec<Option<u8>> = vec![None; T::COUNT];

        for &(byte, entry) in entries {
            if let Some(existing) = forward[usize::from(byte)] {
                if existing != entry {
                    return Err(Error::IncompleteTable {
                        kind: T::KIND,
                        message: format!(
                            "byte 0x{byte:02x} maps to both {existing:?} and {entry:?}"
                        ),
                    });
                }
            }
            if let Some(previous) = reverse[entry.ordinal()] {
                if previous != byte {
                    return Err(Error::IncompleteTable {
                        kind: T::KIND,
                        message: format!(
                            "{entry:?} is mapped by both 0x{previous:02x} and 0x{byte:02x}"
                        ),
                    });
                }
            }

            forward[usize::from(byte)] = Some(entry);
            reverse[entry.ordinal()] = Some(byte);
        }

        let missing: Vec<String> = T::iter()
            .filter(|entry| reverse[entry.ordinal()].is_none())
            .map(|entry| format!("{entry:?}"))
            .collect();
        if !missing.is_empty() {
            return Err(Error::IncompleteTable {
                kind: T::KIND,
                message: format!("missing mapping for {}", missing.join(", ")),
            });
        }

        Ok(ByteMap {
            forward,
            reverse: reverse.into_iter().flatten().collect(),
        })
    }

    fn get(&self, byte: u8) -> Option<T> {
        self.forward[usize::from(byte)]
    }

    fn byte_of(&self, entry: T) -> u8 {
        self.reverse[entry.ordinal()]
    }
}

/// The validated byte to semantic table of one protected binary.
///
/// Built with [`OpcodeTableBuilder`]. All lookups are constant time.
#[derive(Debug, Clone)]
pub struct OpcodeTable {
    opcodes: ByteMap<VmOpCode>,
    registers: ByteMap<VmRegister>,
    flags: ByteMap<VmFlag>,
    vmcalls: ByteMap<VmCall>,
    ecalls: ByteMap<ECallOpCode>,
    eh_types: ByteMap<EhType>,
    helper_init: u32,
    flag_instance: u8,
}

impl OpcodeTable {
    /// Translates a decrypted opcode byte.
    #[must_use]
    pub fn opcode(&self, byte: u8) -> Option<VmOpCode> {
        self.opcodes.get(byte)
    }

    /// Returns the byte encoding `opcode` in this binary.
    #[must_use]
    pub fn opcode_byte(&self, opcode: VmOpCode) -> u8 {
        self.opcodes.byte_of(opcode)
    }

    /// Translates a decrypted register byte.
    #[must_use]
    pub fn register(&self, byte: u8) -> Option<VmRegister> {
        self.registers.get(byte)
    }

    /// Returns the byte encoding `register` in this binary.
    #[must_use]
    pub fn register_byte(&self, register: VmRegister) -> u8 {
        self.registers.byte_of(register)
    }

    /// Translates a raw flag mask into the canonical [`VmFlags`] layout.
    ///
    /// Bits that do not correspond to a known flag are ignored.
    #[must_use]
    pub fn flags(&self, raw: u8) -> VmFlags {
        (0..8)
            .map(|bit| 1u8 << bit)
            .filter(|mask| raw & mask != 0)
            .filter_map(|mask| self.flags.get(mask))
            .fold(VmFlags::empty(), |acc, flag| acc | flag.bit())
    }

    /// Returns the raw mask of `flag` in this binary.
    #[must_use]
    pub fn flag_mask(&self, flag: VmFlag) -> u8 {
        self.flags.byte_of(flag)
    }

    /// Translates a resolved vcall id.
    #[must_use]
    pub fn vmcall(&self, id: u64) -> Option<VmCall> {
        u8::try_from(id).ok().and_then(|byte| self.vmcalls.get(byte))
    }

    /// Returns the id selecting `call` in this binary.
    #[must_use]
    pub fn vmcall_id(&self, call: VmCall) -> u8 {
        self.vmcalls.byte_of(call)
    }

    /// Translates the ecall selector (bits 30-31 of an `ECALL` method id).
    #[must_use]
    pub fn ecall(&self, selector: u8) -> Option<ECallOpCode> {
        self.ecalls.get(selector)
    }

    /// Returns the selector of `opcode` in this binary.
    #[must_use]
    pub fn ecall_selector(&self, opcode: ECallOpCode) -> u8 {
        self.ecalls.byte_of(opcode)
    }

    /// Translates a resolved exception handler type id.
    #[must_use]
    pub fn eh_type(&self, id: u64) -> Option<EhType> {
        u8::try_from(id).ok().and_then(|byte| self.eh_types.get(byte))
    }

    /// Returns the id of `kind` in this binary.
    #[must_use]
    pub fn eh_type_id(&self, kind: EhType) -> u8 {
        self.eh_types.byte_of(kind)
    }

    /// Export id of the runtime initialisation helper.
    #[must_use]
    pub fn helper_init(&self) -> u32 {
        self.helper_init
    }

    /// Mask of the instance bit in export signature flags.
    #[must_use]
    pub fn flag_instance(&self) -> u8 {
        self.flag_instance
    }
}

/// Collects the recovered byte assignments and validates them into an [`OpcodeTable`].
#[derive(Debug, Clone, Default)]
pub struct OpcodeTableBuilder {
    opcodes: Vec<(u8, VmOpCode)>,
    registers: Vec<(u8, VmRegister)>,
    flags: Vec<(u8, VmFlag)>,
    vmcalls: Vec<(u8, VmCall)>,
    ecalls: Vec<(u8, ECallOpCode)>,
    eh_types: Vec<(u8, EhType)>,
    helper_init: Option<u32>,
    flag_instance: Option<u8>,
}

impl OpcodeTableBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder preloaded with a deterministic assignment: every enumeration is
    /// numbered in declaration order, flags use ascending single bits, the helper-init export
    /// id is 0 and the instance flag is `0x01`.
    ///
    /// Mostly useful for synthetic bytecode in tests and benchmarks.
    #[must_use]
    pub fn sequential() -> Self {
        fn numbered<T: TableEntry>() -> Vec<(u8, T)> {
            T::iter()
                .enumerate()
                .filter_map(|(i, entry)| u8::try_from(i).ok().map(|byte| (byte, entry)))
                .collect()
        }

        OpcodeTableBuilder {
            opcodes: numbered(),
            registers: numbered(),
            flags: VmFlag::iter().map(|flag| (flag.bit().bits(), flag)).collect(),
            vmcalls: numbered(),
            ecalls: numbered(),
            eh_types: numbered(),
            helper_init: Some(0),
            flag_instance: Some(0x01),
        }
    }

    /// Maps `byte` to `opcode`.
    #[must_use]
    pub fn opcode(mut self, byte: u8, opcode: VmOpCode) -> Self {
        self.opcodes.push((byte, opcode));
        self
    }

    /// Maps `byte` to `register`.
    #[must_use]
    pub fn register(mut self, byte: u8, register: VmRegister) -> Self {
        self.registers.push((byte, register));
        self
    }

    /// Maps the raw mask `mask` to `flag`.
    #[must_use]
    pub fn flag(mut self, mask: u8, flag: VmFlag) -> Self {
        self.flags.push((mask, flag));
        self
    }

    /// Maps vcall id `id` to `call`.
    #[must_use]
    pub fn vmcall(mut self, id: u8, call: VmCall) -> Self {
        self.vmcalls.push((id, call));
        self
    }

    /// Maps ecall selector `selector` to `opcode`.
    #[must_use]
    pub fn ecall(mut self, selector: u8, opcode: ECallOpCode) -> Self {
        self.ecalls.push((selector, opcode));
        self
    }

    /// Maps exception handler type id `id` to `kind`.
    #[must_use]
    pub fn eh_type(mut self, id: u8, kind: EhType) -> Self {
        self.eh_types.push((id, kind));
        self
    }

    /// Sets the export id of the runtime initialisation helper.
    #[must_use]
    pub fn helper_init(mut self, id: u32) -> Self {
        self.helper_init = Some(id);
        self
    }

    /// Sets the mask of the instance bit in export signature flags.
    #[must_use]
    pub fn flag_instance(mut self, mask: u8) -> Self {
        self.flag_instance = Some(mask);
        self
    }

    /// Removes every mapping of `opcode`, leaving the table incomplete.
    #[must_use]
    pub fn without_opcode(mut self, opcode: VmOpCode) -> Self {
        self.opcodes.retain(|&(_, mapped)| mapped != opcode);
        self
    }

    /// Validates the collected assignments.
    ///
    /// # Errors
    /// Returns [`Error::IncompleteTable`] if any enumeration misses an entry, an entry is
    /// mapped by two different bytes, a byte maps to two entries of the same kind, or one of
    /// the two scalar constants is unset.
    pub fn build(self) -> Result<OpcodeTable> {
        let helper_init = self.helper_init.ok_or(Error::IncompleteTable {
            kind: "constant",
            message: "helper-init export id is not set".to_string(),
        })?;
        let flag_instance = self.flag_instance.ok_or(Error::IncompleteTable {
            kind: "constant",
            message: "instance flag mask is not set".to_string(),
        })?;

        Ok(OpcodeTable {
            opcodes: ByteMap::build(&self.opcodes)?,
            registers: ByteMap::build(&self.registers)?,
            flags: ByteMap::build(&self.flags)?,
            vmcalls: ByteMap::build(&self.vmcalls)?,
            ecalls: ByteMap::build(&self.ecalls)?,
            eh_types: ByteMap::build(&self.eh_types)?,
            helper_init,
            flag_instance,
        })
    }
}
