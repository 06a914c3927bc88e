//! VM registers and the flags register layout.

use std::fmt;

use bitflags::bitflags;
use strum::{EnumCount, EnumIter};

/// The sixteen VM registers.
///
/// `R0`..`R7` are general purpose. `BP`, `SP` and `IP` form the calling convention, `FL`
/// holds the flags, `K1`/`K2` are key scratch registers and `M1`/`M2` are reserved for the
/// interpreter.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount)]
pub enum VmRegister {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    Bp,
    Sp,
    Ip,
    Fl,
    K1,
    K2,
    M1,
    M2,
}

impl VmRegister {
    /// Position of this register in a register file.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Canonical register name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            VmRegister::R0 => "R0",
            VmRegister::R1 => "R1",
            VmRegister::R2 => "R2",
            VmRegister::R3 => "R3",
            VmRegister::R4 => "R4",
            VmRegister::R5 => "R5",
            VmRegister::R6 => "R6",
            VmRegister::R7 => "R7",
            VmRegister::Bp => "BP",
            VmRegister::Sp => "SP",
            VmRegister::Ip => "IP",
            VmRegister::Fl => "FL",
            VmRegister::K1 => "K1",
            VmRegister::K2 => "K2",
            VmRegister::M1 => "M1",
            VmRegister::M2 => "M2",
        }
    }
}

impl fmt::Display for VmRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single flag of the `FL` register, as named by the opcode table.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount)]
pub enum VmFlag {
    Overflow,
    Carry,
    Zero,
    Sign,
    Unsigned,
    Behav1,
    Behav2,
    Behav3,
}

impl VmFlag {
    /// The canonical bit of this flag.
    #[must_use]
    pub const fn bit(self) -> VmFlags {
        match self {
            VmFlag::Overflow => VmFlags::OVERFLOW,
            VmFlag::Carry => VmFlags::CARRY,
            VmFlag::Zero => VmFlags::ZERO,
            VmFlag::Sign => VmFlags::SIGN,
            VmFlag::Unsigned => VmFlags::UNSIGNED,
            VmFlag::Behav1 => VmFlags::BEHAV1,
            VmFlag::Behav2 => VmFlags::BEHAV2,
            VmFlag::Behav3 => VmFlags::BEHAV3,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Canonical layout of the `FL` register.
    ///
    /// The protected binary uses randomised bit positions; [`crate::vm::OpcodeTable::flags`]
    /// translates a raw mask into this layout.
    pub struct VmFlags: u8 {
        /// Signed overflow
        const OVERFLOW = 0x01;
        /// Unsigned carry
        const CARRY = 0x02;
        /// Result was zero
        const ZERO = 0x04;
        /// Result was negative
        const SIGN = 0x08;
        /// Comparison is unsigned
        const UNSIGNED = 0x10;
        /// Interpreter behaviour bit 1
        const BEHAV1 = 0x20;
        /// Interpreter behaviour bit 2
        const BEHAV2 = 0x40;
        /// Interpreter behaviour bit 3
        const BEHAV3 = 0x80;
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn register_indices_are_dense() {
        for (i, register) in VmRegister::iter().enumerate() {
            assert_eq!(register.index(), i);
        }
        assert_eq!(VmRegister::COUNT, 16);
        assert_eq!(VmRegister::Bp.to_string(), "BP");
    }

    #[test]
    fn flag_bits_cover_the_byte() {
        let all = VmFlag::iter().fold(VmFlags::empty(), |acc, flag| acc | flag.bit());
        assert_eq!(all, VmFlags::all());
        assert_eq!(all.bits(), 0xFF);
    }
}
