//! Architecture tags and the register file the unwinder mutates.
//!
//! Only the two mobile targets are modeled. Register identifiers follow the
//! DWARF numbering for each architecture so that unwind metadata can name
//! registers without translation.

use std::fmt;

/// Target architecture of an image and of the register state being unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit ARM, variable-width (Thumb) instruction encodings.
    Arm,
    /// 64-bit ARM, fixed 4-byte instructions.
    Arm64,
}

impl Arch {
    /// Size in bytes of a machine word (and of a stack slot).
    #[must_use]
    pub fn word_size(self) -> usize {
        match self {
            Arch::Arm => 4,
            Arch::Arm64 => 8,
        }
    }

    /// Number of modeled registers.
    #[must_use]
    pub fn register_count(self) -> usize {
        match self {
            Arch::Arm => 16,
            Arch::Arm64 => 33,
        }
    }

    /// DWARF register number holding the stack pointer.
    #[must_use]
    pub fn sp(self) -> u8 {
        match self {
            Arch::Arm => 13,
            Arch::Arm64 => 31,
        }
    }

    /// DWARF register number holding the return address after a call.
    #[must_use]
    pub fn ra(self) -> u8 {
        match self {
            Arch::Arm => 14,
            Arch::Arm64 => 30,
        }
    }

    /// DWARF register number of the frame pointer.
    #[must_use]
    pub fn fp(self) -> u8 {
        match self {
            Arch::Arm => 11,
            Arch::Arm64 => 29,
        }
    }

    /// Stable one-byte tag used in the on-disk table header.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Arch::Arm => 1,
            Arch::Arm64 => 2,
        }
    }

    /// Inverse of [`Arch::tag`].
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Arch> {
        match tag {
            1 => Some(Arch::Arm),
            2 => Some(Arch::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Arm => write!(f, "arm"),
            Arch::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Upper bound on registers across supported architectures.
pub const MAX_REGISTERS: usize = 33;

/// Word-sized registers indexed by architecture-specific identifiers.
///
/// The program counter is modeled as a register slot past the DWARF set so
/// that the unwinder can treat it uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    arch: Arch,
    regs: [u64; MAX_REGISTERS],
    pc: u64,
}

impl RegisterFile {
    /// All-zero register file for `arch`.
    #[must_use]
    pub fn new(arch: Arch) -> Self {
        Self { arch, regs: [0; MAX_REGISTERS], pc: 0 }
    }

    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Read register `reg`; out-of-range identifiers read as zero.
    #[must_use]
    pub fn get(&self, reg: u8) -> u64 {
        if (reg as usize) < self.arch.register_count() {
            self.regs[reg as usize]
        } else {
            0
        }
    }

    /// Write register `reg`; out-of-range identifiers are ignored.
    pub fn set(&mut self, reg: u8, value: u64) {
        if (reg as usize) < self.arch.register_count() {
            self.regs[reg as usize] = value;
        }
    }

    #[must_use]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    #[must_use]
    pub fn sp(&self) -> u64 {
        self.get(self.arch.sp())
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.set(self.arch.sp(), sp);
    }

    /// Value of the return-address register.
    #[must_use]
    pub fn ra(&self) -> u64 {
        self.get(self.arch.ra())
    }

    #[must_use]
    pub fn fp(&self) -> u64 {
        self.get(self.arch.fp())
    }
}
