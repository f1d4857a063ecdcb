//! x64 register definitions and calling-convention selection.
//!
//! The matcher's code generator needs only general-purpose registers:
//! the input cursor lives in the first integer argument register of the
//! host C calling convention, and a handful of scratch registers are
//! chosen to be volatile under both the System V and Windows x64 ABIs.

use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// x64 general-purpose register with its hardware encoding.
///
/// The encoding bits map directly to the instruction format:
/// - Bits 0-2 go in ModR/M (or the opcode for `push`/`pop`)
/// - Bit 3 goes in the REX.B / REX.R prefix bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// Get the hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Get bits 0-2 for ModR/M encoding.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Get bit 3 for the REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// RSP and R12 encode as 0b100, which is the SIB escape: using them
    /// as a base register forces a SIB byte.
    #[inline(always)]
    pub const fn needs_sib_as_base(self) -> bool {
        self.low_bits() == 4
    }

    /// RBP and R13 encode as 0b101, which in mod=00 means `[disp32]`:
    /// using them as a base register forces at least a disp8.
    #[inline(always)]
    pub const fn needs_displacement(self) -> bool {
        self.low_bits() == 5
    }

    /// Get the 64-bit register name.
    pub const fn name_64(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name_64())
    }
}

// =============================================================================
// Calling Conventions
// =============================================================================

/// Host C calling convention, restricted to what the matcher needs: one
/// pointer argument in, one boolean out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Windows x64 ABI (Microsoft x64).
    WindowsX64,
    /// System V AMD64 ABI (Linux, macOS, BSD).
    SystemV,
}

impl CallingConvention {
    /// Detect the calling convention for the current platform.
    #[cfg(target_os = "windows")]
    pub const fn host() -> Self {
        CallingConvention::WindowsX64
    }

    #[cfg(not(target_os = "windows"))]
    pub const fn host() -> Self {
        CallingConvention::SystemV
    }

    /// The first integer argument register: the matcher's input cursor.
    pub const fn arg0(self) -> Gpr {
        match self {
            CallingConvention::WindowsX64 => Gpr::Rcx,
            CallingConvention::SystemV => Gpr::Rdi,
        }
    }

    /// The integer return register.
    pub const fn int_return_reg(self) -> Gpr {
        Gpr::Rax
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_encoding() {
        assert_eq!(Gpr::Rax.encoding(), 0);
        assert_eq!(Gpr::Rdi.encoding(), 7);
        assert_eq!(Gpr::R8.encoding(), 8);
        assert_eq!(Gpr::R15.encoding(), 15);
    }

    #[test]
    fn test_gpr_low_high_bits() {
        assert_eq!(Gpr::R9.low_bits(), 1);
        assert!(Gpr::R9.high_bit());
        assert_eq!(Gpr::Rdx.low_bits(), 2);
        assert!(!Gpr::Rdx.high_bit());
    }

    #[test]
    fn test_gpr_encoding_hazards() {
        assert!(Gpr::Rsp.needs_sib_as_base());
        assert!(Gpr::R12.needs_sib_as_base());
        assert!(Gpr::Rbp.needs_displacement());
        assert!(Gpr::R13.needs_displacement());
        assert!(!Gpr::Rdi.needs_sib_as_base());
        assert!(!Gpr::Rdi.needs_displacement());
    }

    #[test]
    fn test_host_calling_convention() {
        let cc = CallingConvention::host();
        assert_eq!(cc.int_return_reg(), Gpr::Rax);
        // The cursor register is volatile under its own convention.
        assert!(matches!(cc.arg0(), Gpr::Rdi | Gpr::Rcx));
    }
}
