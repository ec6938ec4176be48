//! Machine types and architecture descriptors.
//!
//! One closed enumeration covers every CPU architecture the client can
//! debug. All architectures compile into the binary; the active one is
//! chosen once, at attach, from the target's handshake reply. There is no
//! link-time or per-platform selection.

use std::fmt;

use crate::error::{DebugError, Result};

/// Target CPU architecture.
///
/// Immutable once a session is attached: it determines the register layout,
/// the word size, and the breakpoint trap encoding for the whole session.
///
/// The discriminants double as the wire tag carried in the attach handshake
/// (tag `0` is reserved as invalid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineType
{
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X64,
    /// ARMv6 (ARM11 class).
    Armv6,
    /// ARMv7.
    Armv7,
}

/// Fixed per-architecture constants.
///
/// One static table entry per [`MachineType`]; never constructed at runtime.
#[derive(Debug)]
pub struct ArchDescriptor
{
    /// Register names in snapshot index order.
    pub register_names: &'static [&'static str],
    /// Size of one register value on the wire, 4 or 8 bytes.
    pub word_size: usize,
    /// Instruction bytes written into target memory to arm a breakpoint.
    pub breakpoint_opcode: &'static [u8],
    /// Snapshot index of the program counter.
    pub pc_index: usize,
    /// Snapshot index of the stack pointer.
    pub sp_index: usize,
    /// Snapshot index of the frame pointer.
    pub fp_index: usize,
}

impl ArchDescriptor
{
    /// Number of registers in a snapshot.
    #[must_use]
    pub fn register_count(&self) -> usize
    {
        self.register_names.len()
    }

    /// Exact byte length of a register snapshot on the wire.
    #[must_use]
    pub fn snapshot_len(&self) -> usize
    {
        self.register_count() * self.word_size
    }

    /// Snapshot index of a register by name, if it exists.
    #[must_use]
    pub fn register_index(&self, name: &str) -> Option<usize>
    {
        self.register_names.iter().position(|candidate| *candidate == name)
    }
}

static X86_DESCRIPTOR: ArchDescriptor = ArchDescriptor {
    register_names: &[
        "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags",
    ],
    word_size: 4,
    breakpoint_opcode: &[0xcc], // int3
    pc_index: 8,
    sp_index: 4,
    fp_index: 5,
};

static X64_DESCRIPTOR: ArchDescriptor = ArchDescriptor {
    register_names: &[
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
        "rip", "rflags",
    ],
    word_size: 8,
    breakpoint_opcode: &[0xcc], // int3
    pc_index: 16,
    sp_index: 4,
    fp_index: 5,
};

// ARMv6 and ARMv7 share the classic ARM-mode layout; they differ in
// available system instructions, not in the general register file.
static ARM_DESCRIPTOR: ArchDescriptor = ArchDescriptor {
    register_names: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr", "pc", "cpsr",
    ],
    word_size: 4,
    breakpoint_opcode: &[0x70, 0x00, 0x20, 0xe1], // bkpt #0, ARM encoding, little-endian
    pc_index: 15,
    sp_index: 13,
    fp_index: 11,
};

impl MachineType
{
    /// The machine type of the host this client is running on.
    ///
    /// Used during the attach handshake to tell the target which register
    /// layout the client expects. An unsupported host architecture is a
    /// fatal configuration error, never silently defaulted.
    ///
    /// ## Errors
    ///
    /// `UnsupportedMachine` when the host architecture has no descriptor.
    pub fn host() -> Result<Self>
    {
        if cfg!(target_arch = "x86_64") {
            Ok(MachineType::X64)
        } else if cfg!(target_arch = "x86") {
            Ok(MachineType::X86)
        } else if cfg!(target_arch = "arm") {
            Ok(MachineType::Armv7)
        } else {
            // Tag 0 is the reserved invalid tag.
            Err(DebugError::UnsupportedMachine(0))
        }
    }

    /// The wire tag for this machine type.
    #[must_use]
    pub fn tag(self) -> u8
    {
        match self {
            MachineType::X86 => 1,
            MachineType::X64 => 2,
            MachineType::Armv6 => 3,
            MachineType::Armv7 => 4,
        }
    }

    /// Decode a wire tag into a machine type.
    ///
    /// ## Errors
    ///
    /// `UnsupportedMachine` for any tag outside the closed set. The caller
    /// treats this as fatal; a session is never attached with a guessed
    /// layout.
    pub fn from_tag(tag: u8) -> Result<Self>
    {
        match tag {
            1 => Ok(MachineType::X86),
            2 => Ok(MachineType::X64),
            3 => Ok(MachineType::Armv6),
            4 => Ok(MachineType::Armv7),
            other => Err(DebugError::UnsupportedMachine(other)),
        }
    }

    /// The architecture descriptor for this machine type.
    ///
    /// Total over the closed enum; there is no fallback entry.
    #[must_use]
    pub fn descriptor(self) -> &'static ArchDescriptor
    {
        match self {
            MachineType::X86 => &X86_DESCRIPTOR,
            MachineType::X64 => &X64_DESCRIPTOR,
            MachineType::Armv6 | MachineType::Armv7 => &ARM_DESCRIPTOR,
        }
    }
}

impl fmt::Display for MachineType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            MachineType::X86 => "x86",
            MachineType::X64 => "x64",
            MachineType::Armv6 => "armv6",
            MachineType::Armv7 => "armv7",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_tag_roundtrip()
    {
        for machine in [MachineType::X86, MachineType::X64, MachineType::Armv6, MachineType::Armv7] {
            assert_eq!(MachineType::from_tag(machine.tag()).unwrap(), machine);
        }
    }

    #[test]
    fn test_unknown_tag_is_fatal_config_error()
    {
        assert!(matches!(
            MachineType::from_tag(0),
            Err(DebugError::UnsupportedMachine(0))
        ));
        assert!(matches!(
            MachineType::from_tag(99),
            Err(DebugError::UnsupportedMachine(99))
        ));
    }

    #[test]
    fn test_descriptor_shapes()
    {
        let x64 = MachineType::X64.descriptor();
        assert_eq!(x64.register_count(), 18);
        assert_eq!(x64.word_size, 8);
        assert_eq!(x64.snapshot_len(), 144);
        assert_eq!(x64.register_names[x64.pc_index], "rip");

        let x86 = MachineType::X86.descriptor();
        assert_eq!(x86.word_size, 4);
        assert_eq!(x86.register_names[x86.pc_index], "eip");

        let arm = MachineType::Armv7.descriptor();
        assert_eq!(arm.register_names[arm.pc_index], "pc");
        assert_eq!(arm.breakpoint_opcode.len(), 4);
        // ARMv6 shares the ARM layout.
        assert_eq!(MachineType::Armv6.descriptor().snapshot_len(), arm.snapshot_len());
    }

    #[test]
    fn test_register_index_lookup()
    {
        let x64 = MachineType::X64.descriptor();
        assert_eq!(x64.register_index("rsp"), Some(4));
        assert_eq!(x64.register_index("xyz"), None);
    }
}
