//! Hardware occurrences reported by a simulator backend.
//!
//! An [`Occurrence`] is one concrete thing that happened inside the
//! simulated target: one instruction fetched, one memory access, one
//! interrupt, and so on.  Backends report occurrences to the
//! [`SimulatorController`](crate::controller::SimulatorController), which
//! matches them against the pending waits.
//!
//! Occurrences are plain serde values so that a backend run can be recorded
//! as a trace and replayed later (see `tripwire-sim`).

use crate::listener::WaitClass;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A simulator-specific guest address.
pub type Address = u64;

/// Backend-assigned handle of an armed timer.
pub type TimerId = u64;

/// Address wildcard (breakpoints, memory accesses, address spaces).
pub const ANY_ADDR: Address = Address::MAX;
/// Opcode wildcard for jump waits.
pub const ANY_INSTR: u32 = u32::MAX;
/// Trap-number wildcard.
pub const ANY_TRAP: u32 = u32::MAX;
/// Interrupt-number wildcard.
pub const ANY_INTERRUPT: u32 = u32::MAX;

// ═══════════════════════════════════════════════════════════════════════
//  Memory access type
// ═══════════════════════════════════════════════════════════════════════

/// Memory access direction, used both as the kind of an actual access and
/// as the bitmask a memory wait watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AccessType {
    Unknown = 0x0,
    Read = 0x1,
    Write = 0x2,
    ReadWrite = 0x3,
}

impl AccessType {
    /// Access type of a single read or write.
    #[inline]
    pub fn from_write(is_write: bool) -> Self {
        if is_write {
            AccessType::Write
        } else {
            AccessType::Read
        }
    }

    /// Raw bitmask value.
    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Whether the two masks share at least one direction.
    #[inline]
    pub fn intersects(self, other: AccessType) -> bool {
        self.bits() & other.bits() != 0
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessType::Unknown => "unknown",
            AccessType::Read => "read",
            AccessType::Write => "write",
            AccessType::ReadWrite => "read/write",
        };
        f.write_str(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Occurrence
// ═══════════════════════════════════════════════════════════════════════

/// One hardware-level occurrence inside the simulated machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Occurrence {
    /// The instruction pointer reached `ip` inside `address_space`.
    Breakpoint { ip: Address, address_space: Address },
    /// A memory access of `width` bytes starting at `addr`, caused by the
    /// instruction at `ip`.
    MemoryAccess {
        addr: Address,
        width: usize,
        access: AccessType,
        ip: Address,
    },
    /// Interrupt `number` was raised.
    Interrupt { number: u32, nmi: bool },
    /// Trap `number` was raised.
    Trap { number: u32 },
    /// The guest sent `data` over its communication channel on `port`.
    GuestIo { data: u8, port: u32 },
    /// Port I/O on architectures with a separate I/O space.
    IoPort { data: u8, port: u32, out: bool },
    /// A conditional jump with `opcode` was taken.
    Jump { flag_triggered: bool, opcode: u32 },
    /// The backend timer `timer` expired.
    Timer { timer: TimerId },
}

impl Occurrence {
    /// The wait classes this occurrence can satisfy.
    pub fn classes(&self) -> &'static [WaitClass] {
        match self {
            Occurrence::Breakpoint { .. } => &[WaitClass::Breakpoint, WaitClass::BreakpointRange],
            Occurrence::MemoryAccess { .. } => &[WaitClass::MemoryAccess],
            Occurrence::Interrupt { .. } => &[WaitClass::Interrupt],
            Occurrence::Trap { .. } => &[WaitClass::Trap],
            Occurrence::GuestIo { .. } => &[WaitClass::GuestIo],
            Occurrence::IoPort { .. } => &[WaitClass::IoPort],
            Occurrence::Jump { .. } => &[WaitClass::Jump],
            Occurrence::Timer { .. } => &[WaitClass::Timer],
        }
    }

    /// Short human-readable name of the occurrence kind.
    pub fn name(&self) -> &'static str {
        match self {
            Occurrence::Breakpoint { .. } => "breakpoint",
            Occurrence::MemoryAccess { .. } => "memory-access",
            Occurrence::Interrupt { .. } => "interrupt",
            Occurrence::Trap { .. } => "trap",
            Occurrence::GuestIo { .. } => "guest-io",
            Occurrence::IoPort { .. } => "io-port",
            Occurrence::Jump { .. } => "jump",
            Occurrence::Timer { .. } => "timer",
        }
    }
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Occurrence::Breakpoint { ip, address_space } => {
                if *address_space == ANY_ADDR {
                    write!(f, "breakpoint ip={:#x}", ip)
                } else {
                    write!(f, "breakpoint ip={:#x} as={:#x}", ip, address_space)
                }
            }
            Occurrence::MemoryAccess {
                addr,
                width,
                access,
                ip,
            } => write!(
                f,
                "memory {} addr={:#x} width={} ip={:#x}",
                access, addr, width, ip
            ),
            Occurrence::Interrupt { number, nmi } => {
                write!(f, "interrupt {}{}", number, if *nmi { " (nmi)" } else { "" })
            }
            Occurrence::Trap { number } => write!(f, "trap {}", number),
            Occurrence::GuestIo { data, port } => {
                write!(f, "guest-io data={:#04x} port={}", data, port)
            }
            Occurrence::IoPort { data, port, out } => write!(
                f,
                "io-port {} data={:#04x} port={:#x}",
                if *out { "out" } else { "in" },
                data,
                port
            ),
            Occurrence::Jump {
                flag_triggered,
                opcode,
            } => write!(
                f,
                "jump opcode={:#x} ({})",
                opcode,
                if *flag_triggered { "flag" } else { "register" }
            ),
            Occurrence::Timer { timer } => write!(f, "timer {}", timer),
        }
    }
}
