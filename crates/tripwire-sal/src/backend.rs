//! Collaborator contracts implemented by a concrete simulator backend.
//!
//! The controller never touches guest state directly.  It goes through a
//! [`SimulatorBackend`], which exposes guest memory ([`MemoryManager`]),
//! the register set ([`RegisterManager`]), whole-machine state control
//! (save, restore, reboot, terminate) and a timer facility used to arm
//! timer waits.
//!
//! All methods are called from whichever context is running at the time,
//! so implementations must be `Send` but never see concurrent calls.

use crate::event::{Address, TimerId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Failures reported by a backend.  None of them are fatal: the flow that
/// asked may retry or carry on.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timer unavailable: {0}")]
    TimerUnavailable(String),

    #[error("not supported by this backend: {0}")]
    Unsupported(&'static str),
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory
// ═══════════════════════════════════════════════════════════════════════

/// Access to guest memory.  What happens on an access outside the pool is
/// up to the implementation.
pub trait MemoryManager: Send {
    /// Size of the memory pool in bytes.
    fn pool_size(&self) -> usize;

    /// Lowest guest address of the pool.
    fn start_addr(&self) -> Address;

    fn get_byte(&self, addr: Address) -> u8;

    /// Fill `buf` from guest memory starting at `addr`.
    fn get_bytes(&self, addr: Address, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.get_byte(addr.wrapping_add(i as u64));
        }
    }

    fn set_byte(&mut self, addr: Address, data: u8);

    /// Copy `data` into guest memory starting at `addr`.
    fn set_bytes(&mut self, addr: Address, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.set_byte(addr.wrapping_add(i as u64), b);
        }
    }

    /// Whether `addr` is backed by memory.
    fn is_mapped(&self, addr: Address) -> bool;
}

// ═══════════════════════════════════════════════════════════════════════
//  Registers
// ═══════════════════════════════════════════════════════════════════════

/// Backend-defined register number.
pub type RegisterId = u32;

/// Broad classification of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    General,
    InstructionPointer,
    StackPointer,
    BasePointer,
    Status,
    /// Page-table base or another register that selects the address space.
    AddressSpace,
    Float,
    Vector,
    Segment,
    Control,
}

/// Static description of one register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterInfo {
    pub id: RegisterId,
    pub name: String,
    pub kind: RegisterKind,
    pub width_bits: u32,
}

/// Enumerable, typed register set.
pub trait RegisterManager: Send {
    /// All registers, in a stable order.
    fn registers(&self) -> &[RegisterInfo];

    /// Current value of register `id`; `None` if there is no such register.
    fn get_data(&self, id: RegisterId) -> Option<u64>;

    /// Write register `id`.  Returns `false` if there is no such register.
    fn set_data(&mut self, id: RegisterId, value: u64) -> bool;

    /// First register of `kind`.
    fn find_by_kind(&self, kind: RegisterKind) -> Option<&RegisterInfo> {
        self.registers().iter().find(|r| r.kind == kind)
    }

    fn find_by_name(&self, name: &str) -> Option<&RegisterInfo> {
        self.registers().iter().find(|r| r.name == name)
    }

    fn instruction_pointer(&self) -> Option<Address> {
        self.find_by_kind(RegisterKind::InstructionPointer)
            .and_then(|r| self.get_data(r.id))
    }

    fn stack_pointer(&self) -> Option<Address> {
        self.find_by_kind(RegisterKind::StackPointer)
            .and_then(|r| self.get_data(r.id))
    }

    fn base_pointer(&self) -> Option<Address> {
        self.find_by_kind(RegisterKind::BasePointer)
            .and_then(|r| self.get_data(r.id))
    }

    /// Current address-space identifier, if the architecture has one.
    fn address_space(&self) -> Option<Address> {
        self.find_by_kind(RegisterKind::AddressSpace)
            .and_then(|r| self.get_data(r.id))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Backend
// ═══════════════════════════════════════════════════════════════════════

/// A simulator backend as seen by the controller.
pub trait SimulatorBackend: Send {
    fn memory(&self) -> &dyn MemoryManager;
    fn memory_mut(&mut self) -> &mut dyn MemoryManager;
    fn registers(&self) -> &dyn RegisterManager;
    fn registers_mut(&mut self) -> &mut dyn RegisterManager;

    /// Save the complete machine state to `path`.
    fn save(&mut self, path: &Path) -> Result<(), BackendError>;

    /// Restore machine state previously written by [`save`](Self::save).
    fn restore(&mut self, path: &Path) -> Result<(), BackendError>;

    /// Reset the machine.
    fn reboot(&mut self) -> Result<(), BackendError>;

    /// Stop the simulation with `exit_code`.
    fn terminate(&mut self, exit_code: i32);

    /// Arm a timer that fires after `timeout_ms`, and every `timeout_ms`
    /// thereafter when `repeat` is set.  The backend reports expiry through
    /// `on_timer_fire` with the returned handle.
    fn register_timer(&mut self, timeout_ms: u32, repeat: bool) -> Result<TimerId, BackendError>;

    /// Disarm a timer.  Returns `false` if the handle is unknown.
    fn unregister_timer(&mut self, id: TimerId) -> bool;
}
