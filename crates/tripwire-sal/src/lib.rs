//! Simulator abstraction layer for fault-injection experiments.
//!
//! Experiment logic is written as blocking, straight-line *flows* that wait
//! for hardware-level occurrences reported by a simulator backend.  This
//! crate provides:
//!
//! 1. **[`listener`]**: wait descriptors (breakpoints, memory watches,
//!    interrupts, traps, guest and port I/O, jumps, timers)
//! 2. **[`registry`]**: pending / ready / tombstoned wait bookkeeping
//! 3. **[`cache`]**: per-class and per-address index over pending waits
//! 4. **[`scheduler`]**: cooperative flow scheduler with a resume-from stack
//! 5. **[`controller`]**: the dispatch facade tying everything together
//! 6. **[`backend`]**: traits a concrete simulator implements
//!
//! # Architecture
//!
//! ```text
//! Backend                 SimulatorController          Flows
//! ───────                 ───────────────────          ─────
//! fetch / access ──→ on_breakpoint()   ──→ registry match + ready
//! irq / trap     ──→ on_interrupt()    ──→ deliver_ready() ──→ resume owner
//! timer expiry   ──→ on_timer_fire()                          │
//!                                         ◄── yield_back ─────┘
//!                                             (suspend_until_any)
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod controller;
pub mod event;
pub mod listener;
pub mod registry;
pub mod scheduler;

/// Everything a flow or a backend usually needs.
pub mod prelude {
    pub use crate::backend::{
        BackendError, MemoryManager, RegisterId, RegisterInfo, RegisterKind, RegisterManager,
        SimulatorBackend,
    };
    pub use crate::config::{ControllerConfig, MemoryMatch};
    pub use crate::controller::{ControllerError, Flow, FlowContext, SimulatorController};
    pub use crate::event::{
        AccessType, Address, Occurrence, TimerId, ANY_ADDR, ANY_INSTR, ANY_INTERRUPT, ANY_TRAP,
    };
    pub use crate::listener::{Wait, WaitClass, WaitId, WaitKind};
    pub use crate::scheduler::{Context, FlowId, TaskState};
}
