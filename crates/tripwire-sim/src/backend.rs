//! Scripted reference backend.
//!
//! [`ScriptedBackend`] implements the full backend contract on top of
//! [`FlatMemory`], a [`RegisterFile`] and a [`SimClock`].  It executes no
//! guest code: occurrences come from whoever drives the controller (see
//! [`TraceDriver`](crate::driver::TraceDriver)).
//!
//! Machine state is saved as pretty-printed JSON:
//!
//! ```text
//! { "memory": [...], "registers": { "values": [...] }, "now_ms": 120 }
//! ```

use crate::clock::SimClock;
use crate::cpu::{RegisterFile, RegisterSnapshot};
use crate::memory::FlatMemory;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use tripwire_sal::backend::{BackendError, MemoryManager, RegisterManager, SimulatorBackend};
use tripwire_sal::event::TimerId;

/// Serialisable machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub memory: Vec<u8>,
    pub registers: RegisterSnapshot,
    pub now_ms: u64,
}

/// In-memory backend with a virtual clock.
#[derive(Debug)]
pub struct ScriptedBackend {
    memory: FlatMemory,
    registers: RegisterFile,
    clock: SimClock,
    /// Memory and registers restored by `reboot`.
    boot_image: (Vec<u8>, RegisterSnapshot),
    exit_code: Option<i32>,
    reboots: u32,
}

impl ScriptedBackend {
    /// Wrap `memory` and `registers`; their current contents become the
    /// boot image.
    pub fn new(memory: FlatMemory, registers: RegisterFile) -> Self {
        Self::with_clock(memory, registers, SimClock::new())
    }

    pub fn with_clock(memory: FlatMemory, registers: RegisterFile, clock: SimClock) -> Self {
        let boot_image = (memory.dump(), registers.snapshot());
        Self {
            memory,
            registers,
            clock,
            boot_image,
            exit_code: None,
            reboots: 0,
        }
    }

    /// Handle to the backend's clock, for driving timers.
    pub fn clock(&self) -> SimClock {
        self.clock.clone()
    }

    /// Make the current memory and registers the state `reboot` returns
    /// to.
    pub fn set_boot_image(&mut self) {
        self.boot_image = (self.memory.dump(), self.registers.snapshot());
    }

    pub fn machine_state(&self) -> MachineState {
        MachineState {
            memory: self.memory.dump(),
            registers: self.registers.snapshot(),
            now_ms: self.clock.now_ms(),
        }
    }

    fn load_state(&mut self, state: &MachineState) -> Result<(), BackendError> {
        self.memory.load(&state.memory)?;
        if !self.registers.restore(&state.registers) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "register snapshot does not match this register file",
            )
            .into());
        }
        self.clock.clear_timers();
        self.clock.set_now(state.now_ms);
        Ok(())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn reboots(&self) -> u32 {
        self.reboots
    }
}

impl SimulatorBackend for ScriptedBackend {
    fn memory(&self) -> &dyn MemoryManager {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut dyn MemoryManager {
        &mut self.memory
    }

    fn registers(&self) -> &dyn RegisterManager {
        &self.registers
    }

    fn registers_mut(&mut self) -> &mut dyn RegisterManager {
        &mut self.registers
    }

    fn save(&mut self, path: &Path) -> Result<(), BackendError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.machine_state())?;
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<(), BackendError> {
        let file = File::open(path)?;
        let state: MachineState = serde_json::from_reader(BufReader::new(file))?;
        self.load_state(&state)
    }

    fn reboot(&mut self) -> Result<(), BackendError> {
        let (memory, registers) = self.boot_image.clone();
        self.load_state(&MachineState {
            memory,
            registers,
            now_ms: 0,
        })?;
        self.reboots += 1;
        Ok(())
    }

    fn terminate(&mut self, exit_code: i32) {
        info!("scripted backend: terminate({})", exit_code);
        self.exit_code = Some(exit_code);
        self.clock.clear_timers();
    }

    fn register_timer(&mut self, timeout_ms: u32, repeat: bool) -> Result<TimerId, BackendError> {
        self.clock.arm(timeout_ms, repeat)
    }

    fn unregister_timer(&mut self, id: TimerId) -> bool {
        self.clock.disarm(id)
    }
}
