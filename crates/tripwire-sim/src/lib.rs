//! Reference backend for tripwire.
//!
//! A deterministic, in-memory stand-in for a real simulator:
//!
//! - [`memory`]: flat guest memory pool
//! - [`cpu`]: register file with an x86-64 preset
//! - [`clock`]: virtual millisecond clock and timer table
//! - [`backend`]: [`ScriptedBackend`], the `SimulatorBackend` implementation
//! - [`trace`]: recorded occurrence traces (JSON)
//! - [`driver`]: [`TraceDriver`], which replays a trace into a controller
//!
//! ```no_run
//! use tripwire_sal::prelude::*;
//! use tripwire_sim::{FlatMemory, RegisterFile, ScriptedBackend, Trace, TraceDriver};
//!
//! let backend = ScriptedBackend::new(FlatMemory::new(0, 1 << 20), RegisterFile::x86_64());
//! let clock = backend.clock();
//! let ctl = SimulatorController::new(Box::new(backend), ControllerConfig::default());
//! let trace = Trace::load("boot.json".as_ref()).unwrap();
//! let report = TraceDriver::new(&ctl, clock).run(&trace);
//! println!("{:?}", report);
//! ```

pub mod backend;
pub mod clock;
pub mod cpu;
pub mod driver;
pub mod memory;
pub mod trace;

pub use backend::{MachineState, ScriptedBackend};
pub use clock::SimClock;
pub use cpu::{RegisterFile, RegisterSnapshot};
pub use driver::{DriveReport, TraceDriver};
pub use memory::FlatMemory;
pub use trace::{Trace, TraceError, TraceEvent};
