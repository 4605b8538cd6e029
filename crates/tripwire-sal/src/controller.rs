//! Dispatch facade between a simulator backend and experiment flows.
//!
//! [`SimulatorController`] is the driver's handle.  The backend (or a
//! trace driver) calls one `on_*` method per hardware occurrence; the
//! controller matches the occurrence against the pending waits, readies
//! every match and then delivers them one at a time by resuming the owning
//! flows.
//!
//! Flows are written as straight-line code against a [`FlowContext`]:
//!
//! ```no_run
//! use tripwire_sal::prelude::*;
//!
//! fn run(backend: Box<dyn SimulatorBackend>) -> Result<(), ControllerError> {
//!     let ctl = SimulatorController::new(backend, ControllerConfig::default());
//!     ctl.add_flow(|ctx: &mut FlowContext| {
//!         let hit = ctx.suspend_until_any(Wait::breakpoint(0x1000)).unwrap();
//!         assert_eq!(hit.trigger_instruction_pointer(), Some(0x1000));
//!         ctx.terminate(0);
//!     })?;
//!     ctl.on_breakpoint(0x1000, ANY_ADDR);
//!     assert!(ctl.is_terminated());
//!     Ok(())
//! }
//! ```
//!
//! # Dispatch cycle
//!
//! 1. Scan: pending waits of the occurrence's class are tested in
//!    registration order (through the cache when `fast_path` is on).
//!    Matches get their trigger details recorded and are counted down.
//! 2. Deliver: readied waits are handed to their owners in readying order.
//!    A wait removed by an earlier delivery of the same cycle is skipped.
//!
//! No lock is held while control is with a flow, so delivered flows may
//! freely add and remove waits or flows.

use crate::backend::{BackendError, MemoryManager, RegisterManager, SimulatorBackend};
use crate::config::ControllerConfig;
use crate::event::{AccessType, Address, Occurrence, TimerId, ANY_ADDR, ANY_INTERRUPT};
use crate::listener::{Wait, WaitId, WaitKind};
use crate::registry::WaitRegistry;
use crate::scheduler::{Context, FlowId, FlowScheduler, TaskState};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Recoverable controller failures.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("failed to arm a {timeout_ms} ms timer: {source}")]
    TimerArm {
        timeout_ms: u32,
        #[source]
        source: BackendError,
    },

    #[error("failed to spawn flow thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{0} has no pending waits")]
    NoPendingWaits(FlowId),

    #[error("simulation already terminated")]
    Terminated,
}

// ═══════════════════════════════════════════════════════════════════════
//  Flow
// ═══════════════════════════════════════════════════════════════════════

/// A unit of experiment logic, run on its own schedulable task.
///
/// When `run` returns, every wait the flow still owns is removed.
pub trait Flow: Send + 'static {
    fn run(&mut self, ctx: &mut FlowContext);
}

impl<F> Flow for F
where
    F: FnMut(&mut FlowContext) + Send + 'static,
{
    fn run(&mut self, ctx: &mut FlowContext) {
        self(ctx)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared state
// ═══════════════════════════════════════════════════════════════════════

/// State reachable from the driver and from every flow.  Only the running
/// context ever locks anything, and never across a control transfer.
struct Shared {
    config: ControllerConfig,
    sched: Arc<FlowScheduler>,
    registry: Mutex<WaitRegistry>,
    backend: Mutex<Box<dyn SimulatorBackend>>,
    /// Delivered waits not yet consumed by `wait_any`.
    inboxes: Mutex<HashMap<FlowId, VecDeque<Wait>>>,
    suppressed: Mutex<Vec<u32>>,
    /// Number of occurrences dispatched so far.
    clock: AtomicU64,
    exit_code: Mutex<Option<i32>>,
}

/// Ends a dispatch cycle even if a delivery unwinds.
struct CycleGuard<'a>(&'a Mutex<WaitRegistry>);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().finish_cycle();
    }
}

impl Shared {
    fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn current_flow(&self, what: &str) -> FlowId {
        match self.sched.current() {
            Context::Flow(id) => id,
            Context::Driver => panic!("FATAL ERROR: {} requires a running flow", what),
        }
    }

    // ── Waits ──────────────────────────────────────────────────

    fn add_wait(&self, mut wait: Wait, owner: FlowId) -> Result<WaitId, ControllerError> {
        if let WaitKind::Timer(t) = wait.kind() {
            let (timeout_ms, repeat) = (t.timeout_ms, t.repeat);
            match self.backend.lock().register_timer(timeout_ms, repeat) {
                Ok(timer) => wait.set_timer_id(Some(timer)),
                Err(source) => {
                    warn!("{}: could not arm {} ms timer: {}", owner, timeout_ms, source);
                    return Err(ControllerError::TimerArm { timeout_ms, source });
                }
            }
        }
        let now = self.now();
        Ok(self.registry.lock().add(wait, owner, now))
    }

    /// Disarm the backend timers of waits that left the registry.
    fn disarm(&self, waits: &[Wait]) {
        let timers: Vec<TimerId> = waits.iter().filter_map(Wait::timer_id).collect();
        if timers.is_empty() {
            return;
        }
        let mut backend = self.backend.lock();
        for timer in timers {
            if !backend.unregister_timer(timer) {
                debug!("timer {} was already gone", timer);
            }
        }
    }

    fn remove_wait(&self, id: WaitId) -> bool {
        let removed = self.registry.lock().remove(id);
        match removed {
            Some(wait) => {
                self.disarm(std::slice::from_ref(&wait));
                true
            }
            None => false,
        }
    }

    fn clear_waits(&self, flow: Option<FlowId>) {
        let removed = self.registry.lock().remove_flow(flow);
        self.disarm(&removed);
        let mut inboxes = self.inboxes.lock();
        match flow {
            Some(flow) => {
                inboxes.remove(&flow);
            }
            None => inboxes.clear(),
        }
    }

    fn take_delivered(&self, flow: FlowId) -> Option<Wait> {
        self.inboxes.lock().get_mut(&flow)?.pop_front()
    }

    fn wait_any(&self, me: FlowId) -> Option<Wait> {
        loop {
            if let Some(wait) = self.take_delivered(me) {
                return Some(wait);
            }
            if self.registry.lock().count_for(me) == 0 {
                return None;
            }
            self.sched.yield_back();
        }
    }

    // ── Dispatch ───────────────────────────────────────────────

    fn dispatch(&self, occ: &Occurrence) -> usize {
        if self.sched.is_terminated() {
            debug!("terminated, ignoring {}", occ);
            return 0;
        }
        let mode = self.config.memory_match;
        let readied = {
            let mut reg = self.registry.lock();
            let mut readied = 0;
            if self.config.fast_path {
                for seq in reg.candidates(occ) {
                    if reg.matches_at(seq, occ, mode) {
                        reg.record_at(seq, occ);
                        readied += reg.mark_ready_at(seq).0 as usize;
                    }
                }
            } else {
                let mut cursor = reg.first_slot();
                while let Some(seq) = cursor {
                    cursor = if reg.matches_at(seq, occ, mode) {
                        reg.record_at(seq, occ);
                        let (ready, next) = reg.mark_ready_at(seq);
                        readied += ready as usize;
                        next
                    } else {
                        reg.next_slot(seq)
                    };
                }
            }
            readied
        };
        self.clock.fetch_add(1, Ordering::Relaxed);
        if readied > 0 {
            debug!("{} readied {} waits", occ, readied);
            self.deliver_ready();
        }
        readied
    }

    /// Deliver every readied wait, resuming owners one at a time.
    ///
    /// A panic raised by a delivered flow does not cut the cycle short: the
    /// remaining matches are still delivered and the first panic is
    /// re-raised once the cycle has ended.
    fn deliver_ready(&self) {
        let cycle = CycleGuard(&self.registry);
        let mut failure: Option<Box<dyn Any + Send>> = None;
        loop {
            if self.sched.is_terminated() {
                break;
            }
            let next = self.registry.lock().next_deliverable();
            let Some((owner, wait)) = next else {
                break;
            };
            if matches!(wait.kind(), WaitKind::Timer(t) if !t.repeat) {
                self.disarm(std::slice::from_ref(&wait));
            }
            debug!("delivering {:?} to {}", wait.id(), owner);
            self.inboxes
                .lock()
                .entry(owner)
                .or_default()
                .push_back(wait);
            match self.sched.state(owner) {
                Some(TaskState::Terminated) | None => {
                    panic!("FATAL ERROR: owner {} of a ready wait does not exist", owner)
                }
                _ if self.sched.can_deliver(owner) => {
                    let resumed =
                        panic::catch_unwind(AssertUnwindSafe(|| self.sched.resume(owner)));
                    if let Err(payload) = resumed {
                        if failure.is_none() {
                            failure = Some(payload);
                        }
                    }
                }
                _ => debug!("{} is busy, wait parked in its inbox", owner),
            }
        }
        drop(cycle);
        if let Some(payload) = failure {
            panic::resume_unwind(payload);
        }
    }

    // ── Flows ──────────────────────────────────────────────────

    fn add_flow(self: &Arc<Self>, mut flow: Box<dyn Flow>) -> Result<FlowId, ControllerError> {
        if self.sched.is_terminated() {
            return Err(ControllerError::Terminated);
        }
        let body_shared = Arc::clone(self);
        let cleanup_shared = Arc::clone(self);
        let id = self
            .sched
            .create(
                move |id| {
                    let mut ctx = FlowContext {
                        shared: body_shared,
                        id,
                    };
                    flow.run(&mut ctx);
                },
                move |id| cleanup_shared.clear_waits(Some(id)),
            )
            .map_err(ControllerError::Spawn)?;
        info!("added {}", id);
        self.sched.resume(id);
        Ok(id)
    }

    fn remove_flow(&self, id: FlowId) -> bool {
        self.clear_waits(Some(id));
        if self.sched.current() == Context::Flow(id) {
            info!("{} removes itself", id);
        }
        let removed = self.sched.remove(id);
        if removed {
            info!("removed {}", id);
        }
        removed
    }

    // ── Simulator state ────────────────────────────────────────

    fn save(&self, path: &Path) -> Result<(), ControllerError> {
        self.backend.lock().save(path)?;
        info!("saved simulator state to {}", path.display());
        Ok(())
    }

    fn restore(&self, path: &Path) -> Result<(), ControllerError> {
        self.backend.lock().restore(path)?;
        self.clear_waits(None);
        info!("restored simulator state from {}", path.display());
        Ok(())
    }

    /// Reboot the backend.  Registered waits survive; pending timer waits
    /// are re-armed with their full timeout, and a timer wait that cannot
    /// be re-armed is removed.
    fn reboot(&self) -> Result<(), ControllerError> {
        self.backend.lock().reboot()?;
        let timers = self.registry.lock().pending_timers();
        let mut lost = Vec::new();
        for (id, timeout_ms, repeat, old) in timers {
            let armed = {
                let mut backend = self.backend.lock();
                if let Some(old) = old {
                    backend.unregister_timer(old);
                }
                backend.register_timer(timeout_ms, repeat)
            };
            match armed {
                Ok(timer) => {
                    self.registry.lock().set_timer(id, Some(timer));
                }
                Err(e) => {
                    warn!("{}: could not re-arm {} ms timer after reboot: {}", id, timeout_ms, e);
                    lost.push(id);
                }
            }
        }
        for id in lost {
            self.registry.lock().remove(id);
        }
        info!("rebooted simulator");
        Ok(())
    }

    fn terminate(&self, exit_code: i32) {
        self.sched.set_terminated();
        *self.exit_code.lock() = Some(exit_code);
        info!("terminating simulation with exit code {}", exit_code);
        self.backend.lock().terminate(exit_code);
    }

    // ── Suppressed interrupts ──────────────────────────────────

    fn add_suppressed_interrupt(&self, number: u32) -> bool {
        let mut list = self.suppressed.lock();
        if list.contains(&number) {
            return false;
        }
        list.push(number);
        true
    }

    fn remove_suppressed_interrupt(&self, number: u32) -> bool {
        let mut list = self.suppressed.lock();
        match list.iter().position(|&n| n == number) {
            Some(idx) => {
                list.remove(idx);
                true
            }
            None => false,
        }
    }

    fn is_suppressed_interrupt(&self, number: u32) -> bool {
        self.suppressed
            .lock()
            .iter()
            .any(|&n| n == number || n == ANY_INTERRUPT)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Driver handle
// ═══════════════════════════════════════════════════════════════════════

/// Driver-side handle.  Owns the flows: dropping the controller cancels
/// and joins every flow thread.
pub struct SimulatorController {
    shared: Arc<Shared>,
}

impl SimulatorController {
    pub fn new(backend: Box<dyn SimulatorBackend>, config: ControllerConfig) -> Self {
        let sched = Arc::new(FlowScheduler::new(
            config.flow_stack_size,
            config.thread_name_prefix.clone(),
        ));
        info!(
            "controller: fast_path={} memory_match={:?}",
            config.fast_path, config.memory_match
        );
        Self {
            shared: Arc::new(Shared {
                config,
                sched,
                registry: Mutex::new(WaitRegistry::new()),
                backend: Mutex::new(backend),
                inboxes: Mutex::new(HashMap::new()),
                suppressed: Mutex::new(Vec::new()),
                clock: AtomicU64::new(0),
                exit_code: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    // ── Occurrences ────────────────────────────────────────────

    /// Match `occ` against the pending waits and deliver the matches.
    /// Returns the number of waits readied.
    pub fn dispatch(&self, occ: Occurrence) -> usize {
        self.shared.dispatch(&occ)
    }

    pub fn on_breakpoint(&self, ip: Address, address_space: Address) {
        self.dispatch(Occurrence::Breakpoint { ip, address_space });
    }

    pub fn on_memory_access(&self, addr: Address, width: usize, is_write: bool, ip: Address) {
        self.dispatch(Occurrence::MemoryAccess {
            addr,
            width,
            access: AccessType::from_write(is_write),
            ip,
        });
    }

    pub fn on_interrupt(&self, number: u32, nmi: bool) {
        self.dispatch(Occurrence::Interrupt { number, nmi });
    }

    pub fn on_trap(&self, number: u32) {
        self.dispatch(Occurrence::Trap { number });
    }

    pub fn on_guest_io(&self, data: u8, port: u32) {
        self.dispatch(Occurrence::GuestIo { data, port });
    }

    pub fn on_io_port(&self, data: u8, port: u32, out: bool) {
        self.dispatch(Occurrence::IoPort { data, port, out });
    }

    pub fn on_jump(&self, flag_triggered: bool, opcode: u32) {
        self.dispatch(Occurrence::Jump {
            flag_triggered,
            opcode,
        });
    }

    /// Breakpoint matching for backends that only report instruction
    /// pointer changes.  The address space comes from the register
    /// manager, or is [`ANY_ADDR`] if the architecture has none.
    pub fn on_instruction_pointer_changed(&self, ip: Address) {
        let address_space = self
            .shared
            .backend
            .lock()
            .registers()
            .address_space()
            .unwrap_or(ANY_ADDR);
        self.on_breakpoint(ip, address_space);
    }

    pub fn on_timer_fire(&self, timer: TimerId) {
        self.dispatch(Occurrence::Timer { timer });
    }

    // ── Flows and waits ────────────────────────────────────────

    /// Create a flow and run it until it first suspends.
    pub fn add_flow(&self, flow: impl Flow) -> Result<FlowId, ControllerError> {
        self.shared.add_flow(Box::new(flow))
    }

    /// Remove flow `id` and all of its waits.
    pub fn remove_flow(&self, id: FlowId) -> bool {
        self.shared.remove_flow(id)
    }

    pub fn remove_wait(&self, id: WaitId) -> bool {
        self.shared.remove_wait(id)
    }

    /// Remove the waits of `flow`, or of every flow for `None`.
    pub fn clear_waits(&self, flow: Option<FlowId>) {
        self.shared.clear_waits(flow)
    }

    /// Number of pending waits.
    pub fn wait_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    pub fn has_waits(&self, flow: FlowId) -> bool {
        self.shared.registry.lock().count_for(flow) > 0
    }

    /// Whether `id` is pending.
    pub fn is_pending(&self, id: WaitId) -> bool {
        self.shared.registry.lock().contains(id)
    }

    /// Number of live flows.
    pub fn flow_count(&self) -> usize {
        self.shared.sched.task_count()
    }

    /// Number of distinct flows with pending waits.
    pub fn waiting_flow_count(&self) -> usize {
        self.shared.registry.lock().flow_count()
    }

    pub fn flow_state(&self, id: FlowId) -> Option<TaskState> {
        self.shared.sched.state(id)
    }

    /// Id of the wait most recently readied.
    pub fn last_fired(&self) -> Option<WaitId> {
        self.shared.registry.lock().last_fired()
    }

    /// Occurrences dispatched so far.
    pub fn now(&self) -> u64 {
        self.shared.now()
    }

    // ── Simulator state ────────────────────────────────────────

    pub fn save(&self, path: &Path) -> Result<(), ControllerError> {
        self.shared.save(path)
    }

    /// Restore a saved state.  All registered waits are discarded.
    pub fn restore(&self, path: &Path) -> Result<(), ControllerError> {
        self.shared.restore(path)
    }

    /// Reboot the simulator.  Waits are kept; timer waits start counting
    /// their timeout again from the reboot.
    pub fn reboot(&self) -> Result<(), ControllerError> {
        self.shared.reboot()
    }

    /// Stop the simulation.  Later occurrences are ignored.
    pub fn terminate(&self, exit_code: i32) {
        self.shared.terminate(exit_code)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.sched.is_terminated()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.shared.exit_code.lock()
    }

    pub fn add_suppressed_interrupt(&self, number: u32) -> bool {
        self.shared.add_suppressed_interrupt(number)
    }

    pub fn remove_suppressed_interrupt(&self, number: u32) -> bool {
        self.shared.remove_suppressed_interrupt(number)
    }

    /// Whether the backend should hold back interrupt `number` from the
    /// guest.
    pub fn is_suppressed_interrupt(&self, number: u32) -> bool {
        self.shared.is_suppressed_interrupt(number)
    }

    pub fn with_memory<R>(&self, f: impl FnOnce(&mut dyn MemoryManager) -> R) -> R {
        f(self.shared.backend.lock().memory_mut())
    }

    pub fn with_registers<R>(&self, f: impl FnOnce(&mut dyn RegisterManager) -> R) -> R {
        f(self.shared.backend.lock().registers_mut())
    }
}

impl Drop for SimulatorController {
    fn drop(&mut self) {
        self.shared.sched.shutdown();
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Flow handle
// ═══════════════════════════════════════════════════════════════════════

/// Handle passed to [`Flow::run`].  Every wait added through it is owned by
/// this flow.
pub struct FlowContext {
    shared: Arc<Shared>,
    id: FlowId,
}

impl FlowContext {
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Register `wait` for this flow.  Timer waits are armed with the
    /// backend; failing to arm one is reported and nothing is registered.
    pub fn add_wait(&mut self, wait: Wait) -> Result<WaitId, ControllerError> {
        self.shared.add_wait(wait, self.id)
    }

    pub fn remove_wait(&mut self, id: WaitId) -> bool {
        self.shared.remove_wait(id)
    }

    /// Remove the waits of `flow`, or of every flow for `None`.
    pub fn clear_waits(&mut self, flow: Option<FlowId>) {
        self.shared.clear_waits(flow)
    }

    /// Suspend until one of this flow's waits fires and return it.
    /// Returns `None` at once if the flow has nothing registered.
    pub fn wait_any(&mut self) -> Option<Wait> {
        self.shared.wait_any(self.id)
    }

    /// Register `wait` and suspend until any wait of this flow fires.
    pub fn suspend_until_any(&mut self, wait: Wait) -> Result<Wait, ControllerError> {
        self.add_wait(wait)?;
        self.wait_any()
            .ok_or(ControllerError::NoPendingWaits(self.id))
    }

    /// Whether this flow has pending waits.
    pub fn has_waits(&self) -> bool {
        self.shared.registry.lock().count_for(self.id) > 0
    }

    pub fn is_pending(&self, id: WaitId) -> bool {
        self.shared.registry.lock().contains(id)
    }

    /// Start another flow and run it until it first suspends.  Control
    /// comes back here afterwards.
    pub fn add_flow(&mut self, flow: impl Flow) -> Result<FlowId, ControllerError> {
        self.shared.add_flow(Box::new(flow))
    }

    /// Remove flow `id` and its waits.  Removing this flow does not return.
    pub fn remove_flow(&mut self, id: FlowId) -> bool {
        self.shared.remove_flow(id)
    }

    /// Remove this flow's waits and leave it.
    pub fn exit(&mut self) -> ! {
        self.shared.clear_waits(Some(self.id));
        self.shared.sched.exit_current()
    }

    pub fn save(&mut self, path: &Path) -> Result<(), ControllerError> {
        self.shared.save(path)
    }

    /// Restore a saved state.  All registered waits, including this
    /// flow's, are discarded.
    pub fn restore(&mut self, path: &Path) -> Result<(), ControllerError> {
        self.shared.restore(path)
    }

    /// Reboot the simulator, keeping this flow's waits.
    pub fn reboot(&mut self) -> Result<(), ControllerError> {
        self.shared.reboot()
    }

    /// Stop the simulation and leave this flow.
    pub fn terminate(&mut self, exit_code: i32) -> ! {
        debug_assert_eq!(self.shared.current_flow("terminate"), self.id);
        self.shared.terminate(exit_code);
        self.shared.sched.exit_current()
    }

    pub fn add_suppressed_interrupt(&mut self, number: u32) -> bool {
        self.shared.add_suppressed_interrupt(number)
    }

    pub fn remove_suppressed_interrupt(&mut self, number: u32) -> bool {
        self.shared.remove_suppressed_interrupt(number)
    }

    pub fn is_suppressed_interrupt(&self, number: u32) -> bool {
        self.shared.is_suppressed_interrupt(number)
    }

    pub fn with_memory<R>(&mut self, f: impl FnOnce(&mut dyn MemoryManager) -> R) -> R {
        f(self.shared.backend.lock().memory_mut())
    }

    pub fn with_registers<R>(&mut self, f: impl FnOnce(&mut dyn RegisterManager) -> R) -> R {
        f(self.shared.backend.lock().registers_mut())
    }

    /// Occurrences dispatched so far.
    pub fn now(&self) -> u64 {
        self.shared.now()
    }

    pub fn flow_count(&self) -> usize {
        self.shared.sched.task_count()
    }

    pub fn wait_count(&self) -> usize {
        self.shared.registry.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ANY_INSTR, ANY_TRAP};
    use std::path::PathBuf;

    // ── Stub backend ───────────────────────────────────────────

    struct NoMemory;

    impl MemoryManager for NoMemory {
        fn pool_size(&self) -> usize {
            0
        }
        fn start_addr(&self) -> Address {
            0
        }
        fn get_byte(&self, _addr: Address) -> u8 {
            0
        }
        fn set_byte(&mut self, _addr: Address, _data: u8) {}
        fn is_mapped(&self, _addr: Address) -> bool {
            false
        }
    }

    struct NoRegisters;

    impl RegisterManager for NoRegisters {
        fn registers(&self) -> &[crate::backend::RegisterInfo] {
            &[]
        }
        fn get_data(&self, _id: u32) -> Option<u64> {
            None
        }
        fn set_data(&mut self, _id: u32, _value: u64) -> bool {
            false
        }
    }

    /// Records what the controller asked of it.
    #[derive(Default)]
    struct Calls {
        armed: Vec<(u32, bool)>,
        disarmed: Vec<TimerId>,
        restored: Vec<PathBuf>,
        terminated: Option<i32>,
        dropped: bool,
    }

    struct StubBackend {
        calls: Arc<Mutex<Calls>>,
        mem: NoMemory,
        regs: NoRegisters,
        next_timer: TimerId,
        fail_timers: bool,
    }

    impl SimulatorBackend for StubBackend {
        fn memory(&self) -> &dyn MemoryManager {
            &self.mem
        }
        fn memory_mut(&mut self) -> &mut dyn MemoryManager {
            &mut self.mem
        }
        fn registers(&self) -> &dyn RegisterManager {
            &self.regs
        }
        fn registers_mut(&mut self) -> &mut dyn RegisterManager {
            &mut self.regs
        }
        fn save(&mut self, _path: &Path) -> Result<(), BackendError> {
            Err(BackendError::Unsupported("save"))
        }
        fn restore(&mut self, path: &Path) -> Result<(), BackendError> {
            self.calls.lock().restored.push(path.to_path_buf());
            Ok(())
        }
        fn reboot(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
        fn terminate(&mut self, exit_code: i32) {
            self.calls.lock().terminated = Some(exit_code);
        }
        fn register_timer(&mut self, timeout_ms: u32, repeat: bool) -> Result<TimerId, BackendError> {
            if self.fail_timers {
                return Err(BackendError::TimerUnavailable("stub".into()));
            }
            self.calls.lock().armed.push((timeout_ms, repeat));
            self.next_timer += 1;
            Ok(self.next_timer)
        }
        fn unregister_timer(&mut self, id: TimerId) -> bool {
            self.calls.lock().disarmed.push(id);
            true
        }
    }

    impl Drop for StubBackend {
        fn drop(&mut self) {
            self.calls.lock().dropped = true;
        }
    }

    fn controller_with(config: ControllerConfig) -> (SimulatorController, Arc<Mutex<Calls>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let calls = Arc::new(Mutex::new(Calls::default()));
        let backend = StubBackend {
            calls: Arc::clone(&calls),
            mem: NoMemory,
            regs: NoRegisters,
            next_timer: 0,
            fail_timers: false,
        };
        (SimulatorController::new(Box::new(backend), config), calls)
    }

    fn controller() -> (SimulatorController, Arc<Mutex<Calls>>) {
        controller_with(ControllerConfig {
            flow_stack_size: 256 * 1024,
            ..Default::default()
        })
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    // ── Scenarios ──────────────────────────────────────────────

    #[test]
    fn breakpoint_resumes_owner_once() {
        let (ctl, _) = controller();
        let hits = log();
        let h = Arc::clone(&hits);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            let w = ctx.suspend_until_any(Wait::breakpoint(0x100)).unwrap();
            h.lock()
                .push(format!("{:#x}", w.trigger_instruction_pointer().unwrap()));
            ctx.wait_any();
        })
        .unwrap();
        assert_eq!(ctl.wait_count(), 1);

        ctl.on_breakpoint(0x104, ANY_ADDR);
        assert!(hits.lock().is_empty());
        ctl.on_breakpoint(0x100, ANY_ADDR);
        assert_eq!(*hits.lock(), vec!["0x100"]);
        ctl.on_breakpoint(0x100, ANY_ADDR);
        assert_eq!(hits.lock().len(), 1);
        assert_eq!(ctl.wait_count(), 0);
    }

    #[test]
    fn repeating_timer_fires_three_times() {
        let (ctl, calls) = controller();
        let fired = log();
        let f = Arc::clone(&fired);
        let flow = ctl
            .add_flow(move |ctx: &mut FlowContext| {
                let id = ctx.add_wait(Wait::timer(10, true)).unwrap();
                while let Some(w) = ctx.wait_any() {
                    assert_eq!(w.id(), Some(id));
                    f.lock().push("tick".into());
                }
            })
            .unwrap();
        assert_eq!(calls.lock().armed, vec![(10, true)]);

        for _ in 0..3 {
            ctl.on_timer_fire(1);
            assert!(ctl.has_waits(flow));
        }
        assert_eq!(fired.lock().len(), 3);
        assert!(calls.lock().disarmed.is_empty());

        ctl.remove_flow(flow);
        assert_eq!(calls.lock().disarmed, vec![1]);
    }

    #[test]
    fn write_watch_ignores_reads() {
        let (ctl, _) = controller();
        let seen = log();
        let s = Arc::clone(&seen);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            let w = ctx
                .suspend_until_any(Wait::memory_access(ANY_ADDR, AccessType::Write))
                .unwrap();
            s.lock().push(w.trigger_access_type().unwrap().to_string());
        })
        .unwrap();

        ctl.on_memory_access(0x2000, 4, false, 0x400);
        assert!(seen.lock().is_empty());
        ctl.on_memory_access(0x3000, 1, true, 0x404);
        assert_eq!(*seen.lock(), vec!["write"]);
    }

    #[test]
    fn counter_needs_n_occurrences() {
        let (ctl, _) = controller();
        let hits = log();
        let h = Arc::clone(&hits);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            let mut w = Wait::trap(ANY_TRAP).with_counter(3);
            loop {
                w = ctx.suspend_until_any(w).unwrap();
                h.lock().push(format!("trap {}", w.trigger_number().unwrap()));
            }
        })
        .unwrap();
        for n in 0..7 {
            ctl.on_trap(n);
        }
        assert_eq!(*hits.lock(), vec!["trap 2", "trap 5"]);
    }

    #[test]
    fn matches_delivered_in_registration_order() {
        for fast_path in [true, false] {
            let (ctl, _) = controller_with(ControllerConfig {
                fast_path,
                flow_stack_size: 256 * 1024,
                ..Default::default()
            });
            let order = log();
            for name in ["w1", "w2", "w3"] {
                let o = Arc::clone(&order);
                ctl.add_flow(move |ctx: &mut FlowContext| {
                    ctx.suspend_until_any(Wait::interrupt(5)).unwrap();
                    o.lock().push(name.to_string());
                })
                .unwrap();
            }
            ctl.on_interrupt(5, false);
            assert_eq!(*order.lock(), vec!["w1", "w2", "w3"], "fast_path={}", fast_path);
        }
    }

    #[test]
    fn tombstoned_sibling_is_not_delivered() {
        let (ctl, _) = controller();
        let order = log();
        let victim_wait: Arc<Mutex<Option<WaitId>>> = Arc::new(Mutex::new(None));

        let (o, vw) = (Arc::clone(&order), Arc::clone(&victim_wait));
        ctl.add_flow(move |ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::jump(0x74)).unwrap();
            o.lock().push("killer".into());
            let victim = vw.lock().unwrap();
            assert!(ctx.remove_wait(victim));
        })
        .unwrap();

        let (o, vw) = (Arc::clone(&order), Arc::clone(&victim_wait));
        let victim = ctl
            .add_flow(move |ctx: &mut FlowContext| {
                *vw.lock() = Some(ctx.add_wait(Wait::jump(ANY_INSTR)).unwrap());
                ctx.wait_any();
                o.lock().push("victim".into());
            })
            .unwrap();

        assert_eq!(ctl.dispatch(Occurrence::Jump { flag_triggered: true, opcode: 0x74 }), 2);
        assert_eq!(*order.lock(), vec!["killer"]);
        assert_eq!(ctl.flow_state(victim), Some(TaskState::Suspended));
        assert_eq!(ctl.wait_count(), 0);
    }

    #[test]
    fn removed_flow_is_purged_even_when_ready() {
        let (ctl, _) = controller();
        let order = log();
        let victim_id: Arc<Mutex<Option<FlowId>>> = Arc::new(Mutex::new(None));

        let (o, vid) = (Arc::clone(&order), Arc::clone(&victim_id));
        ctl.add_flow(move |ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::guest_io()).unwrap();
            o.lock().push("remover".into());
            let victim = vid.lock().unwrap();
            assert!(ctx.remove_flow(victim));
        })
        .unwrap();

        let o = Arc::clone(&order);
        let victim = ctl
            .add_flow(move |ctx: &mut FlowContext| {
                ctx.add_wait(Wait::guest_io()).unwrap();
                ctx.add_wait(Wait::trap(3)).unwrap();
                ctx.wait_any();
                o.lock().push("victim".into());
            })
            .unwrap();
        *victim_id.lock() = Some(victim);

        ctl.on_guest_io(b'x', 0x3f8);
        assert_eq!(*order.lock(), vec!["remover"]);
        assert_eq!(ctl.flow_state(victim), Some(TaskState::Terminated));
        assert!(!ctl.has_waits(victim));
        assert_eq!(ctl.flow_count(), 0);
    }

    #[test]
    fn flow_return_clears_its_waits() {
        let (ctl, _) = controller();
        let flow = ctl
            .add_flow(|ctx: &mut FlowContext| {
                ctx.add_wait(Wait::trap(1)).unwrap();
                ctx.add_wait(Wait::trap(2)).unwrap();
                ctx.wait_any();
            })
            .unwrap();
        assert_eq!(ctl.wait_count(), 2);
        ctl.on_trap(2);
        assert_eq!(ctl.wait_count(), 0);
        assert_eq!(ctl.flow_state(flow), Some(TaskState::Terminated));
    }

    #[test]
    fn self_removal_leaves_run() {
        let (ctl, _) = controller();
        let steps = log();
        let s = Arc::clone(&steps);
        let flow = ctl
            .add_flow(move |ctx: &mut FlowContext| {
                ctx.add_wait(Wait::breakpoint(0x10)).unwrap();
                s.lock().push("before".into());
                let me = ctx.id();
                ctx.remove_flow(me);
                s.lock().push("after".into());
            })
            .unwrap();
        assert_eq!(*steps.lock(), vec!["before"]);
        assert_eq!(ctl.flow_state(flow), Some(TaskState::Terminated));
        assert_eq!(ctl.wait_count(), 0);
        assert!(!ctl.remove_flow(flow));
    }

    #[test]
    fn wait_any_without_waits_returns_none() {
        let (ctl, _) = controller();
        let out = log();
        let o = Arc::clone(&out);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            o.lock().push(format!("{:?}", ctx.wait_any().map(|w| w.id())));
        })
        .unwrap();
        assert_eq!(*out.lock(), vec!["None"]);
    }

    #[test]
    fn flow_can_start_flows() {
        let (ctl, _) = controller();
        let order = log();
        let o = Arc::clone(&order);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            let inner = Arc::clone(&o);
            ctx.add_flow(move |ctx: &mut FlowContext| {
                inner.lock().push("child waits".into());
                ctx.suspend_until_any(Wait::interrupt(1)).unwrap();
                inner.lock().push("child woke".into());
            })
            .unwrap();
            o.lock().push("parent continues".into());
            ctx.suspend_until_any(Wait::interrupt(1)).unwrap();
            o.lock().push("parent woke".into());
        })
        .unwrap();
        assert_eq!(*order.lock(), vec!["child waits", "parent continues"]);
        ctl.on_interrupt(1, false);
        assert_eq!(
            *order.lock(),
            vec!["child waits", "parent continues", "child woke", "parent woke"]
        );
    }

    #[test]
    fn terminate_stops_dispatch() {
        let (ctl, calls) = controller();
        let hits = log();
        let h = Arc::clone(&hits);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::breakpoint(0x200)).unwrap();
            ctx.terminate(3);
        })
        .unwrap();
        ctl.add_flow(move |ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::breakpoint(0x200)).unwrap();
            h.lock().push("second".into());
        })
        .unwrap();

        ctl.on_breakpoint(0x200, ANY_ADDR);
        assert!(ctl.is_terminated());
        assert_eq!(ctl.exit_code(), Some(3));
        assert_eq!(calls.lock().terminated, Some(3));
        assert!(hits.lock().is_empty());
        assert_eq!(ctl.dispatch(Occurrence::Breakpoint { ip: 0x200, address_space: ANY_ADDR }), 0);
        assert!(matches!(ctl.add_flow(|_: &mut FlowContext| {}), Err(ControllerError::Terminated)));
    }

    #[test]
    fn restore_discards_all_waits() {
        let (ctl, calls) = controller();
        let results = log();
        let r = Arc::clone(&results);
        ctl.add_flow(|ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::trap(9)).unwrap();
        })
        .unwrap();
        ctl.add_flow(move |ctx: &mut FlowContext| {
            ctx.add_wait(Wait::timer(5, false)).unwrap();
            ctx.suspend_until_any(Wait::guest_io()).unwrap();
            ctx.restore(Path::new("state")).unwrap();
            r.lock().push(format!("waits after restore: {}", ctx.wait_count()));
            r.lock().push(format!("{}", ctx.save(Path::new("state")).is_err()));
        })
        .unwrap();
        assert_eq!(ctl.wait_count(), 3);

        ctl.on_guest_io(0, 0);
        assert_eq!(*results.lock(), vec!["waits after restore: 0", "true"]);
        assert_eq!(calls.lock().restored, vec![PathBuf::from("state")]);
        assert_eq!(calls.lock().disarmed, vec![1]);
    }

    #[test]
    fn timer_arm_failure_is_recoverable() {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = StubBackend {
            calls: Arc::new(Mutex::new(Calls::default())),
            mem: NoMemory,
            regs: NoRegisters,
            next_timer: 0,
            fail_timers: true,
        };
        let ctl = SimulatorController::new(
            Box::new(backend),
            ControllerConfig {
                flow_stack_size: 256 * 1024,
                ..Default::default()
            },
        );
        let out = log();
        let o = Arc::clone(&out);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            match ctx.add_wait(Wait::timer(10, false)) {
                Err(ControllerError::TimerArm { timeout_ms, .. }) => {
                    o.lock().push(format!("no timer ({} ms)", timeout_ms))
                }
                other => o.lock().push(format!("unexpected {:?}", other)),
            }
            ctx.suspend_until_any(Wait::trap(1)).unwrap();
            o.lock().push("carried on".into());
        })
        .unwrap();
        assert_eq!(ctl.wait_count(), 1);
        ctl.on_trap(1);
        assert_eq!(*out.lock(), vec!["no timer (10 ms)", "carried on"]);
    }

    #[test]
    fn one_shot_timer_disarmed_after_delivery() {
        let (ctl, calls) = controller();
        ctl.add_flow(|ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::timer(20, false)).unwrap();
            ctx.suspend_until_any(Wait::trap(0)).unwrap();
        })
        .unwrap();
        ctl.on_timer_fire(1);
        assert_eq!(calls.lock().disarmed, vec![1]);
        // unknown timer handles are ignored
        assert_eq!(ctl.dispatch(Occurrence::Timer { timer: 77 }), 0);
    }

    #[test]
    fn io_port_direction_is_filtered() {
        let (ctl, _) = controller();
        let seen = log();
        let s = Arc::clone(&seen);
        ctl.add_flow(move |ctx: &mut FlowContext| loop {
            let w = ctx.suspend_until_any(Wait::io_port(0x60, false)).unwrap();
            if let WaitKind::IoPort(io) = w.kind() {
                s.lock().push(format!("in {:#x}", io.data.unwrap()));
            }
        })
        .unwrap();
        ctl.on_io_port(0xaa, 0x60, true);
        ctl.on_io_port(0xbb, 0x61, false);
        ctl.on_io_port(0xcc, 0x60, false);
        assert_eq!(*seen.lock(), vec!["in 0xcc"]);
    }

    #[test]
    fn overlap_mode_sees_wide_accesses() {
        for (mode, expected) in [
            (crate::config::MemoryMatch::LowestByte, 0),
            (crate::config::MemoryMatch::Overlap, 1),
        ] {
            let (ctl, _) = controller_with(ControllerConfig {
                memory_match: mode,
                flow_stack_size: 256 * 1024,
                ..Default::default()
            });
            ctl.add_flow(|ctx: &mut FlowContext| {
                ctx.suspend_until_any(Wait::memory_write(0x1002)).unwrap();
            })
            .unwrap();
            let readied = ctl.dispatch(Occurrence::MemoryAccess {
                addr: 0x1000,
                width: 4,
                access: AccessType::Write,
                ip: 0,
            });
            assert_eq!(readied, expected, "{:?}", mode);
        }
    }

    #[test]
    fn instruction_pointer_changes_match_any_space() {
        let (ctl, _) = controller();
        let hits = log();
        let h = Arc::clone(&hits);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            let w = ctx
                .suspend_until_any(Wait::breakpoint_range(0x100, 0x1ff))
                .unwrap();
            h.lock()
                .push(format!("{:#x}", w.trigger_instruction_pointer().unwrap()));
        })
        .unwrap();
        ctl.on_instruction_pointer_changed(0x0ff);
        ctl.on_instruction_pointer_changed(0x180);
        assert_eq!(*hits.lock(), vec!["0x180"]);
        assert_eq!(ctl.now(), 2);
    }

    #[test]
    fn suppressed_interrupts() {
        let (ctl, _) = controller();
        assert!(!ctl.is_suppressed_interrupt(32));
        assert!(ctl.add_suppressed_interrupt(32));
        assert!(!ctl.add_suppressed_interrupt(32));
        assert!(ctl.is_suppressed_interrupt(32));
        assert!(!ctl.is_suppressed_interrupt(33));
        assert!(ctl.add_suppressed_interrupt(ANY_INTERRUPT));
        assert!(ctl.is_suppressed_interrupt(33));
        assert!(ctl.remove_suppressed_interrupt(ANY_INTERRUPT));
        assert!(!ctl.remove_suppressed_interrupt(ANY_INTERRUPT));
    }

    #[test]
    fn driver_side_removal() {
        let (ctl, _) = controller();
        let wait_id: Arc<Mutex<Option<WaitId>>> = Arc::new(Mutex::new(None));
        let w = Arc::clone(&wait_id);
        let flow = ctl
            .add_flow(move |ctx: &mut FlowContext| {
                *w.lock() = Some(ctx.add_wait(Wait::jump(1)).unwrap());
                ctx.suspend_until_any(Wait::jump(2)).unwrap();
            })
            .unwrap();
        let id = wait_id.lock().unwrap();
        assert!(ctl.is_pending(id));
        assert!(ctl.remove_wait(id));
        assert!(!ctl.remove_wait(id));
        assert_eq!(ctl.waiting_flow_count(), 1);
        ctl.clear_waits(None);
        assert!(!ctl.has_waits(flow));
        assert!(ctl.remove_flow(flow));
        assert_eq!(ctl.flow_count(), 0);
    }

    #[test]
    #[should_panic(expected = "flow failed")]
    fn flow_panic_reaches_driver() {
        let (ctl, _) = controller();
        ctl.add_flow(|ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::trap(13)).unwrap();
            panic!("flow failed");
        })
        .unwrap();
        ctl.on_trap(13);
    }

    #[test]
    fn flow_panic_cleans_up_first() {
        let (ctl, _) = controller();
        ctl.add_flow(|ctx: &mut FlowContext| {
            ctx.add_wait(Wait::trap(14)).unwrap();
            ctx.suspend_until_any(Wait::trap(13)).unwrap();
            panic!("flow failed");
        })
        .unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ctl.on_trap(13)));
        assert!(result.is_err());
        assert_eq!(ctl.wait_count(), 0);
        assert_eq!(ctl.flow_count(), 0);
    }

    #[test]
    fn flow_panic_does_not_starve_siblings() {
        let (ctl, _) = controller();
        let seen = log();
        ctl.add_flow(|ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::trap(13)).unwrap();
            panic!("flow failed");
        })
        .unwrap();
        let s = Arc::clone(&seen);
        let sibling = ctl
            .add_flow(move |ctx: &mut FlowContext| loop {
                ctx.suspend_until_any(Wait::trap(13)).unwrap();
                s.lock().push("sibling woke".into());
            })
            .unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ctl.on_trap(13)));
        assert!(result.is_err());
        assert_eq!(*seen.lock(), vec!["sibling woke"]);
        assert!(ctl.has_waits(sibling));

        ctl.on_trap(13);
        assert_eq!(*seen.lock(), vec!["sibling woke", "sibling woke"]);
    }

    #[test]
    fn reboot_rearms_timer_waits() {
        let (ctl, calls) = controller();
        let out = log();
        let o = Arc::clone(&out);
        ctl.add_flow(move |ctx: &mut FlowContext| {
            let w = ctx.suspend_until_any(Wait::timer(10, false)).unwrap();
            o.lock().push(format!("timer {:?}", w.timer_id()));
        })
        .unwrap();

        ctl.reboot().unwrap();
        assert_eq!(calls.lock().armed, vec![(10, false), (10, false)]);
        assert_eq!(calls.lock().disarmed, vec![1]);
        assert_eq!(ctl.wait_count(), 1);

        assert_eq!(ctl.dispatch(Occurrence::Timer { timer: 1 }), 0);
        assert_eq!(ctl.dispatch(Occurrence::Timer { timer: 2 }), 1);
        assert_eq!(*out.lock(), vec!["timer Some(2)"]);
    }

    #[test]
    fn dropping_a_terminated_controller_releases_flows() {
        let (ctl, calls) = controller();
        let waiting = ctl
            .add_flow(|ctx: &mut FlowContext| {
                ctx.suspend_until_any(Wait::trap(2)).unwrap();
            })
            .unwrap();
        ctl.add_flow(|ctx: &mut FlowContext| {
            ctx.suspend_until_any(Wait::trap(1)).unwrap();
            ctx.terminate(0);
        })
        .unwrap();

        ctl.on_trap(1);
        assert!(ctl.is_terminated());
        assert!(!ctl.remove_flow(waiting));
        assert_eq!(ctl.flow_state(waiting), Some(TaskState::Suspended));

        drop(ctl);
        assert!(calls.lock().dropped);
    }

    #[test]
    fn child_can_remove_the_parent_that_started_it() {
        let (ctl, _) = controller();
        let steps = log();
        let s = Arc::clone(&steps);
        let parent = ctl
            .add_flow(move |ctx: &mut FlowContext| {
                let parent = ctx.id();
                let s = Arc::clone(&s);
                ctx.add_flow(move |ctx: &mut FlowContext| {
                    let removed = ctx.remove_flow(parent);
                    s.lock().push(format!("child removed parent: {}", removed));
                    ctx.suspend_until_any(Wait::trap(1)).unwrap();
                    s.lock().push("child woke".into());
                })
                .unwrap();
                unreachable!("parent was removed while starting its child");
            })
            .unwrap();

        assert_eq!(*steps.lock(), vec!["child removed parent: true"]);
        assert_eq!(ctl.flow_state(parent), Some(TaskState::Terminated));
        assert_eq!(ctl.flow_count(), 1);

        ctl.on_trap(1);
        assert_eq!(
            *steps.lock(),
            vec!["child removed parent: true", "child woke"]
        );
        assert_eq!(ctl.flow_count(), 0);
    }
}
