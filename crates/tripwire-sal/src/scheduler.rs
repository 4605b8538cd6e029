//! Cooperative flow scheduler.
//!
//! Every flow runs on its own OS thread, but only one context (the driver
//! or one flow) executes at any instant.  Control moves between contexts by
//! message passing over zero-capacity rendezvous channels: each context owns
//! one channel and blocks on it whenever it is not running.
//!
//! # Architecture
//!
//! ```text
//!   driver ──resume(A)──► flow A ──resume(B)──► flow B
//!      ▲                    ▲                     │
//!      │                    └────yield_back───────┘
//!      └────yield_back──────┘
//! ```
//!
//! [`resume`](FlowScheduler::resume) pushes the caller onto an explicit
//! resume-from stack before handing over control; [`yield_back`](FlowScheduler::yield_back)
//! pops that stack.  A flow therefore always returns to whoever resumed it,
//! be it the driver or another flow.
//!
//! # Lifecycle
//!
//! ```text
//!   Created ──resume──► Running ◄──resume──► Suspended
//!                          │
//!            return / exit / panic / remove
//!                          ▼
//!                      Terminated
//! ```
//!
//! A flow body runs under `catch_unwind`.  Normal return and panics run the
//! cleanup hook before control goes back to the resumer; a panic is then
//! re-raised in the resumer.  Removing the running flow unwinds it with a
//! private marker; removing any other flow sends it `Cancel`, which unwinds
//! it inside its blocking point, and joins its thread.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Identity of a flow, assigned by the scheduler when the flow is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowId(pub(crate) u64);

impl FlowId {
    /// Raw numeric id, starting at 1.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// An execution context: the driver (the thread that owns the controller)
/// or a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Driver,
    Flow(FlowId),
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Driver => f.write_str("driver"),
            Context::Flow(id) => id.fmt(f),
        }
    }
}

/// Scheduling state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but never resumed.
    Created,
    /// Blocked, either waiting to be resumed or waiting for a flow it
    /// resumed to yield back.
    Suspended,
    /// Currently executing; at most one flow is in this state.
    Running,
    /// Returned, exited, panicked or removed.
    Terminated,
}

/// Message handing control to a context.
pub enum Transfer {
    /// First resume of a created flow.
    Start,
    /// Resume a suspended flow (a wait it owns was delivered).
    Wake,
    /// A resumed flow yielded back or finished.
    Returned,
    /// The receiving flow is being removed.
    Cancel,
    /// A resumed flow panicked; the payload is re-raised by the receiver.
    Panicked(Box<dyn Any + Send>),
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transfer::Start => f.write_str("Start"),
            Transfer::Wake => f.write_str("Wake"),
            Transfer::Returned => f.write_str("Returned"),
            Transfer::Cancel => f.write_str("Cancel"),
            Transfer::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

/// Unwind payload used when a flow leaves its own continuation.
struct FlowExit;

/// Unwind payload used when a flow is removed by another context.
struct FlowCancelled;

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

struct Task {
    state: TaskState,
    tx: Sender<Transfer>,
    rx: Receiver<Transfer>,
    handle: Option<JoinHandle<()>>,
}

struct SchedState {
    tasks: HashMap<FlowId, Task>,
    running: Context,
    /// Contexts that resumed someone and wait for control to come back.
    stack: Vec<Context>,
    /// Threads of finished flows, joined by the next context that regains
    /// control.
    zombies: Vec<JoinHandle<()>>,
    /// Process is terminating; tasks are no longer torn down.
    terminated: bool,
    next_id: u64,
}

/// Hands control between the driver and flow threads.
pub struct FlowScheduler {
    state: Mutex<SchedState>,
    driver_tx: Sender<Transfer>,
    driver_rx: Receiver<Transfer>,
    stack_size: usize,
    name_prefix: String,
}

/// Block until someone hands us control.  A disconnected channel means the
/// scheduler is gone and is treated like a cancel.
fn block_on(rx: &Receiver<Transfer>) -> Transfer {
    rx.recv().unwrap_or(Transfer::Cancel)
}

impl FlowScheduler {
    /// Create a scheduler whose flow threads get `stack_size` bytes of
    /// stack and are named `<name_prefix>-<id>`.
    pub fn new(stack_size: usize, name_prefix: impl Into<String>) -> Self {
        let (driver_tx, driver_rx) = bounded(0);
        Self {
            state: Mutex::new(SchedState {
                tasks: HashMap::new(),
                running: Context::Driver,
                stack: Vec::new(),
                zombies: Vec::new(),
                terminated: false,
                next_id: 1,
            }),
            driver_tx,
            driver_rx,
            stack_size,
            name_prefix: name_prefix.into(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Creation
    // ═══════════════════════════════════════════════════════════════════

    /// Spawn a flow thread running `body`.  The flow does not run until it
    /// is resumed once.  `cleanup` runs on the flow thread after `body`
    /// returns or panics, but not when the flow exits or is removed.
    pub fn create<B, C>(self: &Arc<Self>, body: B, cleanup: C) -> io::Result<FlowId>
    where
        B: FnOnce(FlowId) + Send + 'static,
        C: FnOnce(FlowId) + Send + 'static,
    {
        let id = {
            let mut st = self.state.lock();
            let id = FlowId(st.next_id);
            st.next_id += 1;
            id
        };
        let (tx, rx) = bounded(0);
        let sched = Arc::clone(self);
        let thread_rx = rx.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name_prefix, id.0))
            .stack_size(self.stack_size)
            .spawn(move || sched.task_main(id, thread_rx, body, cleanup))?;

        self.state.lock().tasks.insert(
            id,
            Task {
                state: TaskState::Created,
                tx,
                rx,
                handle: Some(handle),
            },
        );
        debug!("scheduler: created {}", id);
        Ok(id)
    }

    fn task_main<B, C>(&self, id: FlowId, rx: Receiver<Transfer>, body: B, cleanup: C)
    where
        B: FnOnce(FlowId),
        C: FnOnce(FlowId),
    {
        match block_on(&rx) {
            Transfer::Start => {}
            other => {
                debug!("scheduler: {} dropped before start ({:?})", id, other);
                return;
            }
        }
        match panic::catch_unwind(AssertUnwindSafe(|| body(id))) {
            Ok(()) => {
                cleanup(id);
                debug!("scheduler: {} returned", id);
                self.finish(id, Transfer::Returned);
            }
            Err(payload) if payload.is::<FlowExit>() => {
                debug!("scheduler: {} exited", id);
                self.finish(id, Transfer::Returned);
            }
            Err(payload) if payload.is::<FlowCancelled>() => {
                debug!("scheduler: {} cancelled", id);
            }
            Err(payload) => {
                error!("{} panicked: {}", id, panic_message(payload.as_ref()));
                cleanup(id);
                self.finish(id, Transfer::Panicked(payload));
            }
        }
    }

    /// Unregister the finishing flow `id` and hand control back to its
    /// resumer with `msg`.  Runs on the flow's own thread, as its last act.
    fn finish(&self, id: FlowId, msg: Transfer) {
        let tx = {
            let mut st = self.state.lock();
            if let Some(mut task) = st.tasks.remove(&id) {
                task.state = TaskState::Terminated;
                if let Some(handle) = task.handle.take() {
                    st.zombies.push(handle);
                }
            }
            let Some(target) = st.stack.pop() else {
                // Nobody to return to; the resumer was torn down.
                warn!("scheduler: {} finished with an empty resume stack", id);
                return;
            };
            st.running = target;
            self.channel_of(&mut st, target, TaskState::Running).0
        };
        // The receiver may already be gone during shutdown.
        let _ = tx.send(msg);
    }

    /// Sender and receiver of `ctx`, updating its task state.
    fn channel_of(
        &self,
        st: &mut SchedState,
        ctx: Context,
        state: TaskState,
    ) -> (Sender<Transfer>, Receiver<Transfer>) {
        match ctx {
            Context::Driver => (self.driver_tx.clone(), self.driver_rx.clone()),
            Context::Flow(id) => match st.tasks.get_mut(&id) {
                Some(task) => {
                    task.state = state;
                    (task.tx.clone(), task.rx.clone())
                }
                None => panic!("FATAL ERROR: {} does not exist", id),
            },
        }
    }

    fn reap(&self) {
        let zombies = std::mem::take(&mut self.state.lock().zombies);
        for handle in zombies {
            let _ = handle.join();
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Control transfer
    // ═══════════════════════════════════════════════════════════════════

    /// Transfer control to flow `id` and block until it (or whoever it
    /// hands control to) yields back.
    ///
    /// # Panics
    ///
    /// If `id` does not exist, is the running context, or is itself
    /// waiting for control to come back.  If the resumed flow panics, its
    /// panic is re-raised here.
    pub fn resume(&self, id: FlowId) {
        let (tx, rx, msg) = {
            let mut st = self.state.lock();
            let me = st.running;
            assert!(
                me != Context::Flow(id),
                "FATAL ERROR: {} cannot resume itself",
                id
            );
            assert!(
                !st.stack.contains(&Context::Flow(id)),
                "FATAL ERROR: {} is waiting on the resume stack",
                id
            );
            let msg = match st.tasks.get(&id).map(|t| t.state) {
                Some(TaskState::Created) => Transfer::Start,
                Some(TaskState::Suspended) => Transfer::Wake,
                Some(state) => panic!("FATAL ERROR: cannot resume {} in state {:?}", id, state),
                None => panic!("FATAL ERROR: cannot resume {}, no such task", id),
            };
            let (_, my_rx) = self.channel_of(&mut st, me, TaskState::Suspended);
            let (tx, _) = self.channel_of(&mut st, Context::Flow(id), TaskState::Running);
            st.stack.push(me);
            st.running = Context::Flow(id);
            (tx, my_rx, msg)
        };
        debug!("scheduler: resume {} ({:?})", id, msg);
        if tx.send(msg).is_err() {
            panic!("FATAL ERROR: {} is gone", id);
        }
        let reply = block_on(&rx);
        self.reap();
        match reply {
            Transfer::Returned => {}
            Transfer::Panicked(payload) => panic::resume_unwind(payload),
            Transfer::Cancel => panic::resume_unwind(Box::new(FlowCancelled)),
            other => panic!("FATAL ERROR: unexpected {:?} while waiting on the resume stack", other),
        }
    }

    /// Hand control back to the context that resumed the running flow and
    /// block until resumed again.
    ///
    /// # Panics
    ///
    /// When called from the driver, or with an empty resume stack.
    pub fn yield_back(&self) {
        let (tx, rx) = {
            let mut st = self.state.lock();
            let me = st.running;
            assert!(
                me != Context::Driver,
                "FATAL ERROR: the driver cannot yield"
            );
            let target = match st.stack.pop() {
                Some(target) => target,
                None => panic!("FATAL ERROR: {} has nothing to yield back to", me),
            };
            let (_, my_rx) = self.channel_of(&mut st, me, TaskState::Suspended);
            let (tx, _) = self.channel_of(&mut st, target, TaskState::Running);
            st.running = target;
            (tx, my_rx)
        };
        if tx.send(Transfer::Returned).is_err() {
            panic::resume_unwind(Box::new(FlowCancelled));
        }
        match block_on(&rx) {
            Transfer::Wake => {}
            Transfer::Cancel => panic::resume_unwind(Box::new(FlowCancelled)),
            other => panic!("FATAL ERROR: unexpected {:?} while suspended", other),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Removal
    // ═══════════════════════════════════════════════════════════════════

    /// Leave the running flow's continuation.  Control returns to its
    /// resumer; no cleanup hook runs.
    pub fn exit_current(&self) -> ! {
        let id = match self.current() {
            Context::Flow(id) => id,
            Context::Driver => panic!("FATAL ERROR: the driver cannot exit"),
        };
        debug!("scheduler: {} leaves its continuation", id);
        panic::resume_unwind(Box::new(FlowExit))
    }

    /// Destroy flow `id`.
    ///
    /// Removing the running flow does not return.  Otherwise returns
    /// `false` if there is no such flow, or if the process is terminating
    /// and the task is left alone.
    pub fn remove(&self, id: FlowId) -> bool {
        if self.current() == Context::Flow(id) {
            self.exit_current();
        }
        if self.is_terminated() {
            debug!("scheduler: terminating, not tearing down {}", id);
            return false;
        }
        self.cancel(id)
    }

    /// Unregister flow `id`, unwind it inside its blocking point and join
    /// its thread.  The flow must not be running.
    fn cancel(&self, id: FlowId) -> bool {
        let task = {
            let mut st = self.state.lock();
            let Some(task) = st.tasks.remove(&id) else {
                return false;
            };
            st.stack.retain(|ctx| *ctx != Context::Flow(id));
            task
        };
        debug!("scheduler: cancelling {}", id);
        let _ = task.tx.send(Transfer::Cancel);
        if let Some(handle) = task.handle {
            let _ = handle.join();
        }
        true
    }

    /// Cancel and join every flow.  Must be called from the driver, at
    /// which point no flow is running, so this also tears down the flows
    /// left behind by a terminated simulation.
    pub fn shutdown(&self) {
        let (ids, terminated) = {
            let st = self.state.lock();
            (st.tasks.keys().copied().collect::<Vec<_>>(), st.terminated)
        };
        if terminated && !ids.is_empty() {
            info!("scheduler: terminated with {} flows left, cancelling them", ids.len());
        }
        for id in ids {
            self.cancel(id);
        }
        self.reap();
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Queries
    // ═══════════════════════════════════════════════════════════════════

    /// The context that is executing right now.
    pub fn current(&self) -> Context {
        self.state.lock().running
    }

    /// State of flow `id`; `None` if it was never created.
    pub fn state(&self, id: FlowId) -> Option<TaskState> {
        let st = self.state.lock();
        match st.tasks.get(&id) {
            Some(task) => Some(task.state),
            None if id.0 < st.next_id => Some(TaskState::Terminated),
            None => None,
        }
    }

    /// Whether flow `id` is suspended waiting for a delivery, as opposed to
    /// waiting for a flow it resumed.
    pub fn can_deliver(&self, id: FlowId) -> bool {
        let st = self.state.lock();
        matches!(st.tasks.get(&id), Some(t) if t.state == TaskState::Suspended)
            && !st.stack.contains(&Context::Flow(id))
    }

    /// Number of live flows.
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Whether the simulation is terminating.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Mark the simulation as terminating.  From now on `remove` leaves
    /// other flows alone; only `shutdown` tears them down.
    pub fn set_terminated(&self) {
        self.state.lock().terminated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sched() -> Arc<FlowScheduler> {
        Arc::new(FlowScheduler::new(256 * 1024, "test-flow"))
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn created_flow_runs_only_when_resumed() {
        let s = sched();
        let events = log();
        let (s2, ev) = (Arc::clone(&s), Arc::clone(&events));
        let id = s
            .create(
                move |_| {
                    ev.lock().push("first".into());
                    s2.yield_back();
                    ev.lock().push("second".into());
                },
                |_| {},
            )
            .unwrap();
        assert_eq!(s.state(id), Some(TaskState::Created));
        assert!(events.lock().is_empty());

        s.resume(id);
        assert_eq!(*events.lock(), vec!["first"]);
        assert_eq!(s.state(id), Some(TaskState::Suspended));
        assert_eq!(s.current(), Context::Driver);
        assert!(s.can_deliver(id));

        s.resume(id);
        assert_eq!(*events.lock(), vec!["first", "second"]);
        assert_eq!(s.state(id), Some(TaskState::Terminated));
        assert_eq!(s.task_count(), 0);
    }

    #[test]
    fn yield_returns_to_resuming_flow() {
        let s = sched();
        let events = log();

        let (s_b, ev_b) = (Arc::clone(&s), Arc::clone(&events));
        let b = s
            .create(
                move |me| {
                    assert_eq!(s_b.current(), Context::Flow(me));
                    ev_b.lock().push("b runs".into());
                    s_b.yield_back();
                    ev_b.lock().push("b resumed".into());
                },
                |_| {},
            )
            .unwrap();

        let (s_a, ev_a) = (Arc::clone(&s), Arc::clone(&events));
        let a = s
            .create(
                move |_| {
                    s_a.resume(b);
                    ev_a.lock().push("a after b".into());
                },
                |_| {},
            )
            .unwrap();

        s.resume(a);
        assert_eq!(*events.lock(), vec!["b runs", "a after b"]);
        assert_eq!(s.state(a), Some(TaskState::Terminated));
        assert_eq!(s.state(b), Some(TaskState::Suspended));
        s.shutdown();
        assert_eq!(s.task_count(), 0);
    }

    #[test]
    fn cleanup_runs_on_return() {
        let s = sched();
        let cleaned = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&cleaned);
        let id = s
            .create(|_| {}, move |_| c.store(true, Ordering::SeqCst))
            .unwrap();
        s.resume(id);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn exit_skips_rest_of_body_and_cleanup() {
        let s = sched();
        let events = log();
        let (s2, ev) = (Arc::clone(&s), Arc::clone(&events));
        let cleaned = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&cleaned);
        let id = s
            .create(
                move |me| {
                    ev.lock().push("before".into());
                    s2.remove(me);
                    ev.lock().push("after".into());
                },
                move |_| c.store(true, Ordering::SeqCst),
            )
            .unwrap();
        s.resume(id);
        assert_eq!(*events.lock(), vec!["before"]);
        assert!(!cleaned.load(Ordering::SeqCst));
        assert_eq!(s.state(id), Some(TaskState::Terminated));
    }

    #[test]
    fn external_remove_unwinds_suspended_flow() {
        struct Dropped(Arc<AtomicBool>);
        impl Drop for Dropped {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let s = sched();
        let dropped = Arc::new(AtomicBool::new(false));
        let (s2, d) = (Arc::clone(&s), Arc::clone(&dropped));
        let id = s
            .create(
                move |_| {
                    let _guard = Dropped(d);
                    s2.yield_back();
                    unreachable!("removed flows are never woken");
                },
                |_| {},
            )
            .unwrap();
        s.resume(id);
        assert!(s.remove(id));
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!s.remove(id));
    }

    #[test]
    fn remove_before_start() {
        let s = sched();
        let id = s.create(|_| unreachable!(), |_| {}).unwrap();
        assert!(s.remove(id));
        assert_eq!(s.state(id), Some(TaskState::Terminated));
    }

    #[test]
    fn terminated_flag_blocks_teardown() {
        let s = sched();
        let s2 = Arc::clone(&s);
        let id = s.create(move |_| s2.yield_back(), |_| {}).unwrap();
        s.resume(id);
        s.set_terminated();
        assert!(!s.remove(id));
        assert_eq!(s.task_count(), 1);

        s.shutdown();
        assert_eq!(s.task_count(), 0);
        assert_eq!(s.state(id), Some(TaskState::Terminated));
        assert_eq!(Arc::strong_count(&s), 1);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panic_is_reraised_in_resumer() {
        let s = sched();
        let id = s.create(|_| panic!("boom"), |_| {}).unwrap();
        s.resume(id);
    }

    #[test]
    fn panic_runs_cleanup_first() {
        let s = sched();
        let cleaned = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&cleaned);
        let id = s
            .create(|_| panic!("boom"), move |_| c.store(true, Ordering::SeqCst))
            .unwrap();
        let result = panic::catch_unwind(AssertUnwindSafe(|| s.resume(id)));
        let payload = result.unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(s.current(), Context::Driver);
    }

    #[test]
    #[should_panic(expected = "FATAL ERROR")]
    fn resume_unknown_flow_is_fatal() {
        let s = sched();
        s.resume(FlowId(42));
    }

    #[test]
    #[should_panic(expected = "FATAL ERROR")]
    fn driver_cannot_yield() {
        sched().yield_back();
    }
}
