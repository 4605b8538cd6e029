//! Wait descriptors: what an experiment flow is waiting for.
//!
//! A [`Wait`] describes one registered condition (a breakpoint address, a
//! watched memory range, a set of interrupt numbers, a timeout, ...) plus
//! the bookkeeping the registry needs: id, occurrence counter and owning
//! flow.  The condition itself is a closed sum type, [`WaitKind`], with an
//! explicit [`WaitClass`] discriminant used for indexing.
//!
//! # Counter semantics
//!
//! A wait fires once `remaining` reaches zero.  It is then reset to its
//! initial value, so a wait created with [`Wait::with_counter`]`(3)` needs
//! three matching occurrences before each delivery.
//!
//! # Trigger details
//!
//! Each variant stores "what actually happened" separately from "what was
//! being waited for".  Trigger fields are `None` until the wait matches an
//! occurrence; after delivery they describe the matching occurrence, which
//! matters for wildcard waits.

use crate::config::MemoryMatch;
use crate::event::{AccessType, Address, Occurrence, TimerId, ANY_ADDR, ANY_INSTR, ANY_TRAP};
use crate::scheduler::FlowId;
use std::fmt;

/// Identity of a wait.  Assigned by the registry the first time the wait is
/// added, never reused by that registry.  A delivered wait keeps its id
/// when it is registered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitId(pub(crate) u64);

impl WaitId {
    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait#{}", self.0)
    }
}

/// Discriminant of [`WaitKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WaitClass {
    Breakpoint,
    BreakpointRange,
    MemoryAccess,
    Interrupt,
    Trap,
    GuestIo,
    IoPort,
    Jump,
    Timer,
}

// ═══════════════════════════════════════════════════════════════════════
//  Variants
// ═══════════════════════════════════════════════════════════════════════

/// Single instruction-pointer breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointWait {
    /// Watched instruction pointer, or [`ANY_ADDR`].
    pub watch_addr: Address,
    /// Watched address space, or [`ANY_ADDR`].
    pub address_space: Address,
    /// Instruction pointer that triggered the wait.
    pub trigger_ip: Option<Address>,
}

/// Inclusive instruction-pointer range.  Either bound may be [`ANY_ADDR`],
/// meaning the bottom or the top of the address space respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRangeWait {
    pub start: Address,
    pub end: Address,
    pub address_space: Address,
    pub trigger_ip: Option<Address>,
}

/// Details of the memory access that triggered a [`MemoryAccessWait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTrigger {
    pub addr: Address,
    pub width: usize,
    pub ip: Address,
    pub access: AccessType,
}

/// Memory read/write watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAccessWait {
    /// Watched address, or [`ANY_ADDR`].
    pub watch_addr: Address,
    /// Number of watched bytes starting at `watch_addr` (at least 1).
    pub watch_width: usize,
    /// Access directions to watch.
    pub watch_type: AccessType,
    pub trigger: Option<MemoryTrigger>,
}

/// Set of interrupt or trap numbers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TroubleSet {
    numbers: Vec<u32>,
}

impl TroubleSet {
    /// Add a watched number.  Returns `false` if it was already watched.
    pub fn add_watch_number(&mut self, number: u32) -> bool {
        if self.numbers.contains(&number) {
            return false;
        }
        self.numbers.push(number);
        true
    }

    /// Remove a watched number.  Returns `false` if it was not watched.
    pub fn remove_watch_number(&mut self, number: u32) -> bool {
        match self.numbers.iter().position(|&n| n == number) {
            Some(idx) => {
                self.numbers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Watched numbers in insertion order.
    pub fn watch_numbers(&self) -> &[u32] {
        &self.numbers
    }

    /// Whether `number` is watched, directly or through the wildcard.
    /// An empty set matches nothing.
    pub fn is_matching(&self, number: u32) -> bool {
        self.numbers.iter().any(|&n| n == number || n == ANY_TRAP)
    }
}

/// Interrupt watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterruptWait {
    pub watch: TroubleSet,
    pub trigger_number: Option<u32>,
    /// Whether the triggering interrupt was non-maskable.
    pub nmi: bool,
}

/// Trap watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrapWait {
    pub watch: TroubleSet,
    pub trigger_number: Option<u32>,
}

/// Guest communication; matches every guest byte.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuestIoWait {
    /// Last received `(data, port)`.
    pub received: Option<(u8, u32)>,
}

/// Port I/O watch on a single port and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoPortWait {
    pub port: u32,
    /// `true` watches output to the port, `false` input from it.
    pub out: bool,
    pub data: Option<u8>,
}

/// Conditional jump watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpWait {
    /// Watched opcode, or [`ANY_INSTR`].
    pub opcode: u32,
    pub trigger_opcode: Option<u32>,
    /// `true` if the jump was decided by a status flag, `false` if by
    /// register contents.
    pub flag_triggered: bool,
}

/// Timeout.  The backend timer is armed when the wait is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerWait {
    pub timeout_ms: u32,
    /// Re-arm automatically after each delivery.
    pub repeat: bool,
    /// Handle returned by the backend when the timer was armed.
    pub backend_id: Option<TimerId>,
}

/// The condition a [`Wait`] describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitKind {
    Breakpoint(BreakpointWait),
    BreakpointRange(BreakpointRangeWait),
    MemoryAccess(MemoryAccessWait),
    Interrupt(InterruptWait),
    Trap(TrapWait),
    GuestIo(GuestIoWait),
    IoPort(IoPortWait),
    Jump(JumpWait),
    Timer(TimerWait),
}

fn aspace_matches(watched: Address, actual: Address) -> bool {
    watched == ANY_ADDR || watched == actual
}

impl WaitKind {
    /// Discriminant of this variant.
    pub fn class(&self) -> WaitClass {
        match self {
            WaitKind::Breakpoint(_) => WaitClass::Breakpoint,
            WaitKind::BreakpointRange(_) => WaitClass::BreakpointRange,
            WaitKind::MemoryAccess(_) => WaitClass::MemoryAccess,
            WaitKind::Interrupt(_) => WaitClass::Interrupt,
            WaitKind::Trap(_) => WaitClass::Trap,
            WaitKind::GuestIo(_) => WaitClass::GuestIo,
            WaitKind::IoPort(_) => WaitClass::IoPort,
            WaitKind::Jump(_) => WaitClass::Jump,
            WaitKind::Timer(_) => WaitClass::Timer,
        }
    }

    /// Whether `occ` satisfies this condition.  Occurrences of another
    /// category never match.
    pub fn matches(&self, occ: &Occurrence, mode: MemoryMatch) -> bool {
        match (self, occ) {
            (WaitKind::Breakpoint(w), Occurrence::Breakpoint { ip, address_space }) => {
                aspace_matches(w.address_space, *address_space)
                    && (w.watch_addr == ANY_ADDR || w.watch_addr == *ip)
            }
            (WaitKind::BreakpointRange(w), Occurrence::Breakpoint { ip, address_space }) => {
                aspace_matches(w.address_space, *address_space)
                    && (w.start == ANY_ADDR || *ip >= w.start)
                    && (w.end == ANY_ADDR || *ip <= w.end)
            }
            (
                WaitKind::MemoryAccess(w),
                Occurrence::MemoryAccess {
                    addr,
                    width,
                    access,
                    ..
                },
            ) => {
                if !w.watch_type.intersects(*access) {
                    return false;
                }
                if w.watch_addr == ANY_ADDR {
                    return true;
                }
                let watch_end = w.watch_addr.saturating_add(w.watch_width.max(1) as u64);
                match mode {
                    MemoryMatch::LowestByte => *addr >= w.watch_addr && *addr < watch_end,
                    MemoryMatch::Overlap => {
                        let access_end = addr.saturating_add((*width).max(1) as u64);
                        w.watch_addr < access_end && *addr < watch_end
                    }
                }
            }
            (WaitKind::Interrupt(w), Occurrence::Interrupt { number, .. }) => {
                w.watch.is_matching(*number)
            }
            (WaitKind::Trap(w), Occurrence::Trap { number }) => w.watch.is_matching(*number),
            (WaitKind::GuestIo(_), Occurrence::GuestIo { .. }) => true,
            (WaitKind::IoPort(w), Occurrence::IoPort { port, out, .. }) => {
                w.port == *port && w.out == *out
            }
            (WaitKind::Jump(w), Occurrence::Jump { opcode, .. }) => {
                w.opcode == ANY_INSTR || w.opcode == *opcode
            }
            (WaitKind::Timer(w), Occurrence::Timer { timer }) => w.backend_id == Some(*timer),
            _ => false,
        }
    }

    /// Store the trigger details of a matching occurrence.
    pub(crate) fn record(&mut self, occ: &Occurrence) {
        match (self, occ) {
            (WaitKind::Breakpoint(w), Occurrence::Breakpoint { ip, .. }) => {
                w.trigger_ip = Some(*ip);
            }
            (WaitKind::BreakpointRange(w), Occurrence::Breakpoint { ip, .. }) => {
                w.trigger_ip = Some(*ip);
            }
            (
                WaitKind::MemoryAccess(w),
                Occurrence::MemoryAccess {
                    addr,
                    width,
                    access,
                    ip,
                },
            ) => {
                w.trigger = Some(MemoryTrigger {
                    addr: *addr,
                    width: *width,
                    ip: *ip,
                    access: *access,
                });
            }
            (WaitKind::Interrupt(w), Occurrence::Interrupt { number, nmi }) => {
                w.trigger_number = Some(*number);
                w.nmi = *nmi;
            }
            (WaitKind::Trap(w), Occurrence::Trap { number }) => {
                w.trigger_number = Some(*number);
            }
            (WaitKind::GuestIo(w), Occurrence::GuestIo { data, port }) => {
                w.received = Some((*data, *port));
            }
            (WaitKind::IoPort(w), Occurrence::IoPort { data, .. }) => {
                w.data = Some(*data);
            }
            (
                WaitKind::Jump(w),
                Occurrence::Jump {
                    flag_triggered,
                    opcode,
                },
            ) => {
                w.trigger_opcode = Some(*opcode);
                w.flag_triggered = *flag_triggered;
            }
            (WaitKind::Timer(_), Occurrence::Timer { .. }) => {}
            (kind, occ) => {
                debug_assert!(false, "record() called with mismatched {:?} / {}", kind.class(), occ);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Wait
// ═══════════════════════════════════════════════════════════════════════

/// A registered (or registrable) condition plus its bookkeeping.
///
/// Waits are built by flow code, moved into the registry by
/// `add_wait`, and handed back to the owning flow when they fire.
///
/// ```
/// use tripwire_sal::listener::Wait;
///
/// let wait = Wait::breakpoint(0x1000).with_counter(3);
/// assert_eq!(wait.counter(), 3);
/// assert!(wait.id().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wait {
    id: Option<WaitId>,
    created_at: u64,
    remaining: u32,
    initial: u32,
    owner: Option<FlowId>,
    kind: WaitKind,
}

impl Wait {
    /// Wrap a condition with a counter of one.
    pub fn new(kind: WaitKind) -> Self {
        Self {
            id: None,
            created_at: 0,
            remaining: 1,
            initial: 1,
            owner: None,
            kind,
        }
    }

    // ── Constructors ────────────────────────────────────────────

    /// Breakpoint on `ip` in any address space.
    pub fn breakpoint(ip: Address) -> Self {
        Self::new(WaitKind::Breakpoint(BreakpointWait {
            watch_addr: ip,
            address_space: ANY_ADDR,
            trigger_ip: None,
        }))
    }

    /// Breakpoint on every instruction.
    pub fn any_instruction() -> Self {
        Self::breakpoint(ANY_ADDR)
    }

    /// Breakpoint on the inclusive range `start..=end`.
    pub fn breakpoint_range(start: Address, end: Address) -> Self {
        Self::new(WaitKind::BreakpointRange(BreakpointRangeWait {
            start,
            end,
            address_space: ANY_ADDR,
            trigger_ip: None,
        }))
    }

    /// Memory access of type `watch_type` on `addr` (or [`ANY_ADDR`]).
    pub fn memory_access(addr: Address, watch_type: AccessType) -> Self {
        Self::new(WaitKind::MemoryAccess(MemoryAccessWait {
            watch_addr: addr,
            watch_width: 1,
            watch_type,
            trigger: None,
        }))
    }

    pub fn memory_read(addr: Address) -> Self {
        Self::memory_access(addr, AccessType::Read)
    }

    pub fn memory_write(addr: Address) -> Self {
        Self::memory_access(addr, AccessType::Write)
    }

    /// Interrupt `number` (or [`ANY_INTERRUPT`](crate::event::ANY_INTERRUPT)).
    pub fn interrupt(number: u32) -> Self {
        Self::interrupts([number])
    }

    /// Any of the interrupts in `numbers`.
    pub fn interrupts(numbers: impl IntoIterator<Item = u32>) -> Self {
        let mut watch = TroubleSet::default();
        for n in numbers {
            watch.add_watch_number(n);
        }
        Self::new(WaitKind::Interrupt(InterruptWait {
            watch,
            ..Default::default()
        }))
    }

    /// Trap `number` (or [`ANY_TRAP`]).
    pub fn trap(number: u32) -> Self {
        Self::traps([number])
    }

    /// Any of the traps in `numbers`.
    pub fn traps(numbers: impl IntoIterator<Item = u32>) -> Self {
        let mut watch = TroubleSet::default();
        for n in numbers {
            watch.add_watch_number(n);
        }
        Self::new(WaitKind::Trap(TrapWait {
            watch,
            trigger_number: None,
        }))
    }

    /// Next byte sent by the guest.
    pub fn guest_io() -> Self {
        Self::new(WaitKind::GuestIo(GuestIoWait::default()))
    }

    /// Port I/O on `port` in direction `out`.
    pub fn io_port(port: u32, out: bool) -> Self {
        Self::new(WaitKind::IoPort(IoPortWait {
            port,
            out,
            data: None,
        }))
    }

    /// Conditional jump with `opcode` (or [`ANY_INSTR`]).
    pub fn jump(opcode: u32) -> Self {
        Self::new(WaitKind::Jump(JumpWait {
            opcode,
            trigger_opcode: None,
            flag_triggered: false,
        }))
    }

    /// Timeout after `timeout_ms` milliseconds, optionally repeating.
    pub fn timer(timeout_ms: u32, repeat: bool) -> Self {
        Self::new(WaitKind::Timer(TimerWait {
            timeout_ms,
            repeat,
            backend_id: None,
        }))
    }

    // ── Builders ────────────────────────────────────────────────

    /// Require `count` matching occurrences per delivery.
    pub fn with_counter(mut self, count: u32) -> Self {
        self.remaining = count;
        self.initial = count;
        self
    }

    /// Restrict a breakpoint wait to one address space.  No effect on other
    /// variants.
    pub fn in_address_space(mut self, address_space: Address) -> Self {
        match &mut self.kind {
            WaitKind::Breakpoint(w) => w.address_space = address_space,
            WaitKind::BreakpointRange(w) => w.address_space = address_space,
            _ => {}
        }
        self
    }

    /// Watch `width` bytes with a memory wait.  No effect on other variants.
    pub fn with_width(mut self, width: usize) -> Self {
        if let WaitKind::MemoryAccess(w) = &mut self.kind {
            w.watch_width = width.max(1);
        }
        self
    }

    // ── Accessors ───────────────────────────────────────────────

    /// Registry id; `None` until the wait has been added once.
    pub fn id(&self) -> Option<WaitId> {
        self.id
    }

    /// Logical time (occurrences dispatched so far) of the last
    /// registration.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Occurrences still needed before the next delivery.
    pub fn counter(&self) -> u32 {
        self.remaining
    }

    pub fn initial_counter(&self) -> u32 {
        self.initial
    }

    /// Owning flow while the wait is registered.
    pub fn owner(&self) -> Option<FlowId> {
        self.owner
    }

    pub fn kind(&self) -> &WaitKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut WaitKind {
        &mut self.kind
    }

    pub fn class(&self) -> WaitClass {
        self.kind.class()
    }

    /// Instruction pointer of the occurrence that triggered a breakpoint or
    /// memory wait.
    pub fn trigger_instruction_pointer(&self) -> Option<Address> {
        match &self.kind {
            WaitKind::Breakpoint(w) => w.trigger_ip,
            WaitKind::BreakpointRange(w) => w.trigger_ip,
            WaitKind::MemoryAccess(w) => w.trigger.map(|t| t.ip),
            _ => None,
        }
    }

    /// Access type of the memory access that triggered a memory wait.
    pub fn trigger_access_type(&self) -> Option<AccessType> {
        match &self.kind {
            WaitKind::MemoryAccess(w) => w.trigger.map(|t| t.access),
            _ => None,
        }
    }

    /// Interrupt or trap number that triggered the wait.
    pub fn trigger_number(&self) -> Option<u32> {
        match &self.kind {
            WaitKind::Interrupt(w) => w.trigger_number,
            WaitKind::Trap(w) => w.trigger_number,
            _ => None,
        }
    }

    /// Backend timer handle of an armed timer wait.
    pub fn timer_id(&self) -> Option<TimerId> {
        match &self.kind {
            WaitKind::Timer(w) => w.backend_id,
            _ => None,
        }
    }

    pub fn matches(&self, occ: &Occurrence, mode: MemoryMatch) -> bool {
        self.kind.matches(occ, mode)
    }

    // ── Registry bookkeeping ────────────────────────────────────

    pub(crate) fn attach(&mut self, id: WaitId, owner: FlowId, now: u64) {
        self.id = Some(id);
        self.owner = Some(owner);
        self.created_at = now;
    }

    /// Clear the owner when the wait leaves the registry, so the flow can
    /// register it again.
    pub(crate) fn detach(&mut self) {
        self.owner = None;
    }

    pub(crate) fn decrease_counter(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub(crate) fn reset_counter(&mut self) {
        self.remaining = self.initial;
    }

    pub(crate) fn set_timer_id(&mut self, id: Option<TimerId>) {
        if let WaitKind::Timer(w) = &mut self.kind {
            w.backend_id = id;
        }
    }
}
