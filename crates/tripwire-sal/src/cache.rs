//! Fast-path index over the pending waits.
//!
//! The registry keeps pending waits in registration order, keyed by a
//! sequence number.  Scanning all of them for every fetched instruction is
//! wasteful, so the cache keeps per-class sets of sequence numbers plus two
//! sharper indices:
//!
//! - breakpoints with a concrete address, keyed by that address
//!   (wildcard breakpoints are kept in a separate set),
//! - armed timers, keyed by the backend timer handle.
//!
//! Candidate lists are returned sorted by sequence number, so matching
//! through the cache visits waits in exactly the order a full scan would.

use crate::event::{Address, Occurrence, TimerId, ANY_ADDR};
use crate::listener::{Wait, WaitClass, WaitKind};
use std::collections::{BTreeSet, HashMap};

/// Per-class index of pending waits, keyed by registry sequence number.
#[derive(Debug, Default)]
pub struct WaitCache {
    by_class: HashMap<WaitClass, BTreeSet<u64>>,
    breakpoints: HashMap<Address, BTreeSet<u64>>,
    any_breakpoints: BTreeSet<u64>,
    timers: HashMap<TimerId, u64>,
}

impl WaitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a wait that was just inserted into pending at `seq`.
    pub fn insert(&mut self, seq: u64, wait: &Wait) {
        match wait.kind() {
            WaitKind::Breakpoint(bp) if bp.watch_addr != ANY_ADDR => {
                self.breakpoints.entry(bp.watch_addr).or_default().insert(seq);
            }
            WaitKind::Breakpoint(_) => {
                self.any_breakpoints.insert(seq);
            }
            WaitKind::Timer(t) => {
                if let Some(id) = t.backend_id {
                    self.timers.insert(id, seq);
                }
                self.by_class.entry(WaitClass::Timer).or_default().insert(seq);
            }
            kind => {
                self.by_class.entry(kind.class()).or_default().insert(seq);
            }
        }
    }

    /// Drop a wait that left pending.
    pub fn remove(&mut self, seq: u64, wait: &Wait) {
        match wait.kind() {
            WaitKind::Breakpoint(bp) if bp.watch_addr != ANY_ADDR => {
                if let Some(set) = self.breakpoints.get_mut(&bp.watch_addr) {
                    set.remove(&seq);
                    if set.is_empty() {
                        self.breakpoints.remove(&bp.watch_addr);
                    }
                }
            }
            WaitKind::Breakpoint(_) => {
                self.any_breakpoints.remove(&seq);
            }
            WaitKind::Timer(t) => {
                if let Some(id) = t.backend_id {
                    if self.timers.get(&id) == Some(&seq) {
                        self.timers.remove(&id);
                    }
                }
                self.remove_class(WaitClass::Timer, seq);
            }
            kind => self.remove_class(kind.class(), seq),
        }
    }

    fn remove_class(&mut self, class: WaitClass, seq: u64) {
        if let Some(set) = self.by_class.get_mut(&class) {
            set.remove(&seq);
        }
    }

    pub fn clear(&mut self) {
        self.by_class.clear();
        self.breakpoints.clear();
        self.any_breakpoints.clear();
        self.timers.clear();
    }

    /// Sequence numbers of pending waits that may match `occ`, ascending.
    /// Candidates still have to be checked with [`Wait::matches`].
    pub fn candidates(&self, occ: &Occurrence) -> Vec<u64> {
        match occ {
            Occurrence::Breakpoint { ip, .. } => {
                let mut seqs: BTreeSet<u64> = self.any_breakpoints.clone();
                if let Some(set) = self.breakpoints.get(ip) {
                    seqs.extend(set.iter().copied());
                }
                if let Some(set) = self.by_class.get(&WaitClass::BreakpointRange) {
                    seqs.extend(set.iter().copied());
                }
                seqs.into_iter().collect()
            }
            Occurrence::Timer { timer } => self.timers.get(timer).copied().into_iter().collect(),
            other => {
                let class = other.classes()[0];
                self.by_class
                    .get(&class)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default()
            }
        }
    }

    /// Sequence number of the pending wait armed with backend timer `id`.
    pub fn timer_slot(&self, id: TimerId) -> Option<u64> {
        self.timers.get(&id).copied()
    }

    /// Number of indexed waits.
    pub fn len(&self) -> usize {
        self.by_class.values().map(BTreeSet::len).sum::<usize>()
            + self.breakpoints.values().map(BTreeSet::len).sum::<usize>()
            + self.any_breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
