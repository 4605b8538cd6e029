//! The wait registry: pending, ready and tombstoned waits.
//!
//! # Architecture
//!
//! ```text
//!   add ──► pending ──mark_ready──► ready ──next_deliverable──► owner flow
//!              │                      │
//!            remove                 remove
//!              ▼                      ▼
//!          (detached)            tombstoned ──finish_cycle──► dropped
//! ```
//!
//! One dispatch cycle first readies every match of an occurrence and only
//! then delivers them one by one.  Delivering a wait resumes arbitrary flow
//! code, which may remove a sibling that was readied by the same
//! occurrence.  Such a sibling moves from `ready` to `tombstoned` and is
//! never delivered.  A wait lives in at most one of the three collections.
//!
//! Pending waits are keyed by a registration sequence number, so iteration
//! order is registration order and a re-added wait goes to the back.

use crate::cache::WaitCache;
use crate::config::MemoryMatch;
use crate::event::{Occurrence, TimerId};
use crate::listener::{Wait, WaitId, WaitKind};
use crate::scheduler::FlowId;
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Storage and bookkeeping for registered waits.
#[derive(Debug)]
pub struct WaitRegistry {
    pending: BTreeMap<u64, Wait>,
    /// Wait id → sequence number in `pending`.
    slots: HashMap<WaitId, u64>,
    ready: VecDeque<Wait>,
    tombstoned: Vec<Wait>,
    cache: WaitCache,
    next_seq: u64,
    next_id: u64,
    last_fired: Option<WaitId>,
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitRegistry {
    /// An empty registry.  Wait ids start at 1.
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            slots: HashMap::new(),
            ready: VecDeque::new(),
            tombstoned: Vec::new(),
            cache: WaitCache::new(),
            next_seq: 0,
            next_id: 1,
            last_fired: None,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Registration
    // ═══════════════════════════════════════════════════════════════════

    /// Insert `wait` into pending on behalf of `owner`.
    ///
    /// `now` is the logical timestamp stored as the wait's `created_at`.
    ///
    /// # Panics
    ///
    /// If the counter is zero, the wait is already owned, or a wait with
    /// the same id is still registered.
    pub fn add(&mut self, mut wait: Wait, owner: FlowId, now: u64) -> WaitId {
        assert!(
            wait.counter() > 0,
            "FATAL ERROR: cannot add a wait with a zero counter"
        );
        assert!(
            wait.owner().is_none(),
            "FATAL ERROR: wait {:?} is already owned by {:?}",
            wait.id(),
            wait.owner()
        );
        let id = match wait.id() {
            Some(id) => {
                assert!(
                    !self.is_registered(id),
                    "FATAL ERROR: {} is already registered",
                    id
                );
                id
            }
            None => {
                let id = WaitId(self.next_id);
                self.next_id += 1;
                id
            }
        };
        wait.attach(id, owner, now);
        self.tombstoned.retain(|w| w.id() != Some(id));
        self.insert_pending(wait);
        debug!("registry: added {} for {}", id, owner);
        id
    }

    fn insert_pending(&mut self, wait: Wait) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.cache.insert(seq, &wait);
        if let Some(id) = wait.id() {
            self.slots.insert(id, seq);
        }
        self.pending.insert(seq, wait);
    }

    fn take_pending(&mut self, seq: u64) -> Option<Wait> {
        let wait = self.pending.remove(&seq)?;
        self.cache.remove(seq, &wait);
        if let Some(id) = wait.id() {
            self.slots.remove(&id);
        }
        Some(wait)
    }

    /// Move a ready entry to the tombstone list, returning a detached copy.
    fn tombstone_at(&mut self, idx: usize) -> Option<Wait> {
        let wait = self.ready.remove(idx)?;
        let mut copy = wait.clone();
        copy.detach();
        self.tombstoned.push(wait);
        Some(copy)
    }

    /// Remove one wait.  A pending wait is unlinked; a readied but not yet
    /// delivered wait is tombstoned.  Returns the detached wait, or `None`
    /// if no such wait is registered.
    pub fn remove(&mut self, id: WaitId) -> Option<Wait> {
        if let Some(seq) = self.slots.get(&id).copied() {
            let mut wait = self.take_pending(seq)?;
            wait.detach();
            debug!("registry: removed pending {}", id);
            return Some(wait);
        }
        let idx = self.ready.iter().position(|w| w.id() == Some(id))?;
        debug!("registry: tombstoned {}", id);
        self.tombstone_at(idx)
    }

    /// Remove every wait of every flow.
    pub fn remove_all(&mut self) -> Vec<Wait> {
        let mut removed: Vec<Wait> = std::mem::take(&mut self.pending)
            .into_values()
            .map(|mut w| {
                w.detach();
                w
            })
            .collect();
        self.slots.clear();
        self.cache.clear();
        while !self.ready.is_empty() {
            removed.extend(self.tombstone_at(0));
        }
        if !removed.is_empty() {
            debug!("registry: removed all {} waits", removed.len());
        }
        removed
    }

    /// Remove every wait owned by `flow`; `None` means every flow.
    pub fn remove_flow(&mut self, flow: Option<FlowId>) -> Vec<Wait> {
        let flow = match flow {
            Some(flow) => flow,
            None => return self.remove_all(),
        };
        let seqs: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, w)| w.owner() == Some(flow))
            .map(|(seq, _)| *seq)
            .collect();
        let mut removed = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(mut w) = self.take_pending(seq) {
                w.detach();
                removed.push(w);
            }
        }
        while let Some(idx) = self.ready.iter().position(|w| w.owner() == Some(flow)) {
            removed.extend(self.tombstone_at(idx));
        }
        if !removed.is_empty() {
            debug!("registry: removed {} waits of {}", removed.len(), flow);
        }
        removed
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Matching
    // ═══════════════════════════════════════════════════════════════════

    /// Count one matching occurrence for the pending wait `id`.
    ///
    /// Returns `true` when the counter reached zero and the wait moved to
    /// the ready list.
    pub fn mark_ready(&mut self, id: WaitId) -> bool {
        match self.slots.get(&id).copied() {
            Some(seq) => self.mark_ready_at(seq).0,
            None => false,
        }
    }

    /// Cursor variant of [`mark_ready`](Self::mark_ready).  Also returns
    /// the slot following `seq`, which stays valid even when the wait at
    /// `seq` was just unlinked.
    pub fn mark_ready_at(&mut self, seq: u64) -> (bool, Option<u64>) {
        let next = self.next_slot(seq);
        let Some(wait) = self.pending.get_mut(&seq) else {
            return (false, next);
        };
        assert!(
            wait.owner().is_some(),
            "FATAL ERROR: pending wait {:?} has no owner",
            wait.id()
        );
        wait.decrease_counter();
        if wait.counter() > 0 {
            return (false, next);
        }
        wait.reset_counter();
        if let Some(wait) = self.take_pending(seq) {
            self.last_fired = wait.id();
            self.ready.push_back(wait);
        }
        (true, next)
    }

    /// Slot of the oldest pending wait.
    pub fn first_slot(&self) -> Option<u64> {
        self.pending.keys().next().copied()
    }

    /// Slot following `seq` in registration order.
    pub fn next_slot(&self, seq: u64) -> Option<u64> {
        self.pending
            .range(seq.saturating_add(1)..)
            .next()
            .map(|(k, _)| *k)
    }

    /// Slots of the pending waits that may match `occ`, from the cache.
    pub fn candidates(&self, occ: &Occurrence) -> Vec<u64> {
        self.cache.candidates(occ)
    }

    /// Whether the pending wait at `seq` matches `occ`.
    pub fn matches_at(&self, seq: u64, occ: &Occurrence, mode: MemoryMatch) -> bool {
        self.pending
            .get(&seq)
            .map_or(false, |w| w.matches(occ, mode))
    }

    /// Store trigger details of `occ` in the pending wait at `seq`.
    pub fn record_at(&mut self, seq: u64, occ: &Occurrence) {
        if let Some(w) = self.pending.get_mut(&seq) {
            w.kind_mut().record(occ);
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Delivery
    // ═══════════════════════════════════════════════════════════════════

    /// Pop the next ready wait with its owner, skipping tombstoned entries.
    ///
    /// A repeating timer is put back into pending (same id, same owner)
    /// before it is handed out.
    pub fn next_deliverable(&mut self) -> Option<(FlowId, Wait)> {
        while let Some(mut wait) = self.ready.pop_front() {
            if self.tombstoned.iter().any(|t| t.id() == wait.id()) {
                continue;
            }
            let owner = match wait.owner() {
                Some(owner) => owner,
                None => panic!(
                    "FATAL ERROR: ready wait {:?} has no owner",
                    wait.id()
                ),
            };
            if matches!(wait.kind(), WaitKind::Timer(t) if t.repeat) {
                self.insert_pending(wait.clone());
            }
            wait.detach();
            return Some((owner, wait));
        }
        None
    }

    /// End the dispatch cycle: forget the ready and tombstone lists.
    pub fn finish_cycle(&mut self) {
        self.ready.clear();
        self.tombstoned.clear();
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Queries
    // ═══════════════════════════════════════════════════════════════════

    /// Number of pending waits.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no wait is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of readied, not yet delivered waits.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of distinct flows owning pending waits.
    pub fn flow_count(&self) -> usize {
        self.pending
            .values()
            .filter_map(Wait::owner)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Number of pending waits owned by `flow`.
    pub fn count_for(&self, flow: FlowId) -> usize {
        self.pending
            .values()
            .filter(|w| w.owner() == Some(flow))
            .count()
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: WaitId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Whether `id` is pending or readied.
    pub fn is_registered(&self, id: WaitId) -> bool {
        self.contains(id) || self.ready.iter().any(|w| w.id() == Some(id))
    }

    /// Whether `id` was removed after being readied in the current cycle.
    pub fn is_tombstoned(&self, id: WaitId) -> bool {
        self.tombstoned.iter().any(|w| w.id() == Some(id))
    }

    /// The pending wait `id`.
    pub fn get(&self, id: WaitId) -> Option<&Wait> {
        self.slots.get(&id).and_then(|seq| self.pending.get(seq))
    }

    /// Owner of the pending wait `id`.
    pub fn owner_of(&self, id: WaitId) -> Option<FlowId> {
        self.get(id).and_then(Wait::owner)
    }

    /// Pending wait armed with backend timer `timer`.
    pub fn timer_wait(&self, timer: TimerId) -> Option<WaitId> {
        self.cache
            .timer_slot(timer)
            .and_then(|seq| self.pending.get(&seq))
            .and_then(Wait::id)
    }

    /// Id of the wait most recently moved to the ready list.
    pub fn last_fired(&self) -> Option<WaitId> {
        self.last_fired
    }

    /// Pending timer waits as `(id, timeout_ms, repeat, backend timer)`,
    /// in registration order.
    pub fn pending_timers(&self) -> Vec<(WaitId, u32, bool, Option<TimerId>)> {
        self.pending
            .values()
            .filter_map(|w| match (w.id(), w.kind()) {
                (Some(id), WaitKind::Timer(t)) => Some((id, t.timeout_ms, t.repeat, t.backend_id)),
                _ => None,
            })
            .collect()
    }

    /// Point the pending timer wait `id` at a new backend timer.  Returns
    /// `false` if `id` is not pending.
    pub fn set_timer(&mut self, id: WaitId, timer: Option<TimerId>) -> bool {
        let Some(seq) = self.slots.get(&id).copied() else {
            return false;
        };
        let Some(wait) = self.pending.get_mut(&seq) else {
            return false;
        };
        self.cache.remove(seq, wait);
        wait.set_timer_id(timer);
        self.cache.insert(seq, wait);
        true
    }
}
