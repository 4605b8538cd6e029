//! Virtual millisecond clock with a timer table.
//!
//! Simulated time only moves when the driver says so.  Timers armed through
//! the backend are kept in a table keyed by handle; advancing the clock
//! returns the handles that expired, in expiry order, so the driver can
//! report them to the controller one by one.
//!
//! The clock is a cheap, cloneable handle: the backend arms and disarms
//! timers through it while the trace driver advances it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tripwire_sal::backend::BackendError;
use tripwire_sal::event::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerEntry {
    period_ms: u64,
    due_ms: u64,
    repeat: bool,
}

#[derive(Debug, Default)]
struct TimerTable {
    now_ms: u64,
    timers: BTreeMap<TimerId, TimerEntry>,
    next_id: TimerId,
    capacity: Option<usize>,
}

/// Shared handle to the virtual clock.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    inner: Arc<Mutex<TimerTable>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that refuses to arm more than `capacity` timers at once.
    pub fn with_capacity(capacity: usize) -> Self {
        let clock = Self::new();
        clock.inner.lock().capacity = Some(capacity);
        clock
    }

    /// Current simulated time.
    pub fn now_ms(&self) -> u64 {
        self.inner.lock().now_ms
    }

    /// Overwrite the current time, e.g. after a state restore.
    pub fn set_now(&self, now_ms: u64) {
        self.inner.lock().now_ms = now_ms;
    }

    /// Arm a timer expiring `timeout_ms` from now.  A repeating timer with
    /// a zero period fires once per millisecond.
    pub fn arm(&self, timeout_ms: u32, repeat: bool) -> Result<TimerId, BackendError> {
        let mut t = self.inner.lock();
        if let Some(cap) = t.capacity {
            if t.timers.len() >= cap {
                return Err(BackendError::TimerUnavailable(format!(
                    "all {} timer slots in use",
                    cap
                )));
            }
        }
        t.next_id += 1;
        let id = t.next_id;
        let period_ms = u64::from(timeout_ms);
        let due_ms = t.now_ms + period_ms;
        t.timers.insert(
            id,
            TimerEntry {
                period_ms,
                due_ms,
                repeat,
            },
        );
        Ok(id)
    }

    /// Disarm a timer.  Returns `false` for unknown handles.
    pub fn disarm(&self, id: TimerId) -> bool {
        self.inner.lock().timers.remove(&id).is_some()
    }

    /// Drop every armed timer.
    pub fn clear_timers(&self) {
        self.inner.lock().timers.clear();
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Expiry time of the earliest armed timer.
    pub fn next_deadline(&self) -> Option<u64> {
        self.inner.lock().timers.values().map(|e| e.due_ms).min()
    }

    /// Move time forward by `ms`; see [`advance_to`](Self::advance_to).
    pub fn advance(&self, ms: u64) -> Vec<TimerId> {
        let target = self.now_ms().saturating_add(ms);
        self.advance_to(target)
    }

    /// Move time forward to `target_ms` (never backwards) and return the
    /// handles of all expirations up to and including `target_ms`, ordered
    /// by expiry time and then by handle.  A repeating timer appears once
    /// per expiry; one-shot timers are disarmed when they expire.
    pub fn advance_to(&self, target_ms: u64) -> Vec<TimerId> {
        let mut t = self.inner.lock();
        let mut fired = Vec::new();
        loop {
            let next = t
                .timers
                .iter()
                .filter(|(_, e)| e.due_ms <= target_ms)
                .min_by_key(|(id, e)| (e.due_ms, **id))
                .map(|(id, e)| (*id, *e));
            let Some((id, entry)) = next else {
                break;
            };
            t.now_ms = t.now_ms.max(entry.due_ms);
            fired.push(id);
            if entry.repeat {
                if let Some(e) = t.timers.get_mut(&id) {
                    e.due_ms += entry.period_ms.max(1);
                }
            } else {
                t.timers.remove(&id);
            }
        }
        t.now_ms = t.now_ms.max(target_ms);
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let clock = SimClock::new();
        let id = clock.arm(10, false).unwrap();
        assert!(clock.advance(9).is_empty());
        assert_eq!(clock.advance(1), vec![id]);
        assert_eq!(clock.now_ms(), 10);
        assert!(clock.advance(100).is_empty());
        assert_eq!(clock.armed(), 0);
    }

    #[test]
    fn repeating_timer_fires_every_period() {
        let clock = SimClock::new();
        let id = clock.arm(10, true).unwrap();
        assert_eq!(clock.advance_to(35), vec![id, id, id]);
        assert_eq!(clock.next_deadline(), Some(40));
        assert!(clock.disarm(id));
        assert!(!clock.disarm(id));
    }

    #[test]
    fn expirations_are_ordered() {
        let clock = SimClock::new();
        let slow = clock.arm(15, false).unwrap();
        let fast = clock.arm(5, true).unwrap();
        // ties go to the older handle
        assert_eq!(clock.advance(15), vec![fast, fast, slow, fast]);
    }

    #[test]
    fn time_never_goes_backwards() {
        let clock = SimClock::new();
        clock.advance(50);
        assert!(clock.advance_to(10).is_empty());
        assert_eq!(clock.now_ms(), 50);
    }

    #[test]
    fn capacity_limit() {
        let clock = SimClock::with_capacity(1);
        clock.arm(1, false).unwrap();
        assert!(matches!(
            clock.arm(1, false),
            Err(BackendError::TimerUnavailable(_))
        ));
    }
}
