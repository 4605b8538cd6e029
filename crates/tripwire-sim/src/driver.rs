//! Trace driver: feeds recorded occurrences and clock expirations into a
//! controller.
//!
//! For every trace event the driver first moves the virtual clock up to the
//! event's timestamp, reporting each timer expiration on the way, and then
//! dispatches the event itself.  Expirations are processed one deadline at
//! a time, so a timer armed or disarmed by a flow while handling an earlier
//! expiration is honoured.

use crate::clock::SimClock;
use crate::trace::Trace;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tripwire_sal::controller::SimulatorController;
use tripwire_sal::event::Occurrence;

/// Summary of a driver run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveReport {
    /// Trace occurrences dispatched.
    pub occurrences: u64,
    /// Timer expirations dispatched.
    pub timers_fired: u64,
    /// Waits readied by all of the above.
    pub readied: u64,
    pub terminated: bool,
    pub exit_code: Option<i32>,
    /// Simulated time when the run ended.
    pub end_ms: u64,
}

/// Replays traces against a controller whose backend shares `clock`.
pub struct TraceDriver<'a> {
    ctl: &'a SimulatorController,
    clock: SimClock,
    report: DriveReport,
}

impl<'a> TraceDriver<'a> {
    pub fn new(ctl: &'a SimulatorController, clock: SimClock) -> Self {
        Self {
            ctl,
            clock,
            report: DriveReport::default(),
        }
    }

    /// Counters accumulated so far.
    pub fn report(&self) -> DriveReport {
        let mut report = self.report.clone();
        report.terminated = self.ctl.is_terminated();
        report.exit_code = self.ctl.exit_code();
        report.end_ms = self.clock.now_ms();
        report
    }

    /// Dispatch one occurrence now.
    pub fn dispatch(&mut self, occ: Occurrence) -> usize {
        debug!("t={}ms: {} event", self.clock.now_ms(), occ.name());
        let readied = self.ctl.dispatch(occ);
        self.report.occurrences += 1;
        self.report.readied += readied as u64;
        readied
    }

    /// Fire every timer due at or before `target_ms`, then leave the clock
    /// at `target_ms`.  Returns the number of expirations dispatched.
    pub fn fire_due(&mut self, target_ms: u64) -> usize {
        let mut fired = 0;
        while !self.ctl.is_terminated() {
            let Some(deadline) = self.clock.next_deadline().filter(|d| *d <= target_ms) else {
                break;
            };
            for timer in self.clock.advance_to(deadline) {
                if self.ctl.is_terminated() {
                    break;
                }
                debug!("t={}ms: timer {} expired", deadline, timer);
                let readied = self.ctl.dispatch(Occurrence::Timer { timer });
                self.report.timers_fired += 1;
                self.report.readied += readied as u64;
                fired += 1;
            }
        }
        if !self.ctl.is_terminated() {
            self.clock.advance_to(target_ms);
        }
        fired
    }

    /// Advance the clock by `ms`, firing due timers.
    pub fn advance(&mut self, ms: u64) -> usize {
        let target = self.clock.now_ms().saturating_add(ms);
        self.fire_due(target)
    }

    /// Play `trace` from the current clock time.  Event timestamps are
    /// relative to the start of the run.  Stops early when the simulation
    /// terminates.
    pub fn run(&mut self, trace: &Trace) -> DriveReport {
        let start = self.clock.now_ms();
        info!(
            "driver: playing trace '{}' ({} events) from t={}ms",
            trace.name,
            trace.len(),
            start
        );
        for event in &trace.events {
            if self.ctl.is_terminated() {
                break;
            }
            self.fire_due(start.saturating_add(event.at_ms));
            if self.ctl.is_terminated() {
                break;
            }
            self.dispatch(event.occurrence.clone());
        }
        let report = self.report();
        info!(
            "driver: {} occurrences, {} timer expirations, {} waits readied, terminated={} exit={:?}",
            report.occurrences,
            report.timers_fired,
            report.readied,
            report.terminated,
            report.exit_code
        );
        report
    }
}
