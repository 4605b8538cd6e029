//! Recorded occurrence traces.
//!
//! A [`Trace`] is a list of occurrences stamped with the simulated time at
//! which they happened, stored as JSON:
//!
//! ```text
//! {
//!   "name": "boot",
//!   "events": [
//!     { "at_ms": 0, "occurrence": { "type": "breakpoint", "ip": 4096, "address_space": 0 } },
//!     { "at_ms": 3, "occurrence": { "type": "interrupt", "number": 32, "nmi": false } }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;
use tripwire_sal::event::Occurrence;

/// Errors that can occur while loading or saving a trace.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event {index} at {at_ms} ms precedes the previous event at {previous_ms} ms")]
    OutOfOrder {
        index: usize,
        at_ms: u64,
        previous_ms: u64,
    },
}

/// One timestamped occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub at_ms: u64,
    pub occurrence: Occurrence,
}

/// Occurrences in simulated-time order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default)]
    pub name: String,
    pub events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }

    /// Append an occurrence at `at_ms`.
    pub fn push(&mut self, at_ms: u64, occurrence: Occurrence) -> &mut Self {
        self.events.push(TraceEvent { at_ms, occurrence });
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Time of the last event.
    pub fn duration_ms(&self) -> u64 {
        self.events.last().map_or(0, |e| e.at_ms)
    }

    /// Check that timestamps never decrease.
    pub fn validate(&self) -> Result<(), TraceError> {
        for (index, pair) in self.events.windows(2).enumerate() {
            if pair[1].at_ms < pair[0].at_ms {
                return Err(TraceError::OutOfOrder {
                    index: index + 1,
                    at_ms: pair[1].at_ms,
                    previous_ms: pair[0].at_ms,
                });
            }
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, TraceError> {
        let trace: Trace = serde_json::from_str(json)?;
        trace.validate()?;
        Ok(trace)
    }

    pub fn to_json(&self) -> Result<String, TraceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load and validate a trace file.
    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let file = File::open(path)?;
        let trace: Trace = serde_json::from_reader(BufReader::new(file))?;
        trace.validate()?;
        Ok(trace)
    }

    pub fn save(&self, path: &Path) -> Result<(), TraceError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}
