//! Controller configuration.

use serde::Deserialize;

/// How a memory wait with a concrete address is compared against an
/// access that spans more than one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMatch {
    /// Only the lowest address of the access is tested against the watched
    /// range.  A 4-byte write to `0x1000` does not match a wait on
    /// `0x1002`.
    #[default]
    LowestByte,
    /// Any byte covered by the access may hit the watched range.
    Overlap,
}

/// Configuration for a [`SimulatorController`](crate::controller::SimulatorController).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Use the per-class index and the breakpoint address index when
    /// matching occurrences.  When disabled every dispatch walks the whole
    /// pending list.
    pub fast_path: bool,
    /// Memory matching mode for multi-byte accesses.
    pub memory_match: MemoryMatch,
    /// Stack size (bytes) of each flow thread.
    pub flow_stack_size: usize,
    /// Prefix for flow thread names (`<prefix>-<flow id>`).
    pub thread_name_prefix: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            fast_path: true,
            memory_match: MemoryMatch::LowestByte,
            flow_stack_size: 4096 * 4096, // 16 MiB
            thread_name_prefix: "flow".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Parse a configuration from JSON.  Missing fields take their default
    /// values.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
