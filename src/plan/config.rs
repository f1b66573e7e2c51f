use serde::{Deserialize, Serialize};

/// Tunables for turning a program distance into a segment count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanConfig {
    /// Pace assumed during rest (walk) segments.
    pub walk_speed_kmh: f64,

    /// Pace assumed during work (run) segments.
    pub run_speed_kmh: f64,

    /// Upper bound on generated segments; longer plans are rejected.
    pub max_segments: u64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            walk_speed_kmh: 5.0,
            run_speed_kmh: 8.5,
            max_segments: 2000,
        }
    }
}
