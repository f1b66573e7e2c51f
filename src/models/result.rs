use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// Covered the program distance.
    GoalReached,
    /// Ran out of segments before the distance was covered.
    SegmentsExhausted,
    EndedByUser,
}

/// Summary of one finished workout. Write-once: identified by the session id,
/// never edited after it is produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    pub session_id: Uuid,
    #[serde(default)]
    pub program_id: Option<Uuid>,
    pub program_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_duration_secs: u64,
    #[serde(default)]
    pub active_energy_kcal: f64,
    #[serde(default)]
    pub average_heart_rate: Option<f64>,
    #[serde(default)]
    pub max_heart_rate: Option<f64>,
    #[serde(default)]
    pub distance_m: f64,
    pub completed_segments: u32,
    pub end_reason: EndReason,
}

impl SessionResult {
    pub fn validate(&self) -> Result<(), String> {
        if self.ended_at < self.started_at {
            return Err(format!("session {} ends before it starts", self.session_id));
        }
        let metrics = [
            ("active energy", Some(self.active_energy_kcal)),
            ("distance", Some(self.distance_m)),
            ("average heart rate", self.average_heart_rate),
            ("max heart rate", self.max_heart_rate),
        ];
        for (label, value) in metrics {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(format!("{label} is not a valid measurement: {value}"));
                }
            }
        }
        Ok(())
    }
}
