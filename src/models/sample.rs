use serde::{Deserialize, Serialize};

/// One reading from the sensor stream. Energy and distance are cumulative for
/// the session; any field may be missing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BiometricSample {
    pub heart_rate_bpm: Option<f64>,
    pub active_energy_kcal: Option<f64>,
    pub distance_m: Option<f64>,
}

impl BiometricSample {
    pub fn heart_rate(bpm: f64) -> Self {
        Self {
            heart_rate_bpm: Some(bpm),
            ..Self::default()
        }
    }

    pub fn distance(meters: f64) -> Self {
        Self {
            distance_m: Some(meters),
            ..Self::default()
        }
    }

    pub fn energy(kcal: f64) -> Self {
        Self {
            active_energy_kcal: Some(kcal),
            ..Self::default()
        }
    }
}
