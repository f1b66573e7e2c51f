use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PlanError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Difficulty {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum HeartRateZone {
    Recovery,
    Easy,
    #[default]
    Moderate,
    Hard,
    Maximum,
}

/// A run/walk program. Custom programs are the only ones that replicate;
/// built-ins ship with every device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingProgram {
    pub id: Uuid,
    pub name: String,
    pub distance_km: f64,
    /// Length of the run segment.
    pub work_secs: u32,
    /// Length of the walk segment.
    pub rest_secs: u32,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub estimated_calories: u32,
    #[serde(default)]
    pub target_zone: HeartRateZone,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub is_custom: bool,
}

impl TrainingProgram {
    pub fn new_custom(
        name: impl Into<String>,
        distance_km: f64,
        work_secs: u32,
        rest_secs: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            distance_km,
            work_secs,
            rest_secs,
            difficulty: Difficulty::default(),
            description: String::new(),
            estimated_calories: 0,
            target_zone: HeartRateZone::default(),
            created_at: now,
            modified_at: now,
            is_custom: true,
        }
    }

    pub fn cycle_secs(&self) -> u64 {
        u64::from(self.work_secs) + u64::from(self.rest_secs)
    }

    pub fn target_distance_m(&self) -> f64 {
        self.distance_km * 1000.0
    }

    /// Ordering key used when two replicas disagree about the same id.
    pub fn revision(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.created_at, self.modified_at)
    }

    /// Bumps `modified_at` for a local edit. Never moves it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.modified_at {
            self.modified_at = now;
        } else {
            self.modified_at += chrono::Duration::milliseconds(1);
        }
    }

    /// Checks the fields a plan is generated from.
    pub fn check_plan_inputs(&self) -> Result<(), PlanError> {
        if !self.distance_km.is_finite() || self.distance_km <= 0.0 {
            return Err(PlanError::invalid(format!(
                "distance must be positive, got {}",
                self.distance_km
            )));
        }
        if self.work_secs == 0 {
            return Err(PlanError::invalid("run segment must be longer than zero"));
        }
        if self.rest_secs == 0 {
            return Err(PlanError::invalid("walk segment must be longer than zero"));
        }
        Ok(())
    }

    /// Full validation applied before a program is saved or accepted from a peer.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.name.trim().is_empty() {
            return Err(PlanError::invalid("name must not be empty"));
        }
        self.check_plan_inputs()?;
        if self.modified_at < self.created_at {
            return Err(PlanError::invalid("modified_at precedes created_at"));
        }
        Ok(())
    }
}

struct BuiltIn {
    id: u128,
    name: &'static str,
    distance_km: f64,
    work_secs: u32,
    rest_secs: u32,
    difficulty: Difficulty,
    description: &'static str,
    estimated_calories: u32,
    target_zone: HeartRateZone,
}

const BUILT_INS: [BuiltIn; 6] = [
    BuiltIn {
        id: 0x5eed_0000_0000_0000_0000_0000_0000_0001,
        name: "Beginner 5K Builder",
        distance_km: 5.0,
        work_secs: 60,
        rest_secs: 120,
        difficulty: Difficulty::Beginner,
        description: "Build up to running 5K with walk breaks",
        estimated_calories: 300,
        target_zone: HeartRateZone::Easy,
    },
    BuiltIn {
        id: 0x5eed_0000_0000_0000_0000_0000_0000_0002,
        name: "HIIT Power Blast",
        distance_km: 3.0,
        work_secs: 60,
        rest_secs: 60,
        difficulty: Difficulty::Intermediate,
        description: "Short hard efforts with equal recovery",
        estimated_calories: 250,
        target_zone: HeartRateZone::Hard,
    },
    BuiltIn {
        id: 0x5eed_0000_0000_0000_0000_0000_0000_0003,
        name: "Endurance Challenge",
        distance_km: 10.0,
        work_secs: 180,
        rest_secs: 60,
        difficulty: Difficulty::Advanced,
        description: "Long runs with brief walking recovery",
        estimated_calories: 600,
        target_zone: HeartRateZone::Moderate,
    },
    BuiltIn {
        id: 0x5eed_0000_0000_0000_0000_0000_0000_0004,
        name: "Recovery Run",
        distance_km: 3.0,
        work_secs: 120,
        rest_secs: 120,
        difficulty: Difficulty::Beginner,
        description: "Easy pace for active recovery days",
        estimated_calories: 180,
        target_zone: HeartRateZone::Recovery,
    },
    BuiltIn {
        id: 0x5eed_0000_0000_0000_0000_0000_0000_0005,
        name: "Sprint Intervals",
        distance_km: 2.0,
        work_secs: 30,
        rest_secs: 90,
        difficulty: Difficulty::Advanced,
        description: "All-out sprints with long walks",
        estimated_calories: 200,
        target_zone: HeartRateZone::Maximum,
    },
    BuiltIn {
        id: 0x5eed_0000_0000_0000_0000_0000_0000_0006,
        name: "Quick Test Workout",
        distance_km: 0.1,
        work_secs: 10,
        rest_secs: 10,
        difficulty: Difficulty::Beginner,
        description: "A very short workout for trying the flow",
        estimated_calories: 10,
        target_zone: HeartRateZone::Easy,
    },
];

/// The programs every device ships with, in display order.
pub fn builtin_programs() -> Vec<TrainingProgram> {
    BUILT_INS
        .iter()
        .map(|builtin| TrainingProgram {
            id: Uuid::from_u128(builtin.id),
            name: builtin.name.to_string(),
            distance_km: builtin.distance_km,
            work_secs: builtin.work_secs,
            rest_secs: builtin.rest_secs,
            difficulty: builtin.difficulty,
            description: builtin.description.to_string(),
            estimated_calories: builtin.estimated_calories,
            target_zone: builtin.target_zone,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            modified_at: DateTime::<Utc>::UNIX_EPOCH,
            is_custom: false,
        })
        .collect()
}
