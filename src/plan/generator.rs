use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::PlanError, models::TrainingProgram};

use super::PlanConfig;

/// Absorbs float noise when the distance is an exact multiple of a cycle.
const CYCLE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SegmentKind {
    Work,
    Rest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IntervalSegment {
    pub name: String,
    pub kind: SegmentKind,
    pub duration_secs: u64,
    /// 1-based cycle this segment belongs to.
    pub cycle: u32,
}

/// Distance covered by one rest+work cycle at the configured paces.
pub fn distance_per_cycle_km(program: &TrainingProgram, config: &PlanConfig) -> f64 {
    let rest_hours = f64::from(program.rest_secs) / 3600.0;
    let work_hours = f64::from(program.work_secs) / 3600.0;
    config.walk_speed_kmh * rest_hours + config.run_speed_kmh * work_hours
}

fn total_secs(program: &TrainingProgram, config: &PlanConfig) -> Result<f64, PlanError> {
    program.check_plan_inputs()?;
    let cycle_secs = program.cycle_secs() as f64;
    let per_cycle_km = distance_per_cycle_km(program, config);
    if !per_cycle_km.is_finite() || per_cycle_km <= 0.0 {
        return Err(PlanError::invalid("configured paces cover no distance"));
    }
    let average_kmh = per_cycle_km / (cycle_secs / 3600.0);
    Ok(program.distance_km / average_kmh * 3600.0)
}

/// Time the whole distance takes at the time-weighted average pace.
pub fn estimated_total_time(
    program: &TrainingProgram,
    config: &PlanConfig,
) -> Result<Duration, PlanError> {
    let secs = total_secs(program, config)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| PlanError::invalid("estimated duration is out of range"))
}

pub fn cycle_count(program: &TrainingProgram, config: &PlanConfig) -> Result<u64, PlanError> {
    let secs = total_secs(program, config)?;
    let cycles = (secs / program.cycle_secs() as f64 - CYCLE_EPSILON).ceil();
    if !cycles.is_finite() || cycles > u32::MAX as f64 {
        return Err(PlanError::TooManySegments {
            count: u64::MAX,
            limit: config.max_segments,
        });
    }
    Ok((cycles as u64).max(1))
}

/// Expands a program into alternating walk/run segments, walk first.
/// Same program and config always give the same plan.
pub fn generate(
    program: &TrainingProgram,
    config: &PlanConfig,
) -> Result<Vec<IntervalSegment>, PlanError> {
    let cycles = cycle_count(program, config)?;
    let count = cycles.saturating_mul(2);
    if count > config.max_segments {
        return Err(PlanError::TooManySegments {
            count,
            limit: config.max_segments,
        });
    }

    let mut segments = Vec::with_capacity(count as usize);
    for cycle in 1..=cycles as u32 {
        segments.push(IntervalSegment {
            name: format!("Walk {cycle}"),
            kind: SegmentKind::Rest,
            duration_secs: u64::from(program.rest_secs),
            cycle,
        });
        segments.push(IntervalSegment {
            name: format!("Run {cycle}"),
            kind: SegmentKind::Work,
            duration_secs: u64::from(program.work_secs),
            cycle,
        });
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::builtin_programs;

    fn tests123() -> TrainingProgram {
        TrainingProgram::new_custom("tests123", 0.5, 10, 10)
    }

    #[test]
    fn tests123_expands_to_ten_second_segments() {
        let segments = generate(&tests123(), &PlanConfig::default()).unwrap();

        // 0.5 km at 0.0375 km per 20 s cycle rounds up to 14 cycles.
        assert_eq!(segments.len(), 28);
        assert!(segments.iter().all(|s| s.duration_secs == 10));
        assert_eq!(segments[0].name, "Walk 1");
        assert_eq!(segments[0].kind, SegmentKind::Rest);
        assert_eq!(segments[1].name, "Run 1");
        assert_eq!(segments[1].kind, SegmentKind::Work);
        assert_eq!(segments[27].name, "Run 14");
        assert_eq!(segments[27].cycle, 14);
    }

    #[test]
    fn generation_is_deterministic() {
        let config = PlanConfig::default();
        for program in builtin_programs() {
            assert_eq!(
                generate(&program, &config).unwrap(),
                generate(&program, &config).unwrap()
            );
        }
    }

    #[test]
    fn tiny_distance_still_yields_one_cycle() {
        let program = TrainingProgram::new_custom("Blip", 0.001, 60, 60);
        let segments = generate(&program, &PlanConfig::default()).unwrap();
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn exact_multiple_does_not_round_up() {
        let program = TrainingProgram::new_custom("Exact", 0.075, 10, 10);
        assert_eq!(cycle_count(&program, &PlanConfig::default()).unwrap(), 2);
    }

    #[test]
    fn zero_cycle_time_is_an_error() {
        let mut program = tests123();
        program.work_secs = 0;
        program.rest_secs = 0;
        assert!(matches!(
            generate(&program, &PlanConfig::default()),
            Err(PlanError::InvalidProgram { .. })
        ));
    }

    #[test]
    fn non_positive_distance_is_an_error() {
        let mut program = tests123();
        program.distance_km = -3.0;
        assert!(generate(&program, &PlanConfig::default()).is_err());
    }

    #[test]
    fn oversized_plan_is_rejected() {
        let program = TrainingProgram::new_custom("Ultra", 5000.0, 1, 1);
        assert!(matches!(
            generate(&program, &PlanConfig::default()),
            Err(PlanError::TooManySegments { limit: 2000, .. })
        ));
    }

    #[test]
    fn absurd_distance_is_rejected_instead_of_overflowing() {
        let program = TrainingProgram::new_custom("Huge", 1e18, 10, 10);
        program.validate().unwrap();
        assert!(matches!(
            generate(&program, &PlanConfig::default()),
            Err(PlanError::TooManySegments { count: u64::MAX, .. })
        ));
        assert!(matches!(
            estimated_total_time(&program, &PlanConfig::default()),
            Err(PlanError::InvalidProgram { .. })
        ));
    }

    #[test]
    fn estimated_time_uses_weighted_pace() {
        let program = TrainingProgram::new_custom("Even", 6.75, 60, 60);
        let total = estimated_total_time(&program, &PlanConfig::default()).unwrap();
        // Average of 5.0 and 8.5 km/h is 6.75 km/h, so one hour.
        assert!((total.as_secs_f64() - 3600.0).abs() < 1e-6);
    }
}
