use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::WorkoutError,
    models::{BiometricSample, EndReason, SessionResult, TrainingProgram},
    plan::{IntervalSegment, SegmentKind},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum WorkoutStatus {
    #[default]
    Idle,
    Active,
    Paused,
    Completed,
}

/// Emitted whenever the current segment changes; drives the haptic cue.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentChange {
    pub from_index: usize,
    pub to_index: usize,
    pub name: String,
    pub kind: SegmentKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub segment_changes: Vec<SegmentChange>,
    pub completed: Option<EndReason>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveMetrics {
    pub heart_rate_bpm: Option<f64>,
    pub average_heart_rate: Option<f64>,
    pub max_heart_rate: Option<f64>,
    pub active_energy_kcal: f64,
    pub distance_m: f64,
    #[serde(skip)]
    heart_rate_sum: f64,
    #[serde(skip)]
    heart_rate_count: u64,
}

fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

impl LiveMetrics {
    fn apply(&mut self, sample: &BiometricSample) {
        if let Some(bpm) = usable(sample.heart_rate_bpm) {
            self.heart_rate_bpm = Some(bpm);
            self.heart_rate_sum += bpm;
            self.heart_rate_count += 1;
            self.average_heart_rate = Some(self.heart_rate_sum / self.heart_rate_count as f64);
            self.max_heart_rate = Some(self.max_heart_rate.map_or(bpm, |max| max.max(bpm)));
        }
        // Energy and distance are cumulative, keep them monotonic.
        if let Some(kcal) = usable(sample.active_energy_kcal) {
            self.active_energy_kcal = self.active_energy_kcal.max(kcal);
        }
        if let Some(meters) = usable(sample.distance_m) {
            self.distance_m = self.distance_m.max(meters);
        }
    }
}

/// What observers see of the live workout.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutSnapshot {
    pub status: WorkoutStatus,
    pub session_id: Option<Uuid>,
    pub program_name: Option<String>,
    pub segment_index: usize,
    pub segment_count: usize,
    pub segment_name: Option<String>,
    pub segment_kind: Option<SegmentKind>,
    pub current_cycle: Option<u32>,
    pub remaining_secs: u64,
    pub segment_elapsed_secs: u64,
    pub elapsed_secs: u64,
    pub completed_segments: u32,
    pub completed_cycles: u32,
    pub target_distance_m: f64,
    pub distance_progress: f64,
    pub overall_progress: f64,
    pub metrics: LiveMetrics,
}

/// Pure interval state machine. Time only enters through `advance`, so the
/// same elapsed sequence always produces the same transitions.
#[derive(Debug, Clone)]
pub struct WorkoutSession {
    session_id: Uuid,
    program: TrainingProgram,
    segments: Vec<IntervalSegment>,
    index: usize,
    remaining_secs: u64,
    elapsed: Duration,
    /// Whole seconds of `elapsed` already applied to the countdown.
    counted_secs: u64,
    completed_segments: u32,
    status: WorkoutStatus,
    started_at: DateTime<Utc>,
    metrics: LiveMetrics,
}

impl WorkoutSession {
    pub fn begin(
        program: TrainingProgram,
        segments: Vec<IntervalSegment>,
        started_at: DateTime<Utc>,
    ) -> Result<Self, WorkoutError> {
        let first = segments.first().ok_or_else(|| {
            WorkoutError::Plan(crate::error::PlanError::invalid("plan has no segments"))
        })?;
        let remaining_secs = first.duration_secs;

        Ok(Self {
            session_id: Uuid::new_v4(),
            program,
            segments,
            index: 0,
            remaining_secs,
            elapsed: Duration::ZERO,
            counted_secs: 0,
            completed_segments: 0,
            status: WorkoutStatus::Active,
            started_at,
            metrics: LiveMetrics::default(),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> WorkoutStatus {
        self.status
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn current_segment(&self) -> Option<&IntervalSegment> {
        self.segments.get(self.index)
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    pub fn completed_segments(&self) -> u32 {
        self.completed_segments
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }

    pub fn pause(&mut self) -> Result<(), WorkoutError> {
        match self.status {
            WorkoutStatus::Active => {
                self.status = WorkoutStatus::Paused;
                Ok(())
            }
            WorkoutStatus::Paused => Err(WorkoutError::AlreadyPaused),
            _ => Err(WorkoutError::NotActive),
        }
    }

    pub fn resume(&mut self) -> Result<(), WorkoutError> {
        match self.status {
            WorkoutStatus::Paused => {
                self.status = WorkoutStatus::Active;
                Ok(())
            }
            WorkoutStatus::Active => Err(WorkoutError::NotPaused),
            _ => Err(WorkoutError::NotActive),
        }
    }

    pub fn record_sample(&mut self, sample: &BiometricSample) {
        if matches!(self.status, WorkoutStatus::Active | WorkoutStatus::Paused) {
            self.metrics.apply(sample);
        }
    }

    pub fn goal_reached(&self) -> bool {
        self.metrics.distance_m >= self.program.target_distance_m()
    }

    /// Applies one clock tick carrying the total active time so far.
    ///
    /// The distance goal is checked before the countdown. A late tick consumes
    /// every whole second it covers, so no time is lost to scheduler delay.
    pub fn advance(&mut self, elapsed: Duration) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.status != WorkoutStatus::Active {
            return outcome;
        }

        if elapsed > self.elapsed {
            self.elapsed = elapsed;
        }

        if self.goal_reached() {
            self.status = WorkoutStatus::Completed;
            outcome.completed = Some(EndReason::GoalReached);
            return outcome;
        }

        let whole_secs = self.elapsed.as_secs();
        while self.counted_secs < whole_secs {
            self.counted_secs += 1;
            self.remaining_secs = self.remaining_secs.saturating_sub(1);
            if self.remaining_secs > 0 {
                continue;
            }
            match self.move_to_next_segment() {
                Some(change) => outcome.segment_changes.push(change),
                None => {
                    outcome.completed = Some(EndReason::SegmentsExhausted);
                    break;
                }
            }
        }

        outcome
    }

    /// Ends the current segment early.
    pub fn skip_segment(&mut self) -> Result<TickOutcome, WorkoutError> {
        if !matches!(self.status, WorkoutStatus::Active | WorkoutStatus::Paused) {
            return Err(WorkoutError::NotActive);
        }

        let mut outcome = TickOutcome::default();
        match self.move_to_next_segment() {
            Some(change) => outcome.segment_changes.push(change),
            None => outcome.completed = Some(EndReason::SegmentsExhausted),
        }
        Ok(outcome)
    }

    fn move_to_next_segment(&mut self) -> Option<SegmentChange> {
        self.completed_segments += 1;
        let from_index = self.index;
        let next_index = from_index + 1;

        match self.segments.get(next_index) {
            Some(next) => {
                self.index = next_index;
                self.remaining_secs = next.duration_secs;
                Some(SegmentChange {
                    from_index,
                    to_index: next_index,
                    name: next.name.clone(),
                    kind: next.kind,
                })
            }
            None => {
                self.remaining_secs = 0;
                self.status = WorkoutStatus::Completed;
                None
            }
        }
    }

    pub fn distance_progress(&self) -> f64 {
        let target = self.program.target_distance_m();
        if target <= 0.0 {
            return 0.0;
        }
        (self.metrics.distance_m / target).clamp(0.0, 1.0)
    }

    pub fn overall_progress(&self) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        (f64::from(self.completed_segments) / self.segments.len() as f64).clamp(0.0, 1.0)
    }

    pub fn snapshot(&self) -> WorkoutSnapshot {
        let segment = self.current_segment();
        let segment_duration = segment.map_or(0, |s| s.duration_secs);

        WorkoutSnapshot {
            status: self.status,
            session_id: Some(self.session_id),
            program_name: Some(self.program.name.clone()),
            segment_index: self.index,
            segment_count: self.segments.len(),
            segment_name: segment.map(|s| s.name.clone()),
            segment_kind: segment.map(|s| s.kind),
            current_cycle: segment.map(|s| s.cycle),
            remaining_secs: self.remaining_secs,
            segment_elapsed_secs: segment_duration.saturating_sub(self.remaining_secs),
            elapsed_secs: self.elapsed.as_secs(),
            completed_segments: self.completed_segments,
            completed_cycles: self.completed_segments / 2,
            target_distance_m: self.program.target_distance_m(),
            distance_progress: self.distance_progress(),
            overall_progress: self.overall_progress(),
            metrics: self.metrics.clone(),
        }
    }

    /// Consumes the session into its write-once result.
    pub fn into_result(self, ended_at: DateTime<Utc>, reason: EndReason) -> SessionResult {
        let ended_at = ended_at.max(self.started_at);
        SessionResult {
            session_id: self.session_id,
            program_id: Some(self.program.id),
            program_name: self.program.name,
            started_at: self.started_at,
            ended_at,
            total_duration_secs: self.elapsed.as_secs(),
            active_energy_kcal: self.metrics.active_energy_kcal,
            average_heart_rate: self.metrics.average_heart_rate,
            max_heart_rate: self.metrics.max_heart_rate,
            distance_m: self.metrics.distance_m,
            completed_segments: self.completed_segments,
            end_reason: reason,
        }
    }
}
