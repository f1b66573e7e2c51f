use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    error::WorkoutError,
    log_error, log_info, log_warn,
    models::{BiometricSample, EndReason, SessionResult, TrainingProgram},
    plan::{self, PlanConfig},
    settings::WorkoutSettings,
    utils::debug_mode,
};

use super::{
    clock::{Tick, TickFlow, WorkoutClock},
    state::{SegmentChange, WorkoutSession, WorkoutSnapshot, WorkoutStatus},
};

const ENABLE_LOGS: bool = true;
const EVENT_CAPACITY: usize = 64;

/// Receives each finished session exactly once.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn submit_result(&self, result: SessionResult) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkoutEvent {
    StateChanged { snapshot: WorkoutSnapshot },
    SegmentChanged { change: SegmentChange },
    Heartbeat { snapshot: WorkoutSnapshot },
    SessionCompleted { result: SessionResult },
    /// The session ended but the store refused its result. The result is
    /// carried so the caller can retry through the sink.
    ResultNotSaved { result: SessionResult, error: String },
}

/// Owns the live session. All state changes go through the session mutex;
/// observers follow along through `subscribe`.
#[derive(Clone)]
pub struct WorkoutController {
    session: Arc<Mutex<Option<WorkoutSession>>>,
    clock: WorkoutClock,
    sink: Arc<dyn ResultSink>,
    events: broadcast::Sender<WorkoutEvent>,
    plan: PlanConfig,
    heartbeat_every_ticks: u64,
    biometrics: Arc<Mutex<Option<CancellationToken>>>,
}

impl WorkoutController {
    pub fn new(sink: Arc<dyn ResultSink>, plan: PlanConfig, settings: &WorkoutSettings) -> Self {
        let heartbeat_every_ticks = if debug_mode() {
            1
        } else {
            u64::from(settings.heartbeat_every_ticks.max(1))
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            session: Arc::new(Mutex::new(None)),
            clock: WorkoutClock::new(Duration::from_millis(settings.tick_interval_ms.max(1))),
            sink,
            events,
            plan,
            heartbeat_every_ticks,
            biometrics: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkoutEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> WorkoutSnapshot {
        self.session
            .lock()
            .await
            .as_ref()
            .map(WorkoutSession::snapshot)
            .unwrap_or_default()
    }

    pub async fn start_workout(
        &self,
        program: TrainingProgram,
    ) -> Result<WorkoutSnapshot, WorkoutError> {
        let segments = plan::generate(&program, &self.plan)?;

        let snapshot = {
            let mut guard = self.session.lock().await;
            if guard.is_some() {
                return Err(WorkoutError::AlreadyActive);
            }
            let session = WorkoutSession::begin(program, segments, Utc::now())?;
            let snapshot = session.snapshot();
            *guard = Some(session);
            snapshot
        };

        log_info!(
            "Workout {:?} started: {} segments",
            snapshot.program_name,
            snapshot.segment_count
        );

        let controller = self.clone();
        self.clock
            .start(move |tick| {
                let controller = controller.clone();
                async move { controller.on_tick(tick).await }
            })
            .await;

        self.emit(WorkoutEvent::StateChanged {
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    pub async fn pause_workout(&self) -> Result<WorkoutSnapshot, WorkoutError> {
        let snapshot = {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or(WorkoutError::NotActive)?;
            session.pause()?;
            session.snapshot()
        };
        self.clock.pause().await;
        self.emit(WorkoutEvent::StateChanged {
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    pub async fn resume_workout(&self) -> Result<WorkoutSnapshot, WorkoutError> {
        let snapshot = {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or(WorkoutError::NotActive)?;
            session.resume()?;
            session.snapshot()
        };
        self.clock.resume().await;
        self.emit(WorkoutEvent::StateChanged {
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    pub async fn skip_segment(&self) -> Result<WorkoutSnapshot, WorkoutError> {
        let (outcome, snapshot) = {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or(WorkoutError::NotActive)?;
            let outcome = session.skip_segment()?;
            (outcome, session.snapshot())
        };

        for change in outcome.segment_changes {
            self.emit(WorkoutEvent::SegmentChanged { change });
        }

        if let Some(reason) = outcome.completed {
            if let Err(err) = self.finish(reason).await {
                log_error!("Failed to store result after final skip: {err:#}");
            }
        } else {
            self.emit(WorkoutEvent::StateChanged {
                snapshot: snapshot.clone(),
            });
        }

        Ok(snapshot)
    }

    /// Ends the workout on user request. The result is handed to the sink
    /// before this returns; a storage failure is reported here.
    pub async fn end_workout(&self) -> Result<SessionResult> {
        let elapsed = self.clock.elapsed().await;
        let outcome = {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or(WorkoutError::NotActive)?;
            session.advance(elapsed)
        };

        for change in outcome.segment_changes {
            self.emit(WorkoutEvent::SegmentChanged { change });
        }

        // A tick may have completed the session in the meantime.
        let reason = outcome.completed.unwrap_or(EndReason::EndedByUser);
        let result = self
            .finish(reason)
            .await?
            .ok_or(WorkoutError::NotActive)?;
        Ok(result)
    }

    pub async fn record_sample(&self, sample: BiometricSample) {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.record_sample(&sample);
        }
    }

    /// Feeds a sensor stream into the live session until the sender closes.
    /// Attaching a new stream detaches the previous one.
    pub async fn attach_biometrics(&self, mut samples: mpsc::Receiver<BiometricSample>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.biometrics.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    sample = samples.recv() => match sample {
                        Some(sample) => controller.record_sample(sample).await,
                        None => break,
                    },
                }
            }
        });
    }

    pub async fn detach_biometrics(&self) {
        if let Some(token) = self.biometrics.lock().await.take() {
            token.cancel();
        }
    }

    pub async fn shutdown(&self) {
        self.detach_biometrics().await;
        self.clock.stop().await;
    }

    async fn on_tick(&self, tick: Tick) -> TickFlow {
        let (outcome, snapshot) = {
            let mut guard = self.session.lock().await;
            let Some(session) = guard.as_mut() else {
                return TickFlow::Stop;
            };
            let outcome = session.advance(tick.elapsed);
            (outcome, session.snapshot())
        };

        for change in outcome.segment_changes {
            self.emit(WorkoutEvent::SegmentChanged { change });
        }

        if let Some(reason) = outcome.completed {
            if let Err(err) = self.finish(reason).await {
                log_error!("Failed to store completed workout: {err:#}");
            }
            return TickFlow::Stop;
        }

        if tick.seq % self.heartbeat_every_ticks == 0 {
            self.emit(WorkoutEvent::Heartbeat { snapshot });
        }

        TickFlow::Continue
    }

    /// Takes the session out of the controller, so whichever path gets here
    /// first produces the one and only result.
    async fn finish(&self, reason: EndReason) -> Result<Option<SessionResult>> {
        let session = {
            let mut guard = self.session.lock().await;
            let Some(session) = guard.take() else {
                return Ok(None);
            };
            // Under the lock, so a start racing in cannot lose its ticker.
            self.clock.stop().await;
            session
        };

        let mut final_snapshot = session.snapshot();
        final_snapshot.status = WorkoutStatus::Completed;
        let result = session.into_result(Utc::now(), reason);

        log_info!(
            "Workout {} completed ({:?}) after {}s, {} segments",
            result.session_id,
            result.end_reason,
            result.total_duration_secs,
            result.completed_segments
        );

        self.emit(WorkoutEvent::StateChanged {
            snapshot: final_snapshot,
        });

        let stored = self.sink.submit_result(result.clone()).await;
        match &stored {
            Ok(()) => self.emit(WorkoutEvent::SessionCompleted {
                result: result.clone(),
            }),
            Err(err) => {
                log_warn!("Result {} was not stored: {err:#}", result.session_id);
                self.emit(WorkoutEvent::ResultNotSaved {
                    result: result.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
        self.emit(WorkoutEvent::StateChanged {
            snapshot: WorkoutSnapshot::default(),
        });
        stored.context("failed to store session result")?;

        Ok(Some(result))
    }

    fn emit(&self, event: WorkoutEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use tokio::time;

    #[derive(Default)]
    struct RecordingSink {
        results: std::sync::Mutex<Vec<SessionResult>>,
        fail: bool,
    }

    impl RecordingSink {
        fn stored(&self) -> Vec<SessionResult> {
            self.results.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn submit_result(&self, result: SessionResult) -> Result<()> {
            if self.fail {
                bail!("disk full");
            }
            self.results.lock().unwrap().push(result);
            Ok(())
        }
    }

    fn controller_with(sink: Arc<RecordingSink>) -> WorkoutController {
        WorkoutController::new(sink, PlanConfig::default(), &WorkoutSettings::default())
    }

    fn tests123() -> TrainingProgram {
        TrainingProgram::new_custom("tests123", 0.5, 10, 10)
    }

    fn drain(rx: &mut broadcast::Receiver<WorkoutEvent>) -> Vec<WorkoutEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_five_seconds_on_the_real_clock() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller_with(sink.clone());
        let mut events = controller.subscribe();

        controller.start_workout(tests123()).await.unwrap();
        time::sleep(Duration::from_millis(25_500)).await;

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.status, WorkoutStatus::Active);
        assert_eq!(snapshot.completed_cycles, 1);
        assert_eq!(snapshot.current_cycle, Some(2));
        assert_eq!(snapshot.segment_elapsed_secs, 5);
        assert!(sink.stored().is_empty());

        let events = drain(&mut events);
        let changes = events
            .iter()
            .filter(|e| matches!(e, WorkoutEvent::SegmentChanged { .. }))
            .count();
        let heartbeats = events
            .iter()
            .filter(|e| matches!(e, WorkoutEvent::Heartbeat { .. }))
            .count();
        assert_eq!(changes, 2);
        assert!(heartbeats >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ending_twice_yields_one_result() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller_with(sink.clone());

        controller.start_workout(tests123()).await.unwrap();
        time::sleep(Duration::from_millis(3_200)).await;

        let result = controller.end_workout().await.unwrap();
        assert_eq!(result.end_reason, EndReason::EndedByUser);
        assert_eq!(result.total_duration_secs, 3);

        let second = controller.end_workout().await.unwrap_err();
        assert_eq!(
            second.downcast_ref::<WorkoutError>(),
            Some(&WorkoutError::NotActive)
        );
        assert_eq!(sink.stored().len(), 1);
        assert_eq!(controller.snapshot().await.status, WorkoutStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn distance_goal_completes_on_next_tick() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller_with(sink.clone());
        let (tx, rx) = mpsc::channel(8);
        controller.attach_biometrics(rx).await;

        controller.start_workout(tests123()).await.unwrap();
        time::sleep(Duration::from_millis(2_500)).await;
        tx.send(BiometricSample::distance(510.0)).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;

        let stored = sink.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].end_reason, EndReason::GoalReached);
        assert_eq!(stored[0].distance_m, 510.0);
        assert_eq!(controller.snapshot().await, WorkoutSnapshot::default());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.stored().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consuming_every_segment_completes() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller_with(sink.clone());
        let mut events = controller.subscribe();

        let program = TrainingProgram::new_custom("Blip", 0.001, 5, 5);
        controller.start_workout(program).await.unwrap();
        time::sleep(Duration::from_secs(12)).await;

        let stored = sink.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].end_reason, EndReason::SegmentsExhausted);
        assert_eq!(stored[0].completed_segments, 2);

        let completed = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, WorkoutEvent::SessionCompleted { .. }))
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_the_countdown() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller_with(sink);

        controller.start_workout(tests123()).await.unwrap();
        time::sleep(Duration::from_millis(4_500)).await;
        controller.pause_workout().await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(controller.snapshot().await.remaining_secs, 6);

        controller.resume_workout().await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.snapshot().await.remaining_secs, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_second_start_and_bad_programs() {
        let controller = controller_with(Arc::new(RecordingSink::default()));

        let mut broken = tests123();
        broken.work_secs = 0;
        assert!(matches!(
            controller.start_workout(broken).await,
            Err(WorkoutError::Plan(_))
        ));

        controller.start_workout(tests123()).await.unwrap();
        assert_eq!(
            controller.start_workout(tests123()).await.unwrap_err(),
            WorkoutError::AlreadyActive
        );
        assert_eq!(
            controller.resume_workout().await.unwrap_err(),
            WorkoutError::NotPaused
        );
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_is_reported_and_session_still_ends() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let controller = controller_with(sink);

        controller.start_workout(tests123()).await.unwrap();
        time::sleep(Duration::from_millis(1_500)).await;

        assert!(controller.end_workout().await.is_err());
        assert_eq!(controller.snapshot().await.status, WorkoutStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unsaved_result_on_tick_completion_reaches_observers() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let controller = controller_with(sink);
        let mut events = controller.subscribe();

        let program = TrainingProgram::new_custom("Blip", 0.001, 5, 5);
        controller.start_workout(program).await.unwrap();
        time::sleep(Duration::from_secs(12)).await;

        let events = drain(&mut events);
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkoutEvent::SessionCompleted { .. })));
        let unsaved: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkoutEvent::ResultNotSaved { result, error } => Some((result, error)),
                _ => None,
            })
            .collect();
        assert_eq!(unsaved.len(), 1);
        assert_eq!(unsaved[0].0.end_reason, EndReason::SegmentsExhausted);
        assert!(unsaved[0].1.contains("disk full"));
        assert_eq!(controller.snapshot().await.status, WorkoutStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn ending_after_the_goal_between_ticks_reports_goal_reached() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller_with(sink.clone());

        controller.start_workout(tests123()).await.unwrap();
        time::sleep(Duration::from_millis(2_500)).await;
        controller
            .record_sample(BiometricSample::distance(510.0))
            .await;

        let result = controller.end_workout().await.unwrap();
        assert_eq!(result.end_reason, EndReason::GoalReached);
        assert_eq!(sink.stored(), vec![result]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_workout_keeps_ticking_after_the_previous_one_ends() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller_with(sink.clone());

        controller.start_workout(tests123()).await.unwrap();
        time::sleep(Duration::from_millis(1_500)).await;
        let ended = controller.clone();
        let (finished, restarted) = tokio::join!(ended.end_workout(), async {
            tokio::task::yield_now().await;
            loop {
                match controller.start_workout(tests123()).await {
                    Err(WorkoutError::AlreadyActive) => tokio::task::yield_now().await,
                    other => break other,
                }
            }
        });
        finished.unwrap();
        restarted.unwrap();

        time::sleep(Duration::from_millis(3_200)).await;
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.status, WorkoutStatus::Active);
        assert_eq!(snapshot.segment_elapsed_secs, 3);
        assert!(controller.clock.has_live_ticker().await);
    }
}
