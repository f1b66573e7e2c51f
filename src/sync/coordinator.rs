use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    db::Database,
    error::{DecodeError, PlanError, TransportError},
    log_debug, log_error, log_info, log_warn,
    models::{SessionResult, TrainingProgram},
    settings::SyncSettings,
    timer::ResultSink,
};

use super::{
    envelope::{ProgramDeletion, ReplyStatus, StateSnapshot, SyncAction, SyncEnvelope, SyncReply},
    health::ConnectivityHealth,
    merge::MergeSummary,
    retry::{RetryDecision, RetryQueue},
    transport::{Inbound, LinkState, SyncTransport},
};

const ENABLE_LOGS: bool = true;
const EVENT_CAPACITY: usize = 128;

fn program_key(id: Uuid) -> String {
    format!("program:{id}")
}

fn result_key(id: Uuid) -> String {
    format!("result:{id}")
}

const CATALOG_KEY: &str = "catalog";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    ProgramsMerged { summary: MergeSummary },
    ProgramDeleted { id: Uuid, removed: bool },
    ResultsStored { inserted: usize },
    EnvelopeDropped { action: SyncAction, reason: String },
    Delivered { item_key: String },
    RetryScheduled { item_key: String, delay_ms: u64 },
    RetryExhausted { item_key: String },
    HealthChanged { health: ConnectivityHealth },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Message,
    Transfer,
    Context,
}

#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

struct CoordinatorState {
    retry: RetryQueue,
    consecutive_failures: u32,
    last_sync_at: Option<DateTime<Utc>>,
}

struct Workers {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Keeps the custom catalog and the result log converging with the peer.
///
/// Local storage is written first and its errors are returned; transport
/// trouble is logged, counted and retried, never returned.
#[derive(Clone)]
pub struct ReplicationCoordinator {
    db: Database,
    transport: Arc<dyn SyncTransport>,
    settings: SyncSettings,
    state: Arc<Mutex<CoordinatorState>>,
    health: Arc<watch::Sender<ConnectivityHealth>>,
    events: broadcast::Sender<SyncEvent>,
    workers: Arc<Mutex<Option<Workers>>>,
}

impl ReplicationCoordinator {
    /// Restores last-sync time and any unacknowledged sends from storage.
    pub async fn new(
        db: Database,
        transport: Arc<dyn SyncTransport>,
        settings: SyncSettings,
    ) -> Result<Self> {
        let last_sync_at = db
            .last_sync_at()
            .await
            .context("failed to load last sync time")?;
        let pending = db
            .load_pending()
            .await
            .context("failed to load pending operations")?;

        let mut retry = RetryQueue::new(settings.backoff_policy());
        let now = Instant::now();
        let restored = pending.len();
        for record in pending {
            retry.restore(record, now);
        }
        if restored > 0 {
            log_info!("Restored {restored} pending sync operations");
        }

        let health = ConnectivityHealth::evaluate(
            transport.link_state(),
            0,
            last_sync_at,
            Utc::now(),
            settings.stale_after(),
        );
        let (health_tx, _) = watch::channel(health);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            db,
            transport,
            settings,
            state: Arc::new(Mutex::new(CoordinatorState {
                retry,
                consecutive_failures: 0,
                last_sync_at,
            })),
            health: Arc::new(health_tx),
            events,
            workers: Arc::new(Mutex::new(None)),
        })
    }

    /// Spawns the inbound loop and the retry scheduler. Starting again
    /// replaces the previous loops.
    pub async fn start(&self, inbound: mpsc::UnboundedReceiver<Inbound>) {
        let mut workers = self.workers.lock().await;
        if let Some(previous) = workers.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(self.clone().inbound_loop(inbound, cancel.clone())),
            tokio::spawn(self.clone().scheduler_loop(cancel.clone())),
        ];
        *workers = Some(Workers { handles, cancel });
        log_info!("Replication coordinator started");
    }

    pub async fn shutdown(&self) {
        if let Some(workers) = self.workers.lock().await.take() {
            workers.cancel.cancel();
            for handle in workers.handles {
                let _ = handle.await;
            }
            log_info!("Replication coordinator stopped");
        }
    }

    async fn inbound_loop(self, mut inbound: mpsc::UnboundedReceiver<Inbound>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => self.handle_inbound(message).await,
                    None => {
                        log_warn!("Inbound link closed");
                        break;
                    }
                },
            }
        }
    }

    /// Single timer for every pending retry, plus reachability pushes.
    async fn scheduler_loop(self, cancel: CancellationToken) {
        let mut link = self.transport.watch_link();
        let mut link_open = true;
        let mut retry_tick = time::interval(self.settings.retry_poll_interval());
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = link.changed(), if link_open => {
                    if changed.is_err() {
                        link_open = false;
                        continue;
                    }
                    let state = *link.borrow_and_update();
                    self.on_link_changed(state).await;
                }
                _ = retry_tick.tick() => self.process_due_retries().await,
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn health(&self) -> ConnectivityHealth {
        *self.health.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<ConnectivityHealth> {
        self.health.subscribe()
    }

    pub async fn pending_operations(&self) -> usize {
        self.state.lock().await.retry.len()
    }

    pub async fn exhausted_operations(&self) -> usize {
        self.state.lock().await.retry.exhausted_count()
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    pub async fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_sync_at
    }

    pub async fn programs(&self) -> Result<Vec<TrainingProgram>> {
        self.db.load_programs().await
    }

    pub async fn results(&self) -> Result<Vec<SessionResult>> {
        self.db.load_results().await
    }

    /// Creates or edits a custom program, then replicates it.
    pub async fn save_program(&self, program: TrainingProgram) -> Result<TrainingProgram> {
        if !program.is_custom {
            return Err(PlanError::invalid("built-in programs are read-only").into());
        }

        let mut program = program;
        if let Some(existing) = self.db.get_program(program.id).await? {
            program.created_at = existing.created_at;
            program.modified_at = program.modified_at.max(existing.modified_at);
            program.touch(Utc::now());
        } else if let Some(deleted_at) = self.db.program_tombstone(program.id).await? {
            // Restoring a deleted program must outrank the peer's tombstone.
            program.modified_at = program.modified_at.max(deleted_at);
            program.touch(Utc::now());
        }
        program.validate()?;

        let inserted = self
            .db
            .save_program(&program)
            .await
            .context("failed to save program locally")?;

        let action = if inserted {
            SyncAction::CustomWorkoutCreated
        } else {
            SyncAction::CustomWorkoutUpdated
        };
        let envelope = SyncEnvelope::encode(action, &program).context("failed to encode program")?;
        self.replicate(program_key(program.id), envelope).await;

        Ok(program)
    }

    /// Deletes a custom program. Returns false when there was nothing to delete.
    pub async fn delete_program(&self, id: Uuid) -> Result<bool> {
        let Some(existing) = self.db.get_program(id).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let deleted_at = if now > existing.modified_at {
            now
        } else {
            existing.modified_at + chrono::Duration::milliseconds(1)
        };
        let removed = self
            .db
            .apply_deletion(id, deleted_at)
            .await
            .context("failed to delete program locally")?;

        let envelope = SyncEnvelope::encode(
            SyncAction::CustomWorkoutDeleted,
            &ProgramDeletion { id, deleted_at },
        )
        .context("failed to encode deletion")?;
        self.replicate(program_key(id), envelope).await;

        Ok(removed)
    }

    /// Stores a finished session and replicates it. A result already on
    /// record is not sent again; returns whether it was new.
    pub async fn record_result(&self, result: SessionResult) -> Result<bool> {
        result
            .validate()
            .map_err(anyhow::Error::msg)
            .context("refusing to store invalid result")?;

        let inserted = self
            .db
            .insert_result(&result)
            .await
            .context("failed to store session result")?;
        if !inserted {
            log_debug!("Result {} already stored", result.session_id);
            return Ok(false);
        }

        let envelope = SyncEnvelope::encode(SyncAction::WorkoutResults, &result)
            .context("failed to encode session result")?;
        self.replicate(result_key(result.session_id), envelope).await;

        Ok(true)
    }

    /// Pushes the whole custom catalog. Returns how many programs were sent.
    pub async fn sync_catalog(&self) -> Result<usize> {
        let programs = self.db.load_programs().await?;
        let envelope = SyncEnvelope::encode(SyncAction::SyncAllCustomWorkouts, &programs)
            .context("failed to encode catalog")?;
        self.replicate(CATALOG_KEY.to_string(), envelope).await;
        Ok(programs.len())
    }

    /// Asks the peer for its catalog and merges the reply. `None` means the
    /// peer did not answer usefully; queued transfers will catch up later.
    pub async fn request_full_catalog(&self) -> Result<Option<MergeSummary>> {
        let envelope = SyncEnvelope::new(SyncAction::RequestCustomWorkouts, b"{}".to_vec());
        let reply = match self.send_immediate(envelope).await {
            Ok(reply) => reply,
            Err(err) => {
                log_info!("Catalog request failed ({err}); relying on queued transfers");
                self.note_transport_failure(&err).await;
                self.refresh_health().await;
                return Ok(None);
            }
        };

        let programs = match reply.decode_catalog().and_then(|programs| {
            validate_programs(&programs)?;
            Ok(programs)
        }) {
            Ok(programs) => programs,
            Err(err) => {
                self.note_decode_failure(SyncAction::RequestCustomWorkouts, &err)
                    .await;
                self.refresh_health().await;
                return Ok(None);
            }
        };

        let summary = self.merge_catalog_unchecked(programs).await?;
        self.note_success().await;
        self.refresh_health().await;
        Ok(Some(summary))
    }

    /// Round trip to the peer; an `alive` reply counts as a successful sync.
    pub async fn ping(&self) -> bool {
        let envelope = SyncEnvelope::new(SyncAction::Ping, b"{}".to_vec());
        let alive = match self.send_immediate(envelope).await {
            Ok(reply) if reply.status == ReplyStatus::Alive => {
                self.note_success().await;
                true
            }
            Ok(reply) => {
                log_warn!("Unexpected ping reply: {:?}", reply.status);
                false
            }
            Err(err) => {
                self.note_transport_failure(&err).await;
                false
            }
        };
        self.refresh_health().await;
        alive
    }

    /// Applies one delivery from the peer.
    pub async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message { envelope, reply } => {
                let answer = self.process_envelope(&envelope, Channel::Message).await;
                let _ = reply.send(answer);
            }
            Inbound::Transfer(envelope) => {
                self.process_envelope(&envelope, Channel::Transfer).await;
            }
            Inbound::Context(envelope) => {
                self.process_envelope(&envelope, Channel::Context).await;
            }
        }
        self.refresh_health().await;
    }

    async fn process_envelope(&self, envelope: &SyncEnvelope, channel: Channel) -> SyncReply {
        match self.apply_envelope(envelope, channel).await {
            Ok(reply) => {
                self.note_success().await;
                reply
            }
            Err(ApplyError::Decode(err)) => {
                self.note_decode_failure(envelope.action, &err).await;
                SyncReply::error(err.to_string())
            }
            Err(ApplyError::Storage(err)) => {
                log_error!(
                    "Failed to apply {:?} {}: {err:#}",
                    envelope.action,
                    envelope.operation_id
                );
                SyncReply::error("storage failure")
            }
        }
    }

    async fn apply_envelope(
        &self,
        envelope: &SyncEnvelope,
        channel: Channel,
    ) -> Result<SyncReply, ApplyError> {
        envelope.verify()?;

        match envelope.action {
            SyncAction::SyncPrograms | SyncAction::SyncAllCustomWorkouts => {
                let programs: Vec<TrainingProgram> = envelope.decode()?;
                validate_programs(&programs)?;
                self.merge_catalog_unchecked(programs).await?;
                Ok(SyncReply::received())
            }
            SyncAction::CustomWorkoutCreated | SyncAction::CustomWorkoutUpdated => {
                let program: TrainingProgram = envelope.decode()?;
                let programs = vec![program];
                validate_programs(&programs)?;
                self.merge_catalog_unchecked(programs).await?;
                Ok(SyncReply::received())
            }
            SyncAction::CustomWorkoutDeleted => {
                let deletion: ProgramDeletion = envelope.decode()?;
                let removed = self.db.apply_deletion(deletion.id, deletion.deleted_at).await?;
                log_info!("Peer deleted program {} (removed: {removed})", deletion.id);
                self.emit(SyncEvent::ProgramDeleted {
                    id: deletion.id,
                    removed,
                });
                Ok(SyncReply::received())
            }
            SyncAction::WorkoutResults => {
                let result: SessionResult = envelope.decode()?;
                let results = vec![result];
                validate_results(&results)?;
                self.merge_results_unchecked(results).await?;
                Ok(SyncReply::received())
            }
            SyncAction::StateSnapshot => {
                let snapshot: StateSnapshot = envelope.decode()?;
                validate_programs(&snapshot.programs)?;
                validate_results(&snapshot.results)?;
                self.merge_catalog_unchecked(snapshot.programs).await?;
                self.merge_results_unchecked(snapshot.results).await?;
                Ok(SyncReply::received())
            }
            SyncAction::RequestCustomWorkouts if channel == Channel::Message => {
                let programs = self.db.load_programs().await?;
                let reply = SyncReply::catalog(&programs).context("failed to encode catalog reply")?;
                Ok(reply)
            }
            SyncAction::Ping if channel == Channel::Message => Ok(SyncReply::alive()),
            SyncAction::RequestCustomWorkouts | SyncAction::Ping => {
                Err(DecodeError::UnexpectedAction.into())
            }
        }
    }

    async fn merge_catalog_unchecked(&self, programs: Vec<TrainingProgram>) -> Result<MergeSummary> {
        if programs.is_empty() {
            return Ok(MergeSummary::default());
        }
        let summary = self.db.merge_programs(programs).await?;
        if summary.changed() > 0 {
            log_info!(
                "Merged peer catalog: {} inserted, {} replaced",
                summary.inserted,
                summary.replaced
            );
        }
        self.emit(SyncEvent::ProgramsMerged { summary });
        Ok(summary)
    }

    async fn merge_results_unchecked(&self, results: Vec<SessionResult>) -> Result<usize> {
        if results.is_empty() {
            return Ok(0);
        }
        let inserted = self.db.merge_results(results).await?;
        if inserted > 0 {
            log_info!("Stored {inserted} results from peer");
        }
        self.emit(SyncEvent::ResultsStored { inserted });
        Ok(inserted)
    }

    /// Immediate send, then queued transfer, then context snapshot. A failed
    /// immediate send is handed to the retry queue.
    async fn replicate(&self, item_key: String, envelope: SyncEnvelope) {
        match self.send_immediate(envelope.clone()).await {
            Ok(_) => {
                let cleared = self.state.lock().await.retry.clear_item(&item_key);
                if cleared.is_some() {
                    if let Err(err) = self.db.delete_pending_for_item(&item_key).await {
                        log_error!("Failed to clear pending record for {item_key}: {err:#}");
                    }
                }
                self.note_success().await;
                log_debug!("{item_key} acknowledged by peer");
                self.emit(SyncEvent::Delivered {
                    item_key: item_key.clone(),
                });
            }
            Err(err) => {
                log_info!("Immediate send of {item_key} failed ({err}); will retry");
                self.note_transport_failure(&err).await;
                let (record, delay) = {
                    let mut state = self.state.lock().await;
                    let record = state.retry.track(&item_key, envelope.clone(), Instant::now());
                    (record, state.retry.policy().delay_for(1))
                };
                if let Err(err) = self.db.save_pending(vec![record]).await {
                    log_error!("Failed to persist pending record for {item_key}: {err:#}");
                }
                self.emit(SyncEvent::RetryScheduled {
                    item_key: item_key.clone(),
                    delay_ms: delay.as_millis() as u64,
                });
            }
        }

        if let Err(err) = self.transport.transfer(envelope).await {
            log_warn!("Queued transfer of {item_key} failed: {err}");
            self.note_transport_failure(&err).await;
        }

        self.broadcast_snapshot().await;
        self.refresh_health().await;
    }

    async fn send_immediate(&self, envelope: SyncEnvelope) -> Result<SyncReply, TransportError> {
        let reply = time::timeout(
            self.settings.reply_timeout(),
            self.transport.send_message(envelope),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        if reply.is_error() {
            return Err(TransportError::Rejected(
                reply.error.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }
        Ok(reply)
    }

    async fn broadcast_snapshot(&self) {
        let snapshot = match self.build_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log_error!("Failed to build state snapshot: {err:#}");
                return;
            }
        };
        let envelope = match SyncEnvelope::encode(SyncAction::StateSnapshot, &snapshot) {
            Ok(envelope) => envelope,
            Err(err) => {
                log_error!("Failed to encode state snapshot: {err}");
                return;
            }
        };
        if let Err(err) = self.transport.update_context(envelope).await {
            log_warn!("Context update failed: {err}");
        }
    }

    async fn build_snapshot(&self) -> Result<StateSnapshot> {
        Ok(StateSnapshot {
            programs: self.db.load_programs().await?,
            results: self
                .db
                .recent_results(self.settings.snapshot_result_limit)
                .await?,
        })
    }

    async fn on_link_changed(&self, link: LinkState) {
        log_info!(
            "Link changed: reachable={} paired={} activated={}",
            link.reachable,
            link.paired,
            link.activated
        );
        self.refresh_health().await;

        if !(link.reachable && link.activated) {
            return;
        }

        let rearmed = self.state.lock().await.retry.rearm_all(Instant::now());
        if rearmed.is_empty() {
            return;
        }
        log_info!("Peer reachable, flushing {} pending operations", rearmed.len());
        if let Err(err) = self.db.save_pending(rearmed).await {
            log_error!("Failed to persist re-armed operations: {err:#}");
        }
        self.process_due_retries().await;
    }

    async fn process_due_retries(&self) {
        let due = self.state.lock().await.retry.due(Instant::now());
        if due.is_empty() {
            self.refresh_health().await;
            return;
        }

        for record in due {
            match self.send_immediate(record.envelope.clone()).await {
                Ok(_) => {
                    let completed = self
                        .state
                        .lock()
                        .await
                        .retry
                        .complete(&record.item_key, record.operation_id);
                    if completed.is_some() {
                        if let Err(err) = self.db.delete_pending(record.operation_id).await {
                            log_error!("Failed to drop delivered record: {err:#}");
                        }
                        log_info!("{} delivered on retry", record.item_key);
                        self.emit(SyncEvent::Delivered {
                            item_key: record.item_key.clone(),
                        });
                    }
                    self.note_success().await;
                }
                Err(err) => {
                    self.note_transport_failure(&err).await;
                    let booked = self.state.lock().await.retry.record_failure(
                        &record.item_key,
                        record.operation_id,
                        Instant::now(),
                    );
                    let Some((decision, updated)) = booked else {
                        continue;
                    };
                    if let Err(err) = self.db.save_pending(vec![updated]).await {
                        log_error!("Failed to persist retry state: {err:#}");
                    }
                    match decision {
                        RetryDecision::Scheduled(delay) => {
                            log_debug!("Retrying {} in {delay:?} ({err})", record.item_key);
                            self.emit(SyncEvent::RetryScheduled {
                                item_key: record.item_key.clone(),
                                delay_ms: delay.as_millis() as u64,
                            });
                        }
                        RetryDecision::Exhausted => {
                            log_warn!(
                                "Giving up immediate delivery of {}; left to queued transfer",
                                record.item_key
                            );
                            self.emit(SyncEvent::RetryExhausted {
                                item_key: record.item_key.clone(),
                            });
                        }
                    }
                }
            }
        }

        self.refresh_health().await;
    }

    async fn note_success(&self) {
        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            state.consecutive_failures = 0;
            state.last_sync_at = Some(now);
        }
        if let Err(err) = self.db.set_last_sync_at(now).await {
            log_error!("Failed to persist last sync time: {err:#}");
        }
    }

    async fn note_transport_failure(&self, err: &TransportError) {
        // Reachability already shows up in the health score on its own.
        if matches!(err, TransportError::Unreachable) {
            return;
        }
        let failures = {
            let mut state = self.state.lock().await;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_failures
        };
        log_warn!("Transport failure #{failures}: {err}");
    }

    async fn note_decode_failure(&self, action: SyncAction, err: &DecodeError) {
        {
            let mut state = self.state.lock().await;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
        log_warn!("Dropped {action:?} envelope: {err}");
        self.emit(SyncEvent::EnvelopeDropped {
            action,
            reason: err.to_string(),
        });
    }

    async fn refresh_health(&self) {
        let (failures, last_sync_at) = {
            let state = self.state.lock().await;
            (state.consecutive_failures, state.last_sync_at)
        };
        let health = ConnectivityHealth::evaluate(
            self.transport.link_state(),
            failures,
            last_sync_at,
            Utc::now(),
            self.settings.stale_after(),
        );

        let previous = self.health.send_replace(health);
        if (previous.score - health.score).abs() > 1e-9 {
            log_info!(
                "Connectivity health {:.2} -> {:.2}",
                previous.score,
                health.score
            );
            self.emit(SyncEvent::HealthChanged { health });
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

fn validate_programs(programs: &[TrainingProgram]) -> Result<(), DecodeError> {
    for program in programs.iter().filter(|program| program.is_custom) {
        program
            .validate()
            .map_err(|err| DecodeError::InvalidEntity(format!("program {}: {err}", program.id)))?;
    }
    Ok(())
}

fn validate_results(results: &[SessionResult]) -> Result<(), DecodeError> {
    for result in results {
        result.validate().map_err(DecodeError::InvalidEntity)?;
    }
    Ok(())
}

#[async_trait]
impl ResultSink for ReplicationCoordinator {
    async fn submit_result(&self, result: SessionResult) -> Result<()> {
        self.record_result(result).await.map(|_| ())
    }
}
