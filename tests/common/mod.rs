#![allow(dead_code)]

use std::{path::Path, sync::Arc, time::Duration};

use chrono::Utc;
use runwalk::{
    sync::{Endpoint, SyncTransport},
    Database, Device, DeviceSettings, EndReason, InMemoryLink, LinkState, ReplicationCoordinator,
    SessionResult, SyncSettings, TrainingProgram,
};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

/// Short timeouts and no jitter so replication settles within a test.
pub fn fast_settings() -> DeviceSettings {
    DeviceSettings {
        sync: SyncSettings {
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 200,
            max_retry_attempts: 3,
            retry_jitter: false,
            reply_timeout_ms: 200,
            retry_poll_interval_ms: 20,
            ..SyncSettings::default()
        },
        ..DeviceSettings::default()
    }
}

pub struct Pair {
    pub link: InMemoryLink,
    pub phone: Device,
    pub watch: Device,
}

pub async fn device_on(endpoint: Endpoint) -> Device {
    let transport: Arc<dyn SyncTransport> = endpoint.transport;
    Device::open_in_memory(transport, endpoint.inbound, fast_settings())
        .await
        .unwrap()
}

/// Opens an on-disk device, seeding `settings.json` with the fast settings.
pub async fn device_in(dir: &Path, endpoint: Endpoint) -> Device {
    let settings = dir.join("settings.json");
    if !settings.exists() {
        std::fs::write(&settings, serde_json::to_string(&fast_settings()).unwrap()).unwrap();
    }
    let transport: Arc<dyn SyncTransport> = endpoint.transport;
    Device::open(dir, transport, endpoint.inbound).await.unwrap()
}

pub async fn paired(initial: LinkState) -> Pair {
    let (link, a, b) = InMemoryLink::pair(initial);
    Pair {
        link,
        phone: device_on(a).await,
        watch: device_on(b).await,
    }
}

pub fn custom_program(name: &str) -> TrainingProgram {
    let mut program = TrainingProgram::new_custom(name, 3.0, 60, 90);
    program.description = format!("{name} description");
    program
}

pub fn tests123() -> TrainingProgram {
    TrainingProgram::new_custom("tests123", 0.5, 10, 10)
}

pub fn session_result(name: &str) -> SessionResult {
    let ended_at = Utc::now();
    SessionResult {
        session_id: Uuid::new_v4(),
        program_id: None,
        program_name: name.to_string(),
        started_at: ended_at - chrono::Duration::minutes(25),
        ended_at,
        total_duration_secs: 1500,
        active_energy_kcal: 180.0,
        average_heart_rate: Some(134.0),
        max_heart_rate: Some(165.0),
        distance_m: 3200.0,
        completed_segments: 10,
        end_reason: EndReason::SegmentsExhausted,
    }
}

/// Polls until `expected` results are stored or the wait runs out.
pub async fn results_eventually(db: &Database, expected: usize) -> Vec<SessionResult> {
    let deadline = Instant::now() + WAIT;
    loop {
        let results = db.load_results().await.unwrap();
        if results.len() == expected || Instant::now() >= deadline {
            return results;
        }
        sleep(POLL).await;
    }
}

/// Polls until `check` accepts the stored catalog or the wait runs out.
pub async fn programs_eventually<F>(db: &Database, check: F) -> Vec<TrainingProgram>
where
    F: Fn(&[TrainingProgram]) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let programs = db.load_programs().await.unwrap();
        if check(&programs) || Instant::now() >= deadline {
            return programs;
        }
        sleep(POLL).await;
    }
}

pub async fn pending_eventually(sync: &ReplicationCoordinator, expected: usize) -> usize {
    let deadline = Instant::now() + WAIT;
    loop {
        let pending = sync.pending_operations().await;
        if pending == expected || Instant::now() >= deadline {
            return pending;
        }
        sleep(POLL).await;
    }
}

pub async fn exhausted_eventually(sync: &ReplicationCoordinator, expected: usize) -> usize {
    let deadline = Instant::now() + WAIT;
    loop {
        let exhausted = sync.exhausted_operations().await;
        if exhausted == expected || Instant::now() >= deadline {
            return exhausted;
        }
        sleep(POLL).await;
    }
}
