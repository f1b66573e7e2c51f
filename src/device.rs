use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use log::info;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    db::Database,
    models::{builtin_programs, TrainingProgram},
    settings::{DeviceSettings, SettingsStore},
    sync::{Inbound, ReplicationCoordinator, SyncTransport},
    timer::{WorkoutController, WorkoutSnapshot},
};

const DB_FILE: &str = "runwalk.sqlite3";
const SETTINGS_FILE: &str = "settings.json";

/// One side of the pair: local store, replication and the workout engine,
/// wired so that every finished session is handed to replication.
pub struct Device {
    db: Database,
    settings: Arc<SettingsStore>,
    sync: ReplicationCoordinator,
    workout: WorkoutController,
}

impl Device {
    /// Opens (or creates) the device state under `data_dir`.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        transport: Arc<dyn SyncTransport>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let db = Database::new(data_dir.join(DB_FILE))?;
        let settings = SettingsStore::new(data_dir.join(SETTINGS_FILE))?;
        Self::assemble(db, Arc::new(settings), transport, inbound).await
    }

    pub async fn open_in_memory(
        transport: Arc<dyn SyncTransport>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        settings: DeviceSettings,
    ) -> Result<Self> {
        let db = Database::open_in_memory()?;
        let settings = SettingsStore::in_memory(settings);
        Self::assemble(db, Arc::new(settings), transport, inbound).await
    }

    async fn assemble(
        db: Database,
        settings: Arc<SettingsStore>,
        transport: Arc<dyn SyncTransport>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Result<Self> {
        let current = settings.current();

        let sync = ReplicationCoordinator::new(db.clone(), transport, current.sync).await?;
        sync.start(inbound).await;

        let workout = WorkoutController::new(Arc::new(sync.clone()), current.plan, &current.workout);

        info!("Device ready");
        Ok(Self {
            db,
            settings,
            sync,
            workout,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn sync(&self) -> &ReplicationCoordinator {
        &self.sync
    }

    pub fn workout(&self) -> &WorkoutController {
        &self.workout
    }

    /// Built-ins first, then custom programs in creation order.
    pub async fn catalog(&self) -> Result<Vec<TrainingProgram>> {
        let mut catalog = builtin_programs();
        catalog.extend(self.db.load_programs().await?);
        Ok(catalog)
    }

    pub async fn find_program(&self, id: Uuid) -> Result<Option<TrainingProgram>> {
        if let Some(builtin) = builtin_programs().into_iter().find(|program| program.id == id) {
            return Ok(Some(builtin));
        }
        self.db.get_program(id).await
    }

    /// Looks a program up in the catalog and starts a workout on it.
    pub async fn start_program(&self, id: Uuid) -> Result<WorkoutSnapshot> {
        let program = self
            .find_program(id)
            .await?
            .with_context(|| format!("no program with id {id}"))?;
        Ok(self.workout.start_workout(program).await?)
    }

    pub async fn shutdown(&self) {
        self.workout.shutdown().await;
        self.sync.shutdown().await;
        info!("Device shut down");
    }
}
