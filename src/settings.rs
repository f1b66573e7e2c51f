use std::{
    fs,
    path::PathBuf,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{plan::PlanConfig, sync::retry::BackoffPolicy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_retry_attempts: u32,
    pub retry_jitter: bool,
    pub reply_timeout_ms: u64,
    pub retry_poll_interval_ms: u64,
    pub stale_sync_after_secs: u64,
    /// Results carried in each context snapshot.
    pub snapshot_result_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 30_000,
            max_retry_attempts: 5,
            retry_jitter: true,
            reply_timeout_ms: 3_000,
            retry_poll_interval_ms: 500,
            stale_sync_after_secs: 300,
            snapshot_result_limit: 50,
        }
    }
}

impl SyncSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.retry_base_delay_ms),
            max: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms)),
            max_attempts: self.max_retry_attempts,
            jitter: self.retry_jitter,
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.retry_poll_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_sync_after_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkoutSettings {
    pub tick_interval_ms: u64,
    pub heartbeat_every_ticks: u32,
}

impl Default for WorkoutSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            heartbeat_every_ticks: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    pub sync: SyncSettings,
    pub plan: PlanConfig,
    pub workout: WorkoutSettings,
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<DeviceSettings>,
}

impl SettingsStore {
    /// Loads `path`, falling back to defaults when it is missing or unreadable.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring unreadable settings at {}: {err}", path.display());
                DeviceSettings::default()
            })
        } else {
            DeviceSettings::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory(settings: DeviceSettings) -> Self {
        Self {
            path: None,
            data: RwLock::new(settings),
        }
    }

    pub fn current(&self) -> DeviceSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<F>(&self, change: F) -> Result<DeviceSettings>
    where
        F: FnOnce(&mut DeviceSettings),
    {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        change(&mut next);
        self.persist(&next)?;
        *guard = next.clone();
        Ok(next)
    }

    fn persist(&self, data: &DeviceSettings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }
}
