//! Run/walk interval workouts on a pair of devices, with the custom program
//! catalog and finished-session results kept in step over an unreliable link.

pub mod db;
pub mod device;
pub mod error;
pub mod models;
pub mod plan;
pub mod settings;
pub mod sync;
pub mod timer;
pub mod utils;

pub use db::Database;
pub use device::Device;
pub use error::{DecodeError, PlanError, TransportError, WorkoutError};
pub use models::{
    builtin_programs, BiometricSample, Difficulty, EndReason, HeartRateZone, SessionResult,
    TrainingProgram,
};
pub use plan::{IntervalSegment, PlanConfig, SegmentKind};
pub use settings::{DeviceSettings, SettingsStore, SyncSettings, WorkoutSettings};
pub use sync::{
    ConnectivityHealth, InMemoryLink, LinkState, ReplicationCoordinator, SyncEnvelope, SyncEvent,
    SyncTransport,
};
pub use timer::{WorkoutController, WorkoutEvent, WorkoutSnapshot, WorkoutStatus};
pub use utils::init_logging;
