pub mod program;
pub mod result;
pub mod sample;

pub use program::{builtin_programs, Difficulty, HeartRateZone, TrainingProgram};
pub use result::{EndReason, SessionResult};
pub use sample::BiometricSample;
