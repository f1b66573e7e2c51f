pub mod clock;
pub mod controller;
pub mod state;

pub use clock::{Tick, TickFlow, WorkoutClock};
pub use controller::{ResultSink, WorkoutController, WorkoutEvent};
pub use state::{
    LiveMetrics, SegmentChange, TickOutcome, WorkoutSession, WorkoutSnapshot, WorkoutStatus,
};
