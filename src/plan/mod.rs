mod config;
mod generator;

pub use config::PlanConfig;
pub use generator::{
    cycle_count, distance_per_cycle_km, estimated_total_time, generate, IntervalSegment,
    SegmentKind,
};
