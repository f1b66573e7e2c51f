pub mod pending;
pub mod programs;
pub mod results;
pub mod sync_meta;
