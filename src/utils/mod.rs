pub mod logging;

pub use logging::{debug_mode, init_logging};
