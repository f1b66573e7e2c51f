//! Logger setup plus `log_*!` macros that a module can silence as a whole.
//!
//! A module opts in by declaring `const ENABLE_LOGS: bool` and importing the
//! macros from the crate root:
//!
//! ```rust,ignore
//! const ENABLE_LOGS: bool = true;
//! use crate::{log_info, log_warn};
//!
//! log_info!("retry queue has {} entries", 3);
//! ```

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

const DEBUG_ENV: &str = "RUNWALK_DEBUG";

/// `RUNWALK_DEBUG=1` (or `true`) turns on verbose logs and a per-tick heartbeat.
pub fn debug_mode() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Installs `env_logger`, honouring `RUST_LOG`. Later calls are no-ops.
pub fn init_logging() {
    let level = if debug_mode() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    if env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init()
        .is_ok()
    {
        log::info!("Logging initialised at {level}");
    }
}
