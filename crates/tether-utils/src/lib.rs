//! # tether-utils
//!
//! Shared utilities for the tether debugger workspace, currently the
//! `tracing`-based logging infrastructure used by the CLI and the core.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel};
pub use tracing::{debug, error, info, trace, warn};
