//! Shared building blocks for the scheduler workspace: configuration loading
//! and the clock every time-dependent decision reads from.

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::{ConfigError, Result};
