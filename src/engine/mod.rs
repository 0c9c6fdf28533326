//! Background machinery: the queue runner, the stale-task watchdog and
//! retention, plus the periodic scheduler that hosts the latter two.

pub mod retention;
pub mod runner;
pub mod ticker;
pub mod watchdog;

pub use retention::Retention;
pub use runner::{RunMode, RunSummary, Runner, RunnerConfig, Step};
pub use ticker::{Periodic, Shutdown};
pub use watchdog::{ScanReport, Watchdog, WatchdogConfig};
