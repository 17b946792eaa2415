//! Command implementations for the CLI.

mod clear;
mod history;
mod scan;
mod watch;

pub use clear::cmd_clear;
pub use history::cmd_history;
pub use scan::cmd_scan;
pub use watch::{WatchArgs, cmd_watch};
