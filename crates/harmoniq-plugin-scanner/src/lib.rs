//! Out-of-process plugin scanning for Harmoniq.
//!
//! Probing a plugin runs third party code, so it never happens in the host.
//! A [`ScannerMaster`] launches the host executable again in worker mode
//! ([`WORKER_MODE_ID`]), where a [`ScannerSlave`] probes candidates one by
//! one and persists its findings after each of them. When a plugin takes
//! the worker down the master relaunches it and the scan resumes where it
//! stopped, with the offending file blacklisted.
//!
//! [`PluginScanner`] is the entry point for hosts.

mod config;
pub mod fake;
mod master;
mod protocol;
mod scanner;
mod slave;
mod transport;
mod updater;

pub use config::*;
pub use master::*;
pub use protocol::*;
pub use scanner::*;
pub use slave::*;
pub use transport::*;
pub use updater::*;

use tracing_subscriber::EnvFilter;

/// Installs the log subscriber. Output goes to stderr because a worker's
/// stdout is its channel to the master.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}
