//! Scanner executable that only knows the fake test format. Used by the
//! integration tests as the worker binary.

use anyhow::{bail, Result};
use harmoniq_plugin_scanner::fake::fake_formats;
use harmoniq_plugin_scanner::{init_logging, run_worker, WorkerArgs};

fn main() -> Result<()> {
    init_logging();
    match WorkerArgs::from_args(std::env::args_os()) {
        Some(worker) => run_worker(worker?, fake_formats()),
        None => bail!("expected to be started as a scan worker"),
    }
}
