use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Sender};
use harmoniq_plugin_db::{FormatManager, PluginStore, UnverifiedPlugins};
use harmoniq_plugin_scanner::{
    init_logging, parse_search_path, run_worker, PluginScanner, ScanListener, ScannerConfig,
    WorkerArgs,
};

#[derive(Parser, Debug)]
#[command(name = "harmoniq-plugin-scanner")]
struct Args {
    /// Restrict scanning to the given plugin formats (CLAP, VST3, OVST3, Harmoniq)
    #[arg(long = "format", value_name = "FORMAT")]
    formats: Vec<String>,

    /// Additional search path for one format, as FORMAT=PATH
    #[arg(long = "path", value_name = "FORMAT=PATH", value_parser = parse_search_path)]
    extra_paths: Vec<(String, PathBuf)>,

    /// Directory holding plugins.json and the scan scratch files
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// List candidates that have not been verified yet instead of scanning
    #[arg(long)]
    unverified: bool,
}

struct Progress(Sender<()>);

impl ScanListener for Progress {
    fn scan_started(&self, file: &str) {
        eprintln!("scanning {file}");
    }

    fn scan_finished(&self) {
        let _ = self.0.send(());
    }
}

fn main() -> Result<()> {
    init_logging();

    if let Some(worker) = WorkerArgs::from_args(std::env::args_os()) {
        return run_worker(worker?, FormatManager::with_default_formats());
    }

    let args = Args::parse();
    let mut config = match args.data_dir {
        Some(dir) => ScannerConfig::with_data_dir(dir),
        None => ScannerConfig::default(),
    };
    for (format, path) in args.extra_paths {
        config.add_search_path(format, path);
    }

    let formats = FormatManager::with_default_formats();
    if args.unverified {
        return list_unverified(&config, formats);
    }

    let scanner = PluginScanner::new(config, formats);
    let (done_tx, done) = unbounded();
    scanner.add_listener(Arc::new(Progress(done_tx)));
    if !scanner.start(&args.formats) {
        bail!("failed to launch the plugin scan worker");
    }
    let _ = done.recv();

    let registry = scanner.registry();
    for plugin in registry.descriptors() {
        println!(
            "{} ({}) {}",
            plugin.name, plugin.format, plugin.file_or_identifier
        );
    }
    for file in registry.failed_files() {
        println!("blacklisted: {file}");
    }
    Ok(())
}

fn list_unverified(config: &ScannerConfig, formats: FormatManager) -> Result<()> {
    let registry = PluginStore::open(config.plugins_file()).registry();
    let names = formats.scannable_names();
    let unverified = UnverifiedPlugins::new();
    unverified.search(
        formats,
        config.search_paths.clone().into_iter().collect(),
        config.max_depth,
    );
    unverified.wait();
    for name in names {
        for plugin in unverified.plugins(&name, &registry) {
            println!(
                "{} ({}) {} [unverified]",
                plugin.name, plugin.format, plugin.file_or_identifier
            );
        }
    }
    Ok(())
}
