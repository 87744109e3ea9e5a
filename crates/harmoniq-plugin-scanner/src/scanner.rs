use std::sync::Arc;

use harmoniq_plugin_db::{FormatManager, PluginRegistry, PluginStore};
use tracing::warn;

use crate::config::ScannerConfig;
use crate::master::{ProcessLauncher, ScannerMaster, WorkerLauncher};

/// Receives scan events. Callbacks run on scanner threads, never on the
/// thread that started the scan.
pub trait ScanListener: Send + Sync {
    fn scan_started(&self, _file: &str) {}

    fn scan_progress(&self, _fraction: f32) {}

    fn scan_finished(&self) {}
}

/// Scans plugins out of process on behalf of one plugin registry.
pub struct PluginScanner {
    config: ScannerConfig,
    formats: FormatManager,
    store: Arc<PluginStore>,
    master: ScannerMaster,
}

impl PluginScanner {
    /// Scanner that launches [`ScannerConfig::executable`] as its worker.
    pub fn new(config: ScannerConfig, formats: FormatManager) -> Self {
        let launcher = ProcessLauncher::from_config(&config);
        Self::with_launcher(config, formats, Box::new(launcher))
    }

    pub fn with_launcher(
        config: ScannerConfig,
        formats: FormatManager,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Self {
        let store = Arc::new(PluginStore::open(config.plugins_file()));
        let master = ScannerMaster::new(config.clone(), Arc::clone(&store), launcher);
        Self {
            config,
            formats,
            store,
            master,
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Formats that an empty format list expands to.
    pub fn scannable_formats(&self) -> Vec<String> {
        self.formats.scannable_names()
    }

    /// Starts scanning `formats`, or every scannable format when empty.
    /// Returns true when a scan is running afterwards.
    pub fn start(&self, formats: &[String]) -> bool {
        let formats = if formats.is_empty() {
            self.scannable_formats()
        } else {
            formats
                .iter()
                .filter(|name| {
                    let known = self.formats.get(name).is_some();
                    if !known {
                        warn!("not scanning unknown plugin format {name}");
                    }
                    known
                })
                .cloned()
                .collect()
        };
        self.master.start_scan(&formats)
    }

    pub fn cancel(&self) {
        self.master.cancel();
    }

    pub fn is_scanning(&self) -> bool {
        self.master.is_running()
    }

    pub fn progress(&self) -> Option<f32> {
        self.master.progress()
    }

    pub fn current_file(&self) -> Option<String> {
        self.master.current_file()
    }

    pub fn relaunch_count(&self) -> u32 {
        self.master.relaunch_count()
    }

    pub fn add_listener(&self, listener: Arc<dyn ScanListener>) {
        self.master.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ScanListener>) {
        self.master.remove_listener(listener);
    }

    pub fn store(&self) -> &Arc<PluginStore> {
        &self.store
    }

    pub fn registry(&self) -> PluginRegistry {
        self.store.registry()
    }
}
