use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::entry::PluginDescriptor;
use crate::format::FormatManager;
use crate::registry::PluginRegistry;

/// Background filesystem walk that lists plugin candidates without probing
/// them. Loading one of these may still fail; they are offered to the user
/// as "not yet verified".
#[derive(Debug, Default)]
pub struct UnverifiedPlugins {
    found: Arc<Mutex<HashMap<String, Vec<String>>>>,
    cancel: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UnverifiedPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_searching(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Starts a search unless one is already running. `extra_paths` are
    /// searched in addition to each format's default locations.
    pub fn search(
        &self,
        formats: FormatManager,
        extra_paths: HashMap<String, Vec<PathBuf>>,
        max_depth: usize,
    ) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.cancel.store(false, Ordering::SeqCst);
        let found = Arc::clone(&self.found);
        let cancel = Arc::clone(&self.cancel);
        *worker = Some(thread::spawn(move || {
            for handler in formats.formats() {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                let mut paths = extra_paths
                    .get(handler.name())
                    .cloned()
                    .unwrap_or_default();
                paths.extend(handler.default_locations());
                let files = handler.search_paths_for_plugins(&paths, max_depth);
                log::debug!("found {} unverified {} candidates", files.len(), handler.name());
                found.lock().insert(handler.name().to_owned(), files);
            }
        }));
    }

    /// Candidates of `format` that `registry` does not know about yet.
    pub fn plugins(&self, format: &str, registry: &PluginRegistry) -> Vec<PluginDescriptor> {
        let found = self.found.lock();
        found
            .get(format)
            .into_iter()
            .flatten()
            .filter(|file| registry.type_for_file(file).is_none() && !registry.is_blacklisted(file))
            .map(|file| PluginDescriptor::unverified(format, file.clone()))
            .collect()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn wait(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UnverifiedPlugins {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir_all, File};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use parking_lot::Condvar;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::format::{FormatHandler, ManifestFormat, PluginFormat, ProbeError};

    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl Gate {
        fn open(&self) {
            *self.open.lock() = true;
            self.opened.notify_all();
        }

        fn pass(&self) {
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
    }

    /// Format whose search blocks until its gate opens.
    struct GatedFormat {
        name: &'static str,
        gate: Arc<Gate>,
        searches: Arc<AtomicUsize>,
    }

    impl FormatHandler for GatedFormat {
        fn name(&self) -> &str {
            self.name
        }

        fn default_locations(&self) -> Vec<PathBuf> {
            Vec::new()
        }

        fn search_paths_for_plugins(&self, _paths: &[PathBuf], _max_depth: usize) -> Vec<String> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.gate.pass();
            vec![Path::new("/gated").join(self.name).display().to_string()]
        }

        fn probe(&self, _file_or_identifier: &str) -> Result<PluginDescriptor, ProbeError> {
            Err(ProbeError::Unsupported)
        }
    }

    fn gated(name: &'static str, gate: &Arc<Gate>) -> (Arc<dyn FormatHandler>, Arc<AtomicUsize>) {
        let searches = Arc::new(AtomicUsize::new(0));
        let format = GatedFormat {
            name,
            gate: Arc::clone(gate),
            searches: Arc::clone(&searches),
        };
        (Arc::new(format), searches)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn second_search_while_running_is_ignored() {
        let gate = Arc::new(Gate::default());
        let (format, searches) = gated("Slow", &gate);
        let mut formats = FormatManager::new();
        formats.add_format(format);

        let unverified = UnverifiedPlugins::new();
        unverified.search(formats.clone(), HashMap::new(), 1);
        wait_until(|| searches.load(Ordering::SeqCst) == 1);
        assert!(unverified.is_searching());
        unverified.search(formats, HashMap::new(), 1);

        gate.open();
        unverified.wait();
        assert_eq!(searches.load(Ordering::SeqCst), 1);
        assert!(!unverified.is_searching());
        assert_eq!(unverified.plugins("Slow", &PluginRegistry::new()).len(), 1);
    }

    #[test]
    fn cancel_skips_remaining_formats() {
        let gate = Arc::new(Gate::default());
        let (first, first_searches) = gated("First", &gate);
        let (second, second_searches) = gated("Second", &gate);
        let mut formats = FormatManager::new();
        formats.add_format(first);
        formats.add_format(second);

        let unverified = UnverifiedPlugins::new();
        unverified.search(formats, HashMap::new(), 1);
        wait_until(|| first_searches.load(Ordering::SeqCst) == 1);
        unverified.cancel();
        gate.open();
        unverified.wait();

        assert_eq!(second_searches.load(Ordering::SeqCst), 0);
        assert!(unverified.plugins("Second", &PluginRegistry::new()).is_empty());
        assert_eq!(unverified.plugins("First", &PluginRegistry::new()).len(), 1);
    }

    #[test]
    fn lists_only_unknown_candidates() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("clap");
        create_dir_all(&root).unwrap();
        for name in ["known.clap", "fresh.clap", "dead.clap"] {
            File::create(root.join(name)).unwrap();
        }

        let mut formats = FormatManager::new();
        formats.add_format(Arc::new(ManifestFormat::new(PluginFormat::Clap)));
        let mut extra = HashMap::new();
        extra.insert("CLAP".to_string(), vec![root.clone()]);

        let unverified = UnverifiedPlugins::new();
        unverified.search(formats, extra, 2);
        unverified.wait();

        let mut registry = PluginRegistry::new();
        registry.insert(PluginDescriptor::unverified(
            "CLAP",
            root.join("known.clap").display().to_string(),
        ));
        registry.add_to_blacklist(root.join("dead.clap").display().to_string());

        let plugins = unverified.plugins("CLAP", &registry);
        let files: Vec<_> = plugins.iter().map(|p| p.file_or_identifier.clone()).collect();
        assert_eq!(files, vec![root.join("fresh.clap").display().to_string()]);
        assert!(unverified.plugins("VST3", &registry).is_empty());
    }
}
