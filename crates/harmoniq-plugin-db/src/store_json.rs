use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::entry::PluginDescriptor;
use crate::pedal::DeadMansPedal;
use crate::registry::{MergePolicy, PluginRegistry};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read plugin database: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse plugin database: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to replace plugin database: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// A registry serialized to a JSON file.
///
/// Writes go to a temporary sibling which is then renamed over the target, so
/// readers observe either the previous or the next complete document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Strict read: `Ok(None)` when the file is absent, an error when it
    /// cannot be parsed.
    pub fn try_load(&self) -> Result<Option<PluginRegistry>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Some(PluginRegistry::new()));
        }
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Lenient read: anything unreadable counts as an empty registry.
    pub fn load(&self) -> PluginRegistry {
        match self.try_load() {
            Ok(registry) => registry.unwrap_or_default(),
            Err(err) => {
                log::warn!(
                    "ignoring unreadable plugin list {}: {}",
                    self.path.display(),
                    err
                );
                PluginRegistry::new()
            }
        }
    }

    pub fn write(&self, registry: &PluginRegistry) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let json = serde_json::to_vec_pretty(registry)?;
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }

    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// The host's live registry, bound to the file it is saved to.
#[derive(Debug)]
pub struct PluginStore {
    file: SnapshotFile,
    registry: Mutex<PluginRegistry>,
}

impl PluginStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let file = SnapshotFile::new(path);
        let registry = file.load();
        Self {
            file,
            registry: Mutex::new(registry),
        }
    }

    pub fn in_memory(path: impl Into<PathBuf>, registry: PluginRegistry) -> Self {
        Self {
            file: SnapshotFile::new(path),
            registry: Mutex::new(registry),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn registry(&self) -> PluginRegistry {
        self.registry.lock().clone()
    }

    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.registry.lock().descriptors().cloned().collect()
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut PluginRegistry) -> T) -> T {
        let mut registry = self.registry.lock();
        f(&mut registry)
    }

    /// Registers a plugin the user added by hand, lifting any blacklisting.
    pub fn add_to_known_plugins(&self, descriptor: PluginDescriptor) -> Result<(), StoreError> {
        let mut registry = self.registry.lock();
        registry.insert(descriptor);
        self.file.write(&registry)
    }

    /// Folds a worker snapshot into the live registry. Entries in the
    /// snapshot win over what the host already knew.
    pub fn reconcile(&self, snapshot: &PluginRegistry) {
        self.registry
            .lock()
            .merge(snapshot, MergePolicy::PreferIncoming);
    }

    /// Replaces the live registry with the contents of `path`, then applies
    /// and consumes the dead man's pedal. Unreadable files leave the current
    /// registry untouched.
    pub fn restore_from(&self, path: &Path, pedal: &DeadMansPedal) -> bool {
        let file = SnapshotFile::new(path);
        let mut changed = false;
        match file.try_load() {
            Ok(Some(restored)) => {
                *self.registry.lock() = restored;
                changed = true;
            }
            Ok(None) => {}
            Err(err) => log::warn!("not restoring plugins from {}: {}", path.display(), err),
        }
        match pedal.apply(&mut self.registry.lock()) {
            Ok(applied) => changed |= applied > 0,
            Err(err) => log::warn!("failed to apply dead man's pedal: {}", err),
        }
        changed
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let registry = self.registry.lock();
        self.file.write(&registry)
    }
}
