use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entry::{PluginDescriptor, PluginId};

/// How conflicting entries are resolved when two registries are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Entries already present win. Used when a worker absorbs the user's
    /// plugin list into its own snapshot.
    KeepExisting,
    /// Entries from the other registry win. Used when the host folds a
    /// worker snapshot back into its live registry.
    PreferIncoming,
}

/// Known plugins plus the files that must never be probed again.
///
/// The blacklist is keyed by file (or identifier) only: a file that crashed
/// the scanner is unsafe regardless of the format that tried to open it.
/// A file is never both blacklisted and backing a live descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RegistryData", into = "RegistryData")]
pub struct PluginRegistry {
    plugins: BTreeMap<PluginId, PluginDescriptor>,
    blacklist: BTreeSet<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty() && self.blacklist.is_empty()
    }

    /// Adds or replaces a descriptor. A successful insert re-admits the file
    /// if it was previously blacklisted.
    pub fn insert(&mut self, descriptor: PluginDescriptor) {
        self.blacklist.remove(&descriptor.file_or_identifier);
        self.plugins.insert(descriptor.id(), descriptor);
    }

    pub fn remove(&mut self, id: &PluginId) -> Option<PluginDescriptor> {
        self.plugins.remove(id)
    }

    pub fn get(&self, id: &PluginId) -> Option<&PluginDescriptor> {
        self.plugins.get(id)
    }

    pub fn contains(&self, id: &PluginId) -> bool {
        self.plugins.contains_key(id)
    }

    /// First descriptor backed by `file`, whatever its format.
    pub fn type_for_file(&self, file: &str) -> Option<&PluginDescriptor> {
        self.plugins
            .values()
            .find(|descriptor| descriptor.file_or_identifier == file)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.values()
    }

    pub fn descriptors_for_format<'a>(
        &'a self,
        format: &'a str,
    ) -> impl Iterator<Item = &'a PluginDescriptor> + 'a {
        self.plugins
            .values()
            .filter(move |descriptor| descriptor.format == format)
    }

    /// Blacklists `file`, dropping every descriptor it backed. Returns true
    /// when the file was not blacklisted before.
    pub fn add_to_blacklist(&mut self, file: impl Into<String>) -> bool {
        let file = file.into();
        self.plugins.retain(|id, _| id.file_or_identifier != file);
        self.blacklist.insert(file)
    }

    pub fn remove_from_blacklist(&mut self, file: &str) -> bool {
        self.blacklist.remove(file)
    }

    pub fn clear_blacklist(&mut self) {
        self.blacklist.clear();
    }

    pub fn is_blacklisted(&self, file: &str) -> bool {
        self.blacklist.contains(file)
    }

    /// Files that failed to probe or crashed the scanner.
    pub fn failed_files(&self) -> impl Iterator<Item = &str> {
        self.blacklist.iter().map(String::as_str)
    }

    pub fn merge(&mut self, other: &PluginRegistry, policy: MergePolicy) {
        match policy {
            MergePolicy::KeepExisting => {
                for file in &other.blacklist {
                    if self.type_for_file(file).is_none() {
                        self.blacklist.insert(file.clone());
                    }
                }
                for (id, descriptor) in &other.plugins {
                    if self.plugins.contains_key(id)
                        || self.blacklist.contains(&id.file_or_identifier)
                    {
                        continue;
                    }
                    self.plugins.insert(id.clone(), descriptor.clone());
                }
            }
            MergePolicy::PreferIncoming => {
                for descriptor in other.plugins.values() {
                    self.insert(descriptor.clone());
                }
                for file in &other.blacklist {
                    self.add_to_blacklist(file.clone());
                }
            }
        }
    }
}

/// On-disk shape of a registry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryData {
    #[serde(default)]
    plugins: Vec<PluginDescriptor>,
    #[serde(default)]
    blacklist: Vec<String>,
}

impl From<RegistryData> for PluginRegistry {
    fn from(data: RegistryData) -> Self {
        let mut registry = PluginRegistry::new();
        for descriptor in data.plugins {
            registry.plugins.insert(descriptor.id(), descriptor);
        }
        for file in data.blacklist {
            registry.add_to_blacklist(file);
        }
        registry
    }
}

impl From<PluginRegistry> for RegistryData {
    fn from(registry: PluginRegistry) -> Self {
        Self {
            plugins: registry.plugins.into_values().collect(),
            blacklist: registry.blacklist.into_iter().collect(),
        }
    }
}
