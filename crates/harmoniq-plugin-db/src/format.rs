use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::entry::{PluginDescriptor, PluginMetadata};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("unsupported plugin format")]
    Unsupported,
    #[error("plugin rejected: {0}")]
    Rejected(String),
}

/// One plugin ABI the scanner knows how to find and inspect.
///
/// Formats are addressed by name everywhere else (protocol messages, the
/// registry), so `name` must be stable across processes.
pub trait FormatHandler: Send + Sync {
    fn name(&self) -> &str;

    fn can_scan_for_plugins(&self) -> bool {
        true
    }

    fn default_locations(&self) -> Vec<PathBuf>;

    /// Lists candidate files below `paths` without loading any of them.
    /// The result is sorted and free of duplicates.
    fn search_paths_for_plugins(&self, paths: &[PathBuf], max_depth: usize) -> Vec<String>;

    /// Inspects a single candidate. This is the step that may run third
    /// party code and therefore only ever happens inside the scan worker.
    fn probe(&self, file_or_identifier: &str) -> Result<PluginDescriptor, ProbeError>;
}

/// Ordered collection of the formats available to a process.
#[derive(Clone, Default)]
pub struct FormatManager {
    handlers: Vec<Arc<dyn FormatHandler>>,
}

impl fmt::Debug for FormatManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FormatManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_formats() -> Self {
        let mut manager = Self::new();
        manager.add_default_formats();
        manager
    }

    pub fn add_default_formats(&mut self) {
        for format in PluginFormat::ALL {
            self.add_format(Arc::new(ManifestFormat::new(format)));
        }
    }

    /// Adds a format, replacing any existing format with the same name.
    pub fn add_format(&mut self, handler: Arc<dyn FormatHandler>) {
        self.handlers.retain(|existing| existing.name() != handler.name());
        self.handlers.push(handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FormatHandler>> {
        self.handlers
            .iter()
            .find(|handler| handler.name() == name)
            .cloned()
    }

    pub fn formats(&self) -> impl Iterator<Item = &Arc<dyn FormatHandler>> {
        self.handlers.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|handler| handler.name().to_owned())
            .collect()
    }

    pub fn scannable_names(&self) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|handler| handler.can_scan_for_plugins())
            .map(|handler| handler.name().to_owned())
            .collect()
    }
}

/// Bundle formats recognised from their on-disk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum PluginFormat {
    Clap,
    Vst3,
    Ovst3,
    Harmoniq,
}

impl PluginFormat {
    pub const ALL: [PluginFormat; 4] = [
        PluginFormat::Clap,
        PluginFormat::Vst3,
        PluginFormat::Ovst3,
        PluginFormat::Harmoniq,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PluginFormat::Clap => "CLAP",
            PluginFormat::Vst3 => "VST3",
            PluginFormat::Ovst3 => "OVST3",
            PluginFormat::Harmoniq => "Harmoniq",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "clap" => Some(Self::Clap),
            "vst3" => Some(Self::Vst3),
            "ovst3" => Some(Self::Ovst3),
            "hqplug" => Some(Self::Harmoniq),
            _ => None,
        }
    }

    fn default_locations(self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        let home = dirs::home_dir();
        match self {
            PluginFormat::Clap => {
                roots.push(PathBuf::from("/usr/share/harmoniq-studio/plugins/clap"));
                roots.push(PathBuf::from("/usr/lib/clap"));
                roots.push(PathBuf::from("/usr/local/lib/clap"));
                roots.extend(home.map(|home| home.join(".clap")));
            }
            PluginFormat::Vst3 => {
                roots.push(PathBuf::from("/usr/share/harmoniq-studio/plugins/vst3"));
                roots.push(PathBuf::from("/usr/lib/vst3"));
                roots.push(PathBuf::from("/usr/local/lib/vst3"));
                roots.extend(home.map(|home| home.join(".vst3")));
            }
            PluginFormat::Ovst3 => {
                roots.push(PathBuf::from("/usr/share/harmoniq-studio/plugins/ovst3"));
                roots.extend(home.map(|home| home.join(".vst3")));
            }
            PluginFormat::Harmoniq => {
                roots.push(PathBuf::from("/usr/share/harmoniq-studio/plugins/harmoniq"));
                roots.extend(home.map(|home| home.join(".harmoniq/plugins")));
            }
        }
        roots
    }
}

/// Format handler that reads the `manifest.json` shipped next to or inside a
/// bundle, falling back to metadata derived from the file name.
#[derive(Debug)]
pub struct ManifestFormat {
    kind: PluginFormat,
    prober: ManifestProber,
}

impl ManifestFormat {
    pub fn new(kind: PluginFormat) -> Self {
        Self {
            kind,
            prober: ManifestProber,
        }
    }
}

impl FormatHandler for ManifestFormat {
    fn name(&self) -> &str {
        self.kind.label()
    }

    fn default_locations(&self) -> Vec<PathBuf> {
        self.kind.default_locations()
    }

    fn search_paths_for_plugins(&self, paths: &[PathBuf], max_depth: usize) -> Vec<String> {
        let mut found = BTreeSet::new();
        for root in paths {
            if !root.exists() {
                continue;
            }
            let mut walker = WalkDir::new(root).max_depth(max_depth).into_iter();
            while let Some(entry) = walker.next() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        if let Some(io) = err.io_error() {
                            log::debug!(
                                "skipping entry while searching {}: {}",
                                root.display(),
                                io
                            );
                        }
                        continue;
                    }
                };
                if let Some((format, candidate)) = classify_candidate(entry.path()) {
                    if entry.file_type().is_dir() {
                        walker.skip_current_dir();
                    }
                    if format == self.kind {
                        found.insert(candidate.display().to_string());
                    }
                }
            }
        }
        found.into_iter().collect()
    }

    fn probe(&self, file_or_identifier: &str) -> Result<PluginDescriptor, ProbeError> {
        let path = Path::new(file_or_identifier);
        if !path.exists() {
            return Err(ProbeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{file_or_identifier} does not exist"),
            )));
        }
        match classify_candidate(path) {
            Some((format, _)) if format == self.kind => {}
            _ => return Err(ProbeError::Unsupported),
        }
        let metadata = self.prober.probe(self.kind, path)?;
        Ok(metadata.into_descriptor(self.kind.label(), file_or_identifier))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestProber;

#[derive(Debug, Deserialize)]
struct ManifestFile {
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub is_instrument: Option<bool>,
    pub has_editor: Option<bool>,
    pub num_inputs: Option<u32>,
    pub num_outputs: Option<u32>,
}

impl ManifestProber {
    pub fn probe(&self, format: PluginFormat, path: &Path) -> Result<PluginMetadata, ProbeError> {
        let Some(manifest) = find_manifest(format, path)? else {
            return Ok(stub_metadata(format, path));
        };
        let name = manifest.name.unwrap_or_else(|| {
            path.file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .into()
        });
        Ok(PluginMetadata {
            name,
            vendor: manifest.vendor,
            category: manifest.category,
            version: manifest.version,
            description: manifest.description,
            is_instrument: manifest.is_instrument.unwrap_or(false),
            has_editor: manifest.has_editor.unwrap_or(false),
            num_inputs: manifest.num_inputs.unwrap_or(0),
            num_outputs: manifest.num_outputs.unwrap_or(2),
        })
    }
}

fn find_manifest(format: PluginFormat, path: &Path) -> Result<Option<ManifestFile>, ProbeError> {
    let mut candidates = Vec::new();
    match format {
        PluginFormat::Clap | PluginFormat::Harmoniq => {
            if path.is_dir() {
                candidates.push(path.join("manifest.json"));
                candidates.push(path.join("Contents/manifest.json"));
            } else if let Some(parent) = path.parent() {
                candidates.push(parent.join("manifest.json"));
            }
        }
        PluginFormat::Vst3 | PluginFormat::Ovst3 => {
            candidates.push(path.join("Contents/manifest.json"));
            candidates.push(path.join("manifest.json"));
        }
    }
    for candidate in candidates {
        if candidate.is_file() {
            let raw = fs::read_to_string(candidate)?;
            let manifest: ManifestFile = serde_json::from_str(&raw)?;
            return Ok(Some(manifest));
        }
    }
    Ok(None)
}

fn stub_metadata(format: PluginFormat, path: &Path) -> PluginMetadata {
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    PluginMetadata {
        name,
        vendor: None,
        category: None,
        version: None,
        description: None,
        is_instrument: matches!(format, PluginFormat::Harmoniq),
        has_editor: false,
        num_inputs: 0,
        num_outputs: 2,
    }
}

fn classify_candidate(path: &Path) -> Option<(PluginFormat, PathBuf)> {
    let ext = path.extension().and_then(|ext| ext.to_str())?;
    let format = PluginFormat::from_extension(ext)?;
    let is_bundle_dir = matches!(
        format,
        PluginFormat::Clap | PluginFormat::Vst3 | PluginFormat::Ovst3
    );
    if path.is_file() && matches!(format, PluginFormat::Clap | PluginFormat::Harmoniq) {
        return Some((format, path.to_path_buf()));
    }
    if path.is_dir() && is_bundle_dir {
        return Some((format, path.to_path_buf()));
    }
    None
}
