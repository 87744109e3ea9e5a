//! A synthetic plugin format for exercising the scanner end to end.
//!
//! Candidates are `*.fake` files. The file contents decide what probing
//! does: `crash` panics, `hang` never returns, `fail` is rejected and
//! anything else yields a plugin named after the file.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use harmoniq_plugin_db::{FormatHandler, FormatManager, PluginDescriptor, ProbeError};
use walkdir::WalkDir;

pub const FAKE_FORMAT: &str = "Fake";
pub const FAKE_EXTENSION: &str = "fake";

#[derive(Debug, Default, Clone, Copy)]
pub struct FakeFormat;

impl FormatHandler for FakeFormat {
    fn name(&self) -> &str {
        FAKE_FORMAT
    }

    fn default_locations(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn search_paths_for_plugins(&self, paths: &[PathBuf], max_depth: usize) -> Vec<String> {
        let mut found: Vec<String> = paths
            .iter()
            .flat_map(|root| WalkDir::new(root).max_depth(max_depth).into_iter())
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry.path().extension().and_then(|ext| ext.to_str()) == Some(FAKE_EXTENSION)
            })
            .map(|entry| entry.path().display().to_string())
            .collect();
        found.sort();
        found.dedup();
        found
    }

    fn probe(&self, file_or_identifier: &str) -> Result<PluginDescriptor, ProbeError> {
        let behaviour = fs::read_to_string(file_or_identifier)?;
        match behaviour.trim() {
            "crash" => panic!("{file_or_identifier} crashed the scanner"),
            "hang" => loop {
                thread::sleep(Duration::from_secs(3600));
            },
            "fail" => Err(ProbeError::Rejected(format!(
                "{file_or_identifier} is not a plugin"
            ))),
            _ => {
                let mut descriptor = PluginDescriptor::unverified(FAKE_FORMAT, file_or_identifier);
                descriptor.vendor = Some("Harmoniq Test Rig".into());
                descriptor.has_editor = true;
                Ok(descriptor)
            }
        }
    }
}

/// Format manager that only knows [`FakeFormat`].
pub fn fake_formats() -> FormatManager {
    let mut formats = FormatManager::new();
    formats.add_format(Arc::new(FakeFormat));
    formats
}
