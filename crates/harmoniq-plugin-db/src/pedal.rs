use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::registry::PluginRegistry;

/// The "dead man's pedal": a plain text file naming the plugin file that is
/// being probed right now. It is written before a probe and removed after.
/// If it is still present when a scanner starts, the previous scanner died
/// while probing the listed files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadMansPedal {
    path: PathBuf,
}

impl DeadMansPedal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Records `file` as the probe in flight, replacing any previous entry.
    pub fn record(&self, file: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&self.path)?;
        writeln!(out, "{file}")?;
        out.sync_all()
    }

    pub fn read(&self) -> io::Result<Vec<String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Blacklists every file named by the pedal and deletes it. Returns the
    /// number of newly blacklisted files.
    pub fn apply(&self, registry: &mut PluginRegistry) -> io::Result<usize> {
        let files = self.read()?;
        let mut applied = 0;
        for file in files {
            log::info!("blacklisting {file} after a crash while probing it");
            if registry.add_to_blacklist(file) {
                applied += 1;
            }
        }
        self.clear()?;
        Ok(applied)
    }
}
