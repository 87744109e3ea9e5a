use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a plugin inside the registry: the format it was discovered
/// with plus the file (or opaque identifier) it lives in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginId {
    pub format: String,
    pub file_or_identifier: String,
}

impl PluginId {
    pub fn new(format: impl Into<String>, file_or_identifier: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            file_or_identifier: file_or_identifier.into(),
        }
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.format, self.file_or_identifier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginDescriptor {
    pub format: String,
    pub file_or_identifier: String,
    pub name: String,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub is_instrument: bool,
    pub has_editor: bool,
    pub num_inputs: u32,
    pub num_outputs: u32,
    pub last_seen: DateTime<Utc>,
}

impl PluginDescriptor {
    /// Bare descriptor for a candidate that has not been probed yet.
    pub fn unverified(format: impl Into<String>, file_or_identifier: impl Into<String>) -> Self {
        let file_or_identifier = file_or_identifier.into();
        let name = std::path::Path::new(&file_or_identifier)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_or_identifier.clone());
        Self {
            format: format.into(),
            file_or_identifier,
            name,
            vendor: None,
            category: None,
            version: None,
            description: None,
            is_instrument: false,
            has_editor: false,
            num_inputs: 0,
            num_outputs: 2,
            last_seen: Utc::now(),
        }
    }

    pub fn id(&self) -> PluginId {
        PluginId::new(self.format.clone(), self.file_or_identifier.clone())
    }
}

/// Metadata reported by a probe, before it is bound to a format and file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginMetadata {
    pub name: String,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub is_instrument: bool,
    pub has_editor: bool,
    pub num_inputs: u32,
    pub num_outputs: u32,
}

impl PluginMetadata {
    pub fn into_descriptor(
        self,
        format: impl Into<String>,
        file_or_identifier: impl Into<String>,
    ) -> PluginDescriptor {
        PluginDescriptor {
            format: format.into(),
            file_or_identifier: file_or_identifier.into(),
            name: self.name,
            vendor: self.vendor,
            category: self.category,
            version: self.version,
            description: self.description,
            is_instrument: self.is_instrument,
            has_editor: self.has_editor,
            num_inputs: self.num_inputs,
            num_outputs: self.num_outputs,
            last_seen: Utc::now(),
        }
    }
}
