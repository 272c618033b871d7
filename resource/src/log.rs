//! Durable build log: what was built, from which inputs, at which version,
//! and where the outputs live. The planner reads the previous log to decide
//! what is up to date and writes the next one by copy.

use kiln_base::InternedString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Version pair used by every up-to-date comparison.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVersion {
    pub type_version: u64,
    pub last_modification_time_ns: u64,
}

impl EntryVersion {
    pub fn new(type_version: u64, last_modification_time_ns: u64) -> EntryVersion {
        EntryVersion {
            type_version,
            last_modification_time_ns,
        }
    }

    /// Up-to-date equality: both components must match.
    pub fn is_up_to_date(self, detected: EntryVersion) -> bool {
        self == detected
    }
}

/// Reference as recorded in the log; only the merged `required` verdict
/// survives from detection flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogReference {
    #[serde(rename = "type")]
    pub ty: Option<InternedString>,
    pub name: InternedString,
    pub required: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavedDirectory {
    Deploy,
    Cache,
    /// Platform-unsupported outputs are still recorded, without a payload.
    Unsupported,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawEntry {
    #[serde(rename = "type")]
    pub ty: InternedString,
    pub name: InternedString,
    pub version: EntryVersion,
    pub deployed: bool,
    pub references: Vec<LogReference>,
}

/// Input consumed by a build rule beside its primary input. May point at a
/// raw entry, a built entry or a third-party binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecondaryInput {
    #[serde(rename = "type")]
    pub ty: Option<InternedString>,
    pub name: InternedString,
    pub version: EntryVersion,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuiltEntry {
    #[serde(rename = "type")]
    pub ty: InternedString,
    pub name: InternedString,
    pub version: EntryVersion,
    pub rule_version: u64,
    pub platform_configuration_time_ns: u64,
    pub primary_input_version: EntryVersion,
    pub saved_directory: SavedDirectory,
    pub references: Vec<LogReference>,
    pub secondary_inputs: Vec<SecondaryInput>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProducerRecord {
    #[serde(rename = "type")]
    pub ty: InternedString,
    pub name: InternedString,
    pub version: EntryVersion,
}

/// Entry side-produced while building some other resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecondaryEntry {
    #[serde(rename = "type")]
    pub ty: InternedString,
    pub name: InternedString,
    pub version: EntryVersion,
    pub saved_directory: SavedDirectory,
    pub producer: ProducerRecord,
    pub references: Vec<LogReference>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TargetLog {
    pub name: Option<InternedString>,
    pub raw: Vec<RawEntry>,
    pub built: Vec<BuiltEntry>,
    pub secondary: Vec<SecondaryEntry>,
}

impl TargetLog {
    pub fn new(name: InternedString) -> TargetLog {
        TargetLog {
            name: Some(name),
            ..TargetLog::default()
        }
    }

    pub fn find_raw(&self, ty: InternedString, name: InternedString) -> Option<&RawEntry> {
        self.raw.iter().find(|entry| entry.ty == ty && entry.name == name)
    }

    pub fn find_built(&self, ty: InternedString, name: InternedString) -> Option<&BuiltEntry> {
        self.built.iter().find(|entry| entry.ty == ty && entry.name == name)
    }

    pub fn find_secondary(&self, ty: InternedString, name: InternedString) -> Option<&SecondaryEntry> {
        self.secondary.iter().find(|entry| entry.ty == ty && entry.name == name)
    }
}

#[derive(Debug, Error)]
pub enum LogIoError {
    #[error("resource log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("resource log parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildLog {
    pub targets: Vec<TargetLog>,
}

impl BuildLog {
    pub fn new() -> BuildLog {
        BuildLog::default()
    }

    pub fn target(&self, name: InternedString) -> Option<&TargetLog> {
        self.targets.iter().find(|target| target.name == Some(name))
    }

    pub fn replace_target(&mut self, log: TargetLog) {
        self.targets.retain(|target| target.name != log.name);
        self.targets.push(log);
    }

    pub fn load(path: &Path) -> Result<BuildLog, LogIoError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), LogIoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_base::intern;

    #[test]
    fn version_up_to_date_needs_both_components() {
        let logged = EntryVersion::new(3, 100);
        assert!(logged.is_up_to_date(EntryVersion::new(3, 100)));
        assert!(!logged.is_up_to_date(EntryVersion::new(4, 100)));
        assert!(!logged.is_up_to_date(EntryVersion::new(3, 101)));
    }

    #[test]
    fn target_replacement_keeps_one_entry_per_name() {
        let mut log = BuildLog::new();
        log.replace_target(TargetLog::new(intern("main")));
        log.replace_target(TargetLog::new(intern("main")));
        assert_eq!(log.targets.len(), 1);
        assert!(log.target(intern("main")).is_some());
    }
}
