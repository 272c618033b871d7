//! Canonical resource identity and file name classification.

use kiln_base::{intern, InternedString};
use std::path::Path;

pub const RESOURCE_INDEX_DEFAULT_NAME: &str = ".resource_index";
pub const RESOURCE_INDEX_STRING_REGISTRY_DEFAULT_NAME: &str = ".resource_index_string_registry";
pub const RESOURCE_LOG_DEFAULT_NAME: &str = ".resource_log";

pub const BINARY_EXTENSION: &str = "bin";
pub const READABLE_DATA_EXTENSION: &str = "rd";

/// Canonical resource address. A missing type means a third-party item:
/// opaque bytes with no native representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceKey {
    pub ty: Option<InternedString>,
    pub name: InternedString,
}

impl ResourceKey {
    pub fn native(ty: InternedString, name: InternedString) -> ResourceKey {
        ResourceKey { ty: Some(ty), name }
    }

    pub fn third_party(name: InternedString) -> ResourceKey {
        ResourceKey { ty: None, name }
    }

    pub fn is_third_party(&self) -> bool {
        self.ty.is_none()
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.ty {
            Some(ty) => write!(f, "{}/{}", ty, self.name),
            None => write!(f, "third_party/{}", self.name),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PayloadKind {
    NativeBinary,
    NativeReadableData,
    ThirdParty,
}

/// Infers resource name and payload kind from a file name: `<name>.bin` is
/// native binary, `<name>.rd` native readable data, anything else keeps its
/// full file name as a third-party item.
pub fn classify_path(path: &Path) -> Option<(InternedString, PayloadKind)> {
    let file_name = path.file_name()?.to_str()?;
    let extension = path.extension().and_then(|extension| extension.to_str());

    match extension {
        Some(BINARY_EXTENSION) => {
            let stem = path.file_stem()?.to_str()?;
            Some((intern(stem), PayloadKind::NativeBinary))
        }
        Some(READABLE_DATA_EXTENSION) => {
            let stem = path.file_stem()?.to_str()?;
            Some((intern(stem), PayloadKind::NativeReadableData))
        }
        _ => Some((intern(file_name), PayloadKind::ThirdParty)),
    }
}
