//! Serializable resource index: what exists for a target and where.

use crate::ident::{PayloadKind, ResourceKey};
use kiln_base::InternedString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeItemFormat {
    Binary,
    ReadableData,
}

impl NativeItemFormat {
    pub fn payload_kind(self) -> PayloadKind {
        match self {
            NativeItemFormat::Binary => PayloadKind::NativeBinary,
            NativeItemFormat::ReadableData => PayloadKind::NativeReadableData,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NativeItem {
    pub name: InternedString,
    pub format: NativeItemFormat,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NativeContainer {
    #[serde(rename = "type")]
    pub ty: InternedString,
    pub items: Vec<NativeItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThirdPartyItem {
    pub name: InternedString,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("resource index io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("resource index parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Per-type native entries plus a flat list of third-party items. Produced
/// by the build tool, consumed at load time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceIndex {
    pub native: Vec<NativeContainer>,
    pub third_party: Vec<ThirdPartyItem>,
}

impl ResourceIndex {
    pub fn new() -> ResourceIndex {
        ResourceIndex::default()
    }

    pub fn add_native_entry(
        &mut self,
        ty: InternedString,
        name: InternedString,
        format: NativeItemFormat,
        path: &str,
    ) {
        let item = NativeItem {
            name,
            format,
            path: path.to_owned(),
        };
        match self.native.iter_mut().find(|container| container.ty == ty) {
            Some(container) => container.items.push(item),
            None => self.native.push(NativeContainer {
                ty,
                items: vec![item],
            }),
        }
    }

    pub fn add_third_party_entry(&mut self, name: InternedString, path: &str, size: u64) {
        self.third_party.push(ThirdPartyItem {
            name,
            path: path.to_owned(),
            size,
        });
    }

    pub fn find_native(&self, ty: InternedString, name: InternedString) -> Option<&NativeItem> {
        self.native
            .iter()
            .find(|container| container.ty == ty)
            .and_then(|container| container.items.iter().find(|item| item.name == name))
    }

    pub fn keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        let native = self.native.iter().flat_map(|container| {
            container
                .items
                .iter()
                .map(move |item| ResourceKey::native(container.ty, item.name))
        });
        let third_party = self
            .third_party
            .iter()
            .map(|item| ResourceKey::third_party(item.name));
        native.chain(third_party)
    }

    pub fn load(path: &Path) -> Result<ResourceIndex, IndexError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
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
    fn entries_group_per_type() {
        let mut index = ResourceIndex::new();
        index.add_native_entry(
            intern("texture_t"),
            intern("stone"),
            NativeItemFormat::Binary,
            "deploy/main/stone.bin",
        );
        index.add_native_entry(
            intern("texture_t"),
            intern("moss"),
            NativeItemFormat::ReadableData,
            "deploy/main/moss.rd",
        );
        index.add_third_party_entry(intern("theme.ogg"), "deploy/main/theme.ogg", 4096);

        assert_eq!(index.native.len(), 1);
        assert_eq!(index.native[0].items.len(), 2);
        assert!(index.find_native(intern("texture_t"), intern("moss")).is_some());
        assert_eq!(index.keys().count(), 3);
    }
}
