//! Per-type codec hooks.
//!
//! The serialization formats themselves are external collaborators; the
//! pipeline only needs, per resource type, a way to decode a payload into
//! an instance, encode an instance back, and an optional init functor run
//! after load. Readable-data payloads use the serde codec; binary payloads
//! are whatever the type registers.

use crate::ident::PayloadKind;
use crate::reflect::Resource;
use fxhash::FxHashMap;
use kiln_base::InternedString;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode resource payload: {0}")]
    Decode(String),
    #[error("failed to encode resource payload: {0}")]
    Encode(String),
    #[error("no codec registered for this payload format")]
    UnsupportedFormat,
}

pub type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Resource>, CodecError> + Send + Sync>;
pub type EncodeFn = Box<dyn Fn(&dyn Resource) -> Result<Vec<u8>, CodecError> + Send + Sync>;
pub type InitFn = Box<dyn Fn(&mut dyn Resource) + Send + Sync>;

/// Codec and lifecycle hooks for one registered resource type.
pub struct ResourceTypeOps {
    pub name: InternedString,
    pub type_version: u64,
    decode_readable: Option<DecodeFn>,
    encode_readable: Option<EncodeFn>,
    decode_binary: Option<DecodeFn>,
    init: Option<InitFn>,
}

impl ResourceTypeOps {
    pub fn new(name: InternedString, type_version: u64) -> ResourceTypeOps {
        ResourceTypeOps {
            name,
            type_version,
            decode_readable: None,
            encode_readable: None,
            decode_binary: None,
            init: None,
        }
    }

    /// Registers the serde readable-data codec for `T`.
    pub fn with_serde_readable<T>(mut self) -> ResourceTypeOps
    where
        T: Resource + Serialize + DeserializeOwned,
    {
        self.decode_readable = Some(Box::new(|bytes| {
            serde_json::from_slice::<T>(bytes)
                .map(|value| Box::new(value) as Box<dyn Resource>)
                .map_err(|error| CodecError::Decode(error.to_string()))
        }));
        self.encode_readable = Some(Box::new(|instance| {
            let concrete = instance
                .downcast_ref::<T>()
                .ok_or_else(|| CodecError::Encode("instance type mismatch".to_owned()))?;
            serde_json::to_vec_pretty(concrete)
                .map_err(|error| CodecError::Encode(error.to_string()))
        }));
        self
    }

    pub fn with_binary_decoder(mut self, decode: DecodeFn) -> ResourceTypeOps {
        self.decode_binary = Some(decode);
        self
    }

    pub fn with_init(mut self, init: impl Fn(&mut dyn Resource) + Send + Sync + 'static) -> ResourceTypeOps {
        self.init = Some(Box::new(init));
        self
    }

    pub fn decode(&self, kind: PayloadKind, bytes: &[u8]) -> Result<Box<dyn Resource>, CodecError> {
        let decoder = match kind {
            PayloadKind::NativeReadableData => self.decode_readable.as_ref(),
            PayloadKind::NativeBinary => self.decode_binary.as_ref(),
            PayloadKind::ThirdParty => None,
        };
        let decoder = decoder.ok_or(CodecError::UnsupportedFormat)?;
        let mut instance = decoder(bytes)?;
        if let Some(init) = &self.init {
            init(instance.as_mut());
        }
        Ok(instance)
    }

    pub fn encode_readable(&self, instance: &dyn Resource) -> Result<Vec<u8>, CodecError> {
        let encoder = self.encode_readable.as_ref().ok_or(CodecError::UnsupportedFormat)?;
        encoder(instance)
    }
}

/// All registered resource types, keyed by type name.
#[derive(Default)]
pub struct CodecRegistry {
    types: FxHashMap<InternedString, ResourceTypeOps>,
}

impl CodecRegistry {
    pub fn new() -> CodecRegistry {
        CodecRegistry::default()
    }

    pub fn register(&mut self, ops: ResourceTypeOps) {
        let previous = self.types.insert(ops.name, ops);
        debug_assert!(previous.is_none(), "codec registered twice for one type");
    }

    pub fn get(&self, name: InternedString) -> Option<&ResourceTypeOps> {
        self.types.get(&name)
    }

    pub fn type_version(&self, name: InternedString) -> Option<u64> {
        self.types.get(&name).map(|ops| ops.type_version)
    }
}

/// Third-party payloads load as raw byte ranges.
pub struct ThirdPartyBytes {
    pub bytes: Vec<u8>,
}

impl Resource for ThirdPartyBytes {}
