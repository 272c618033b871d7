//! Resource pipeline: identity, reflection-driven reference discovery, the
//! on-disk index, the durable build log, and the build planner that keeps
//! the log and outputs up to date.

pub mod codec;
pub mod ident;
pub mod index;
pub mod log;
pub mod planner;
pub mod reference;
pub mod reflect;

pub use self::codec::{CodecError, CodecRegistry, ResourceTypeOps, ThirdPartyBytes};
pub use self::ident::{classify_path, PayloadKind, ResourceKey};
pub use self::index::{NativeItemFormat, ResourceIndex};
pub use self::log::{BuildLog, EntryVersion, SavedDirectory};
pub use self::planner::{
    BuildOutcome, BuildRule, BuildRuleContext, BuildTargetDescription, Planner, WorkspacePaths,
};
pub use self::reference::{
    detect_references, merge_reference_flags, DetectedReference, ReferenceTypeInfoStorage,
};
pub use self::reflect::{
    Field, FieldArchetype, FieldView, Patch, PatchEntry, PatchValue, ReferenceFlags, ReferenceMeta,
    Resource, StructType, TypeRegistry,
};
