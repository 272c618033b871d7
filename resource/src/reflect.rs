//! The reflection surface the resource pipeline consumes.
//!
//! The registry implementation itself lives outside the core; resource code
//! only needs struct descriptions, reference attributes on fields, and a
//! way to read a field out of an instance. Fields that may name other
//! resources are interned-string fields carrying a [`ReferenceMeta`];
//! struct, struct-array and patch fields are walked transitively.

use bitflags::bitflags;
use downcast_rs::{impl_downcast, DowncastSync};
use fxhash::FxHashMap;
use kiln_base::InternedString;

/// A reflected resource instance.
pub trait Resource: DowncastSync {}
impl_downcast!(sync Resource);

bitflags! {
    pub struct ReferenceFlags: u32 {
        /// Set on detected references when no occurrence was
        /// platform-optional.
        const REQUIRED = 1 << 0;
        /// The referenced resource may be missing on some platforms without
        /// failing the build.
        const PLATFORM_OPTIONAL = 1 << 1;
        /// An empty name is a valid value for the field.
        const NULLABLE = 1 << 2;
    }
}

/// Reference attribute on an interned-string field.
#[derive(Clone, Copy, Debug)]
pub struct ReferenceMeta {
    pub target_type: InternedString,
    pub flags: ReferenceFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldArchetype {
    InternedString,
    Struct(InternedString),
    StructArray(InternedString),
    Patch,
}

/// View into one field of an instance.
pub enum FieldView<'a> {
    /// Interned-string field value; `None` when empty.
    Name(Option<InternedString>),
    Struct(&'a dyn Resource),
    StructArray(Vec<&'a dyn Resource>),
    Patch(&'a Patch),
}

type FieldGetter = Box<dyn Fn(&dyn Resource) -> FieldView<'_> + Send + Sync>;

pub struct Field {
    pub name: InternedString,
    pub archetype: FieldArchetype,
    pub reference: Option<ReferenceMeta>,
    getter: FieldGetter,
}

impl Field {
    pub fn new(
        name: InternedString,
        archetype: FieldArchetype,
        reference: Option<ReferenceMeta>,
        getter: impl Fn(&dyn Resource) -> FieldView<'_> + Send + Sync + 'static,
    ) -> Field {
        debug_assert!(
            reference.is_none() || archetype == FieldArchetype::InternedString,
            "reference attributes are only valid on interned-string fields"
        );
        Field {
            name,
            archetype,
            reference,
            getter: Box::new(getter),
        }
    }

    pub fn get<'a>(&self, instance: &'a dyn Resource) -> FieldView<'a> {
        (self.getter)(instance)
    }
}

pub struct StructType {
    pub name: InternedString,
    pub version: u64,
    pub is_resource_type: bool,
    pub fields: Vec<Field>,
}

impl StructType {
    pub fn field(&self, name: InternedString) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Default)]
pub struct TypeRegistry {
    types: FxHashMap<InternedString, StructType>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            types: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, ty: StructType) {
        let previous = self.types.insert(ty.name, ty);
        debug_assert!(previous.is_none(), "type registered twice");
    }

    pub fn get(&self, name: InternedString) -> Option<&StructType> {
        self.types.get(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StructType> {
        self.types.values()
    }
}

//--------------------------------------------------------------------------------------------------

/// A serialized set of field overrides targeting one struct type. Only the
/// overridden fields are present; reference detection visits the entries
/// whose target field is a leaf referencer.
#[derive(Clone, Debug)]
pub struct Patch {
    pub target_type: InternedString,
    pub entries: Vec<PatchEntry>,
}

#[derive(Clone, Debug)]
pub struct PatchEntry {
    pub field: InternedString,
    pub value: PatchValue,
}

#[derive(Clone, Debug)]
pub enum PatchValue {
    Name(InternedString),
    Number(i64),
    Text(String),
}
