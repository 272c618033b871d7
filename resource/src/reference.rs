//! Reference graph: which fields of which types may name other resources,
//! and detection of the references held by a concrete instance.

use crate::reflect::{
    FieldArchetype, FieldView, Patch, PatchValue, ReferenceFlags, Resource, TypeRegistry,
};
use fxhash::{FxHashMap, FxHashSet};
use kiln_base::InternedString;

/// One field worth checking while scanning an instance of the owning type.
#[derive(Clone, Copy, Debug)]
pub struct ReferencerField {
    pub field_index: usize,
    pub archetype: FieldArchetype,
    /// Referenced resource type for leaves, nested struct type for
    /// transitional fields. Patch targets are only known at detection time.
    pub target_type: Option<InternedString>,
    pub flags: ReferenceFlags,
    pub is_leaf: bool,
}

pub struct TypeReferenceInfo {
    pub type_name: InternedString,
    pub fields_to_check: Vec<ReferencerField>,
    /// Resource types that are able to reference resources of this type.
    pub referencer_types: Vec<InternedString>,
    pub is_resource_type: bool,
    pub contains_patches: bool,
}

/// Processed reflection data for reference detection, built once per
/// registry.
pub struct ReferenceTypeInfoStorage {
    types: FxHashMap<InternedString, TypeReferenceInfo>,
}

impl ReferenceTypeInfoStorage {
    pub fn build(registry: &TypeRegistry) -> ReferenceTypeInfoStorage {
        let contains = compute_containment(registry);

        let mut types = FxHashMap::default();
        for ty in registry.iter() {
            let mut fields_to_check = Vec::new();
            let mut contains_patches = false;

            for (field_index, field) in ty.fields.iter().enumerate() {
                match field.archetype {
                    FieldArchetype::InternedString => {
                        if let Some(meta) = field.reference {
                            fields_to_check.push(ReferencerField {
                                field_index,
                                archetype: field.archetype,
                                target_type: Some(meta.target_type),
                                flags: meta.flags,
                                is_leaf: true,
                            });
                        }
                    }
                    FieldArchetype::Struct(inner) | FieldArchetype::StructArray(inner) => {
                        if contains.contains(&inner) {
                            fields_to_check.push(ReferencerField {
                                field_index,
                                archetype: field.archetype,
                                target_type: Some(inner),
                                flags: ReferenceFlags::empty(),
                                is_leaf: false,
                            });
                        }
                    }
                    FieldArchetype::Patch => {
                        contains_patches = true;
                        fields_to_check.push(ReferencerField {
                            field_index,
                            archetype: field.archetype,
                            target_type: None,
                            flags: ReferenceFlags::empty(),
                            is_leaf: false,
                        });
                    }
                }
            }

            types.insert(
                ty.name,
                TypeReferenceInfo {
                    type_name: ty.name,
                    fields_to_check,
                    referencer_types: Vec::new(),
                    is_resource_type: ty.is_resource_type,
                    contains_patches,
                },
            );
        }

        let mut storage = ReferenceTypeInfoStorage { types };
        storage.build_reverse_map(registry);
        storage
    }

    pub fn query(&self, type_name: InternedString) -> Option<&TypeReferenceInfo> {
        self.types.get(&type_name)
    }

    fn build_reverse_map(&mut self, registry: &TypeRegistry) {
        let mut referencers: FxHashMap<InternedString, Vec<InternedString>> = FxHashMap::default();

        for ty in registry.iter() {
            if !ty.is_resource_type {
                continue;
            }

            let mut targets = FxHashSet::default();
            let mut visited = FxHashSet::default();
            collect_leaf_targets(self, ty.name, &mut targets, &mut visited);

            for target in targets {
                referencers.entry(target).or_insert_with(Vec::new).push(ty.name);
            }
        }

        for (target, mut types) in referencers {
            types.sort();
            types.dedup();
            if let Some(info) = self.types.get_mut(&target) {
                info.referencer_types = types;
            }
        }
    }
}

fn collect_leaf_targets(
    storage: &ReferenceTypeInfoStorage,
    type_name: InternedString,
    targets: &mut FxHashSet<InternedString>,
    visited: &mut FxHashSet<InternedString>,
) {
    if !visited.insert(type_name) {
        return;
    }
    let info = match storage.query(type_name) {
        Some(info) => info,
        None => return,
    };

    for field in &info.fields_to_check {
        if field.is_leaf {
            if let Some(target) = field.target_type {
                targets.insert(target);
            }
        } else if let Some(inner) = field.target_type {
            collect_leaf_targets(storage, inner, targets, visited);
        }
        // Patch targets are unknown until detection time.
    }
}

/// Fixpoint over the registry: the set of types that transitively contain
/// leaf referencer fields or patches. Cycles between struct types are fine.
fn compute_containment(registry: &TypeRegistry) -> FxHashSet<InternedString> {
    let mut contains = FxHashSet::default();
    loop {
        let mut changed = false;
        for ty in registry.iter() {
            if contains.contains(&ty.name) {
                continue;
            }

            let found = ty.fields.iter().any(|field| match field.archetype {
                FieldArchetype::InternedString => field.reference.is_some(),
                FieldArchetype::Struct(inner) | FieldArchetype::StructArray(inner) => {
                    contains.contains(&inner)
                }
                FieldArchetype::Patch => true,
            });

            if found {
                contains.insert(ty.name);
                changed = true;
            }
        }

        if !changed {
            return contains;
        }
    }
}

//--------------------------------------------------------------------------------------------------

/// Reference found while scanning an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectedReference {
    pub ty: InternedString,
    pub name: InternedString,
    pub flags: ReferenceFlags,
}

/// Walks `instance` guided by the referencer tables and appends every
/// reference it holds, in traversal order and with duplicates preserved.
pub fn detect_references(
    registry: &TypeRegistry,
    storage: &ReferenceTypeInfoStorage,
    type_name: InternedString,
    instance: &dyn Resource,
    output: &mut Vec<DetectedReference>,
) {
    let info = match storage.query(type_name) {
        Some(info) => info,
        None => return,
    };
    let ty = match registry.get(type_name) {
        Some(ty) => ty,
        None => return,
    };

    for referencer in &info.fields_to_check {
        let field = &ty.fields[referencer.field_index];
        match field.get(instance) {
            FieldView::Name(Some(name)) => {
                if let Some(target) = referencer.target_type {
                    output.push(DetectedReference {
                        ty: target,
                        name,
                        flags: referencer.flags,
                    });
                }
            }
            FieldView::Name(None) => {}
            FieldView::Struct(inner) => {
                if let Some(inner_type) = referencer.target_type {
                    detect_references(registry, storage, inner_type, inner, output);
                }
            }
            FieldView::StructArray(elements) => {
                if let Some(inner_type) = referencer.target_type {
                    for element in elements {
                        detect_references(registry, storage, inner_type, element, output);
                    }
                }
            }
            FieldView::Patch(patch) => {
                detect_patch_references(registry, patch, output);
            }
        }
    }
}

fn detect_patch_references(
    registry: &TypeRegistry,
    patch: &Patch,
    output: &mut Vec<DetectedReference>,
) {
    let target = match registry.get(patch.target_type) {
        Some(target) => target,
        None => return,
    };

    for entry in &patch.entries {
        let field = match target.field(entry.field) {
            Some(field) => field,
            None => continue,
        };
        if let (Some(meta), PatchValue::Name(name)) = (field.reference, &entry.value) {
            output.push(DetectedReference {
                ty: meta.target_type,
                name: *name,
                flags: meta.flags,
            });
        }
    }
}

/// Merges detected references per `(type, name)` target, first-seen order:
/// the result is flagged `REQUIRED` iff no occurrence was
/// platform-optional.
pub fn merge_reference_flags(references: &[DetectedReference]) -> Vec<DetectedReference> {
    let mut order: Vec<(InternedString, InternedString)> = Vec::new();
    let mut merged: FxHashMap<(InternedString, InternedString), (ReferenceFlags, bool)> =
        FxHashMap::default();

    for reference in references {
        let key = (reference.ty, reference.name);
        let entry = merged.entry(key).or_insert_with(|| {
            order.push(key);
            (ReferenceFlags::empty(), true)
        });
        entry.0 |= reference.flags;
        if reference.flags.contains(ReferenceFlags::PLATFORM_OPTIONAL) {
            entry.1 = false;
        }
    }

    order
        .into_iter()
        .map(|key| {
            let (mut flags, required) = merged[&key];
            flags.set(ReferenceFlags::REQUIRED, required);
            DetectedReference {
                ty: key.0,
                name: key.1,
                flags,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{Field, FieldView, PatchEntry, ReferenceMeta, StructType};
    use kiln_base::intern;

    struct TestDetail {
        mask: InternedString,
    }
    impl Resource for TestDetail {}

    struct TestLayer {
        overlay: InternedString,
    }
    impl Resource for TestLayer {}

    struct TestMaterial {
        albedo: InternedString,
        normal: InternedString,
        detail: TestDetail,
        layers: Vec<TestLayer>,
        patch: Patch,
    }
    impl Resource for TestMaterial {}

    fn texture_reference(flags: ReferenceFlags) -> Option<ReferenceMeta> {
        Some(ReferenceMeta {
            target_type: intern("texture_t"),
            flags,
        })
    }

    fn optional_name(name: InternedString) -> Option<InternedString> {
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    fn test_registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();

        registry.register(StructType {
            name: intern("texture_t"),
            version: 1,
            is_resource_type: true,
            fields: Vec::new(),
        });

        registry.register(StructType {
            name: intern("test_detail_t"),
            version: 1,
            is_resource_type: false,
            fields: vec![Field::new(
                intern("mask"),
                FieldArchetype::InternedString,
                texture_reference(ReferenceFlags::empty()),
                |instance| {
                    let detail = instance.downcast_ref::<TestDetail>().unwrap();
                    FieldView::Name(optional_name(detail.mask))
                },
            )],
        });

        registry.register(StructType {
            name: intern("test_layer_t"),
            version: 1,
            is_resource_type: false,
            fields: vec![Field::new(
                intern("overlay"),
                FieldArchetype::InternedString,
                texture_reference(ReferenceFlags::empty()),
                |instance| {
                    let layer = instance.downcast_ref::<TestLayer>().unwrap();
                    FieldView::Name(optional_name(layer.overlay))
                },
            )],
        });

        registry.register(StructType {
            name: intern("test_material_t"),
            version: 1,
            is_resource_type: true,
            fields: vec![
                Field::new(
                    intern("albedo"),
                    FieldArchetype::InternedString,
                    texture_reference(ReferenceFlags::empty()),
                    |instance| {
                        let material = instance.downcast_ref::<TestMaterial>().unwrap();
                        FieldView::Name(optional_name(material.albedo))
                    },
                ),
                Field::new(
                    intern("normal"),
                    FieldArchetype::InternedString,
                    texture_reference(ReferenceFlags::PLATFORM_OPTIONAL),
                    |instance| {
                        let material = instance.downcast_ref::<TestMaterial>().unwrap();
                        FieldView::Name(optional_name(material.normal))
                    },
                ),
                Field::new(
                    intern("detail"),
                    FieldArchetype::Struct(intern("test_detail_t")),
                    None,
                    |instance| {
                        let material = instance.downcast_ref::<TestMaterial>().unwrap();
                        FieldView::Struct(&material.detail)
                    },
                ),
                Field::new(
                    intern("layers"),
                    FieldArchetype::StructArray(intern("test_layer_t")),
                    None,
                    |instance| {
                        let material = instance.downcast_ref::<TestMaterial>().unwrap();
                        FieldView::StructArray(
                            material.layers.iter().map(|layer| layer as &dyn Resource).collect(),
                        )
                    },
                ),
                Field::new(intern("patch"), FieldArchetype::Patch, None, |instance| {
                    let material = instance.downcast_ref::<TestMaterial>().unwrap();
                    FieldView::Patch(&material.patch)
                }),
            ],
        });

        registry
    }

    fn test_material() -> TestMaterial {
        TestMaterial {
            albedo: intern("stone_albedo"),
            normal: intern("stone_normal"),
            detail: TestDetail {
                mask: intern("stone_mask"),
            },
            layers: vec![
                TestLayer {
                    overlay: intern("moss"),
                },
                TestLayer {
                    overlay: intern("stone_albedo"),
                },
            ],
            patch: Patch {
                target_type: intern("test_detail_t"),
                entries: vec![
                    PatchEntry {
                        field: intern("mask"),
                        value: PatchValue::Name(intern("patched_mask")),
                    },
                    PatchEntry {
                        field: intern("unknown_field"),
                        value: PatchValue::Number(3),
                    },
                ],
            },
        }
    }

    #[test]
    fn detection_matches_manual_walk() {
        let registry = test_registry();
        let storage = ReferenceTypeInfoStorage::build(&registry);
        let material = test_material();

        let mut detected = Vec::new();
        detect_references(
            &registry,
            &storage,
            intern("test_material_t"),
            &material,
            &mut detected,
        );

        let names: Vec<&str> = detected.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "stone_albedo",
                "stone_normal",
                "stone_mask",
                "moss",
                "stone_albedo",
                "patched_mask",
            ]
        );
        assert!(detected.iter().all(|r| r.ty == intern("texture_t")));
    }

    #[test]
    fn empty_names_are_skipped() {
        let registry = test_registry();
        let storage = ReferenceTypeInfoStorage::build(&registry);
        let mut material = test_material();
        material.normal = intern("");
        material.layers.clear();
        material.patch.entries.clear();

        let mut detected = Vec::new();
        detect_references(
            &registry,
            &storage,
            intern("test_material_t"),
            &material,
            &mut detected,
        );
        let names: Vec<&str> = detected.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["stone_albedo", "stone_mask"]);
    }

    #[test]
    fn reverse_map_lists_referencers() {
        let registry = test_registry();
        let storage = ReferenceTypeInfoStorage::build(&registry);
        let info = storage.query(intern("texture_t")).unwrap();
        assert_eq!(info.referencer_types, vec![intern("test_material_t")]);
    }

    #[test]
    fn required_merge() {
        let registry = test_registry();
        let storage = ReferenceTypeInfoStorage::build(&registry);
        let material = test_material();

        let mut detected = Vec::new();
        detect_references(
            &registry,
            &storage,
            intern("test_material_t"),
            &material,
            &mut detected,
        );
        let merged = merge_reference_flags(&detected);

        let required = |name: &str| {
            merged
                .iter()
                .find(|r| r.name == intern(name))
                .unwrap()
                .flags
                .contains(ReferenceFlags::REQUIRED)
        };
        // stone_normal only appeared with the platform-optional attribute.
        assert!(required("stone_albedo"));
        assert!(!required("stone_normal"));
        assert!(required("moss"));
    }
}
