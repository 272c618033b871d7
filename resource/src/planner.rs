//! Build planner: scans raw resources, decides what is up to date against
//! the previous log, runs build rules in dependency order, and assembles
//! the next log and index.

use crate::codec::{CodecRegistry, ThirdPartyBytes};
use crate::ident::{
    classify_path, PayloadKind, ResourceKey, RESOURCE_INDEX_DEFAULT_NAME, RESOURCE_LOG_DEFAULT_NAME,
};
use crate::index::{NativeItemFormat, ResourceIndex};
use crate::log::{
    BuildLog, BuiltEntry, EntryVersion, LogReference, ProducerRecord, RawEntry, SavedDirectory,
    SecondaryEntry, SecondaryInput, TargetLog,
};
use crate::reference::{detect_references, merge_reference_flags, ReferenceTypeInfoStorage};
use crate::reflect::{ReferenceFlags, Resource, TypeRegistry};
use fxhash::{FxHashMap, FxHashSet};
use kiln_base::InternedString;
use petgraph::algo::toposort;
use petgraph::Graph;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

//--------------------------------------------------------------------------------------------------

/// Workspace directory layout: `deploy/<target>`, `cache/<target>`,
/// `temporary/<target>`, plus the per-target index and log files.
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> WorkspacePaths {
        WorkspacePaths { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn deploy_dir(&self, target: InternedString) -> PathBuf {
        self.root.join("deploy").join(target.as_str())
    }

    pub fn cache_dir(&self, target: InternedString) -> PathBuf {
        self.root.join("cache").join(target.as_str())
    }

    pub fn temporary_dir(&self, target: InternedString) -> PathBuf {
        self.root.join("temporary").join(target.as_str())
    }

    pub fn index_path(&self, target: InternedString) -> PathBuf {
        self.root.join(target.as_str()).join(RESOURCE_INDEX_DEFAULT_NAME)
    }

    pub fn log_path(&self, target: InternedString) -> PathBuf {
        self.root.join(target.as_str()).join(RESOURCE_LOG_DEFAULT_NAME)
    }

    pub fn saved_dir(&self, directory: SavedDirectory, target: InternedString) -> Option<PathBuf> {
        match directory {
            SavedDirectory::Deploy => Some(self.deploy_dir(target)),
            SavedDirectory::Cache => Some(self.cache_dir(target)),
            SavedDirectory::Unsupported => None,
        }
    }

    /// Resolves a path stored in an index or log entry.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

pub fn modification_time_ns(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_nanos() as u64)
}

//--------------------------------------------------------------------------------------------------

pub enum BuildOutcome {
    Success(Box<dyn Resource>),
    Failure,
    /// The rule cannot produce this resource for the current platform. Not
    /// an error unless some incoming reference requires the output.
    Unsupported,
}

/// Converts a primary input (plus optional secondary inputs) into a primary
/// output and optional secondary outputs.
pub trait BuildRule: Send + Sync {
    fn name(&self) -> InternedString;
    fn version(&self) -> u64;
    fn primary_input_type(&self) -> InternedString;
    fn output_type(&self) -> InternedString;

    /// Types this rule may pull in through
    /// [`BuildRuleContext::secondary_input`]; used for build ordering.
    fn secondary_input_types(&self) -> Vec<InternedString> {
        Vec::new()
    }

    fn build(&self, context: &mut BuildRuleContext) -> BuildOutcome;
}

struct AvailableInput {
    version: EntryVersion,
    instance: Box<dyn Resource>,
}

struct ProducedSecondary {
    ty: InternedString,
    name: InternedString,
    instance: Box<dyn Resource>,
}

pub struct BuildRuleContext<'a> {
    pub target: InternedString,
    pub primary_input_name: InternedString,
    pub primary_input: &'a dyn Resource,
    available: &'a FxHashMap<ResourceKey, AvailableInput>,
    consumed: Vec<SecondaryInput>,
    produced: Vec<ProducedSecondary>,
}

impl<'a> BuildRuleContext<'a> {
    /// Resolves a secondary input and records it, with its current version,
    /// in the produced log entry.
    pub fn secondary_input(
        &mut self,
        ty: Option<InternedString>,
        name: InternedString,
    ) -> Option<&'a dyn Resource> {
        let key = ResourceKey { ty, name };
        let input = self.available.get(&key)?;
        if !self
            .consumed
            .iter()
            .any(|consumed| consumed.ty == ty && consumed.name == name)
        {
            self.consumed.push(SecondaryInput {
                ty,
                name,
                version: input.version,
            });
        }
        Some(input.instance.as_ref())
    }

    /// Registers a side output of this build. Identical `(type, name)`
    /// arguments within one invocation deduplicate.
    pub fn produce_secondary_output(
        &mut self,
        ty: InternedString,
        name: InternedString,
        instance: Box<dyn Resource>,
    ) {
        if self
            .produced
            .iter()
            .any(|produced| produced.ty == ty && produced.name == name)
        {
            return;
        }
        self.produced.push(ProducedSecondary { ty, name, instance });
    }
}

//--------------------------------------------------------------------------------------------------

pub struct BuildTargetDescription {
    pub name: InternedString,
    /// Raw resources, laid out as `<source>/<type>/<file>` for native items
    /// and `<source>/<file>` for third-party items.
    pub source_directory: PathBuf,
}

#[derive(Debug, Default)]
pub struct PlanReport {
    pub up_to_date: Vec<ResourceKey>,
    pub built: Vec<ResourceKey>,
    pub failed: Vec<ResourceKey>,
    pub unsupported: Vec<ResourceKey>,
    pub success: bool,
}

pub struct Planner<'a> {
    pub registry: &'a TypeRegistry,
    pub codecs: &'a CodecRegistry,
    pub references: &'a ReferenceTypeInfoStorage,
    pub rules: &'a [Box<dyn BuildRule>],
    pub paths: &'a WorkspacePaths,
    pub platform_configuration_time_ns: u64,
}

struct ScannedRaw {
    ty: InternedString,
    name: InternedString,
    path: PathBuf,
    kind: PayloadKind,
    format: NativeItemFormat,
    mtime_ns: u64,
}

impl<'a> Planner<'a> {
    /// Runs every target, loading the previous log and persisting the new
    /// log and index per target. Returns overall success.
    pub fn execute(&self, targets: &[BuildTargetDescription]) -> bool {
        let mut all_success = true;
        for target in targets {
            let log_path = self.paths.log_path(target.name);
            let previous = BuildLog::load(&log_path).unwrap_or_else(|_| BuildLog::new());
            let (target_log, index, report) = self.execute_target(&previous, target);

            // The log is rebuilt by copy on every run.
            let mut log = BuildLog::new();
            log.replace_target(target_log);
            if let Err(error) = log.save(&log_path) {
                log::error!("failed to save resource log for {}: {}", target.name, error);
                all_success = false;
            }
            if let Err(error) = index.save(&self.paths.index_path(target.name)) {
                log::error!("failed to save resource index for {}: {}", target.name, error);
                all_success = false;
            }

            all_success &= report.success;
        }
        all_success
    }

    pub fn execute_target(
        &self,
        previous: &BuildLog,
        target: &BuildTargetDescription,
    ) -> (TargetLog, ResourceIndex, PlanReport) {
        let empty = TargetLog::default();
        let prev = previous.target(target.name).unwrap_or(&empty);

        let mut report = PlanReport {
            success: true,
            ..PlanReport::default()
        };
        let mut new_log = TargetLog::new(target.name);
        let mut index = ResourceIndex::new();
        let mut available: FxHashMap<ResourceKey, AvailableInput> = FxHashMap::default();

        let raws = self.scan_raw(target, &mut report, &mut index, &mut available);
        self.record_raw_entries(target, prev, &raws, &mut new_log, &mut index, &mut report, &mut available);

        let expected_outputs = self.expected_outputs(&raws);
        for rule_index in self.rule_order() {
            let rule = &self.rules[rule_index];
            self.run_rule(
                rule.as_ref(),
                target,
                prev,
                &raws,
                &expected_outputs,
                &mut new_log,
                &mut index,
                &mut report,
                &mut available,
            );
        }

        self.check_references(&new_log, &available, &expected_outputs, &mut report);
        (new_log, index, report)
    }

    //----------------------------------------------------------------------------------------------

    fn scan_raw(
        &self,
        target: &BuildTargetDescription,
        report: &mut PlanReport,
        index: &mut ResourceIndex,
        available: &mut FxHashMap<ResourceKey, AvailableInput>,
    ) -> Vec<ScannedRaw> {
        let mut raws = Vec::new();
        let mut entries = match fs::read_dir(&target.source_directory) {
            Ok(entries) => entries.filter_map(Result::ok).collect::<Vec<_>>(),
            Err(error) => {
                log::error!(
                    "cannot scan source directory {}: {}",
                    target.source_directory.display(),
                    error
                );
                report.success = false;
                return raws;
            }
        };
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                let ty = match path.file_name().and_then(|name| name.to_str()) {
                    Some(name) => kiln_base::intern(name),
                    None => continue,
                };
                if self.codecs.get(ty).is_none() {
                    log::warn!("skipping source directory for unregistered type {}", ty);
                    continue;
                }

                let mut files = match fs::read_dir(&path) {
                    Ok(files) => files.filter_map(Result::ok).collect::<Vec<_>>(),
                    Err(_) => continue,
                };
                files.sort_by_key(|file| file.file_name());

                for file in files {
                    let file_path = file.path();
                    match classify_path(&file_path) {
                        Some((name, kind @ PayloadKind::NativeBinary))
                        | Some((name, kind @ PayloadKind::NativeReadableData)) => {
                            let format = match kind {
                                PayloadKind::NativeBinary => NativeItemFormat::Binary,
                                _ => NativeItemFormat::ReadableData,
                            };
                            raws.push(ScannedRaw {
                                ty,
                                name,
                                mtime_ns: modification_time_ns(&file_path).unwrap_or(0),
                                path: file_path,
                                kind,
                                format,
                            });
                        }
                        _ => {
                            log::warn!(
                                "ignoring non-native file inside type directory: {}",
                                file_path.display()
                            );
                        }
                    }
                }
            } else {
                // Top-level files are third-party items; they keep their
                // full file name.
                let name = match path.file_name().and_then(|name| name.to_str()) {
                    Some(name) => kiln_base::intern(name),
                    None => continue,
                };
                match fs::read(&path) {
                    Ok(bytes) => {
                        let size = bytes.len() as u64;
                        let mtime = modification_time_ns(&path).unwrap_or(0);
                        let relative = format!("deploy/{}/{}", target.name, name);
                        if self
                            .copy_into(&path, &self.deploy_file(target.name, name.as_str()))
                            .is_err()
                        {
                            report.success = false;
                            continue;
                        }
                        available.insert(
                            ResourceKey::third_party(name),
                            AvailableInput {
                                version: EntryVersion::new(0, mtime),
                                instance: Box::new(ThirdPartyBytes { bytes }),
                            },
                        );
                        index.add_third_party_entry(name, &relative, size);
                    }
                    Err(error) => {
                        log::error!("cannot read third-party file {}: {}", path.display(), error);
                        report.success = false;
                    }
                }
            }
        }
        raws
    }

    fn record_raw_entries(
        &self,
        target: &BuildTargetDescription,
        prev: &TargetLog,
        raws: &[ScannedRaw],
        new_log: &mut TargetLog,
        index: &mut ResourceIndex,
        report: &mut PlanReport,
        available: &mut FxHashMap<ResourceKey, AvailableInput>,
    ) {
        let consumed_types: FxHashSet<InternedString> = self
            .rules
            .iter()
            .map(|rule| rule.primary_input_type())
            .collect();

        for raw in raws {
            let key = ResourceKey::native(raw.ty, raw.name);
            let ops = self.codecs.get(raw.ty).expect("scanned type is registered");
            let version = EntryVersion::new(ops.type_version, raw.mtime_ns);

            let instance = match fs::read(&raw.path)
                .map_err(|error| error.to_string())
                .and_then(|bytes| ops.decode(raw.kind, &bytes).map_err(|error| error.to_string()))
            {
                Ok(instance) => instance,
                Err(error) => {
                    // Parse and io failures reject the artifact and leave
                    // the previous outputs in place.
                    log::error!("cannot load raw resource {}: {}", key, error);
                    report.failed.push(key);
                    report.success = false;
                    continue;
                }
            };

            let up_to_date = prev
                .find_raw(raw.ty, raw.name)
                .map(|entry| entry.version.is_up_to_date(version))
                .unwrap_or(false);
            let references = if up_to_date {
                prev.find_raw(raw.ty, raw.name).unwrap().references.clone()
            } else {
                self.detect_log_references(raw.ty, instance.as_ref())
            };

            let deployed = !consumed_types.contains(&raw.ty);
            if deployed {
                let file_name = format!("{}.{}", raw.name, extension_of(raw.format));
                if self
                    .copy_into(&raw.path, &self.deploy_file(target.name, &file_name))
                    .is_err()
                {
                    report.failed.push(key);
                    report.success = false;
                    continue;
                }
                index.add_native_entry(
                    raw.ty,
                    raw.name,
                    raw.format,
                    &format!("deploy/{}/{}", target.name, file_name),
                );
            }

            if up_to_date {
                report.up_to_date.push(key);
            }
            new_log.raw.push(RawEntry {
                ty: raw.ty,
                name: raw.name,
                version,
                deployed,
                references,
            });
            available.insert(key, AvailableInput { version, instance });
        }
    }

    fn expected_outputs(&self, raws: &[ScannedRaw]) -> FxHashSet<ResourceKey> {
        let mut outputs = FxHashSet::default();
        for rule in self.rules {
            for raw in raws.iter().filter(|raw| raw.ty == rule.primary_input_type()) {
                outputs.insert(ResourceKey::native(rule.output_type(), raw.name));
            }
        }
        outputs
    }

    /// Rules ordered so that producers of secondary-input types run before
    /// their consumers. Resource reference cycles are fine; a cycle between
    /// declared secondary-input edges is a configuration error.
    fn rule_order(&self) -> Vec<usize> {
        let mut graph = Graph::<usize, ()>::new();
        let nodes: Vec<_> = (0..self.rules.len()).map(|index| graph.add_node(index)).collect();
        for (producer_index, producer) in self.rules.iter().enumerate() {
            for (consumer_index, consumer) in self.rules.iter().enumerate() {
                if producer_index != consumer_index
                    && consumer
                        .secondary_input_types()
                        .contains(&producer.output_type())
                {
                    graph.add_edge(nodes[producer_index], nodes[consumer_index], ());
                }
            }
        }

        match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(|node| graph[node]).collect(),
            Err(_) => {
                log::error!("cycle in build rule secondary inputs; using declaration order");
                (0..self.rules.len()).collect()
            }
        }
    }

    fn run_rule(
        &self,
        rule: &dyn BuildRule,
        target: &BuildTargetDescription,
        prev: &TargetLog,
        raws: &[ScannedRaw],
        expected_outputs: &FxHashSet<ResourceKey>,
        new_log: &mut TargetLog,
        index: &mut ResourceIndex,
        report: &mut PlanReport,
        available: &mut FxHashMap<ResourceKey, AvailableInput>,
    ) {
        let output_type = rule.output_type();
        let output_ops = match self.codecs.get(output_type) {
            Some(ops) => ops,
            None => {
                log::error!("no codec registered for build output type {}", output_type);
                report.success = false;
                return;
            }
        };

        let candidates: Vec<(InternedString, EntryVersion)> = raws
            .iter()
            .filter(|raw| raw.ty == rule.primary_input_type())
            .filter_map(|raw| {
                available
                    .get(&ResourceKey::native(raw.ty, raw.name))
                    .map(|input| (raw.name, input.version))
            })
            .collect();

        for (name, primary_version) in candidates {
            let output_key = ResourceKey::native(output_type, name);

            if let Some(entry) = prev.find_built(output_type, name) {
                if self.built_entry_fresh(
                    entry,
                    rule,
                    output_ops.type_version,
                    primary_version,
                    target.name,
                    available,
                    expected_outputs,
                ) {
                    self.keep_built_entry(
                        entry, prev, target, new_log, index, report, available,
                    );
                    continue;
                }
            }

            self.build_candidate(
                rule,
                output_ops.type_version,
                target,
                name,
                primary_version,
                new_log,
                index,
                report,
                available,
            );
        }
    }

    fn built_entry_fresh(
        &self,
        entry: &BuiltEntry,
        rule: &dyn BuildRule,
        output_type_version: u64,
        primary_version: EntryVersion,
        target: InternedString,
        available: &FxHashMap<ResourceKey, AvailableInput>,
        expected_outputs: &FxHashSet<ResourceKey>,
    ) -> bool {
        if entry.rule_version != rule.version()
            || entry.platform_configuration_time_ns != self.platform_configuration_time_ns
            || entry.primary_input_version != primary_version
            || entry.version.type_version != output_type_version
        {
            return false;
        }

        for secondary in &entry.secondary_inputs {
            let key = ResourceKey {
                ty: secondary.ty,
                name: secondary.name,
            };
            match available.get(&key) {
                Some(input) if input.version == secondary.version => {}
                _ => return false,
            }
        }

        match entry.saved_directory {
            SavedDirectory::Unsupported => {}
            directory => {
                let path = match self.saved_file(directory, target, entry.name) {
                    Some(path) => path,
                    None => return false,
                };
                if modification_time_ns(&path) != Some(entry.version.last_modification_time_ns) {
                    return false;
                }
            }
        }

        // Required references must still point at something buildable.
        entry.references.iter().all(|reference| {
            if !reference.required {
                return true;
            }
            let key = ResourceKey {
                ty: reference.ty,
                name: reference.name,
            };
            available.contains_key(&key) || expected_outputs.contains(&key)
        })
    }

    fn keep_built_entry(
        &self,
        entry: &BuiltEntry,
        prev: &TargetLog,
        target: &BuildTargetDescription,
        new_log: &mut TargetLog,
        index: &mut ResourceIndex,
        report: &mut PlanReport,
        available: &mut FxHashMap<ResourceKey, AvailableInput>,
    ) {
        let key = ResourceKey::native(entry.ty, entry.name);
        report.up_to_date.push(key);

        if entry.saved_directory == SavedDirectory::Unsupported {
            report.unsupported.push(key);
            new_log.built.push(entry.clone());
            return;
        }

        match self.load_saved(entry.saved_directory, target.name, entry.ty, entry.name) {
            Ok(instance) => {
                available.insert(
                    key,
                    AvailableInput {
                        version: entry.version,
                        instance,
                    },
                );
                index.add_native_entry(
                    entry.ty,
                    entry.name,
                    NativeItemFormat::ReadableData,
                    &self.saved_relative(entry.saved_directory, target.name, entry.name),
                );
            }
            Err(error) => {
                log::error!("cannot reload kept output {}: {}", key, error);
                report.success = false;
            }
        }
        new_log.built.push(entry.clone());

        // Secondary entries ride along with their producer.
        for secondary in prev
            .secondary
            .iter()
            .filter(|secondary| {
                secondary.producer.ty == entry.ty
                    && secondary.producer.name == entry.name
                    && secondary.producer.version == entry.version
            })
        {
            let secondary_key = ResourceKey::native(secondary.ty, secondary.name);
            match self.load_saved(secondary.saved_directory, target.name, secondary.ty, secondary.name)
            {
                Ok(instance) => {
                    available.insert(
                        secondary_key,
                        AvailableInput {
                            version: secondary.version,
                            instance,
                        },
                    );
                    index.add_native_entry(
                        secondary.ty,
                        secondary.name,
                        NativeItemFormat::ReadableData,
                        &self.saved_relative(secondary.saved_directory, target.name, secondary.name),
                    );
                    new_log.secondary.push(secondary.clone());
                }
                Err(error) => {
                    log::error!("cannot reload kept secondary {}: {}", secondary_key, error);
                    report.success = false;
                }
            }
        }
    }

    fn build_candidate(
        &self,
        rule: &dyn BuildRule,
        output_type_version: u64,
        target: &BuildTargetDescription,
        name: InternedString,
        primary_version: EntryVersion,
        new_log: &mut TargetLog,
        index: &mut ResourceIndex,
        report: &mut PlanReport,
        available: &mut FxHashMap<ResourceKey, AvailableInput>,
    ) {
        let output_type = rule.output_type();
        let output_key = ResourceKey::native(output_type, name);
        let primary_key = ResourceKey::native(rule.primary_input_type(), name);

        let (outcome, consumed, produced) = {
            let primary = match available.get(&primary_key) {
                Some(input) => input.instance.as_ref(),
                None => return,
            };
            let mut context = BuildRuleContext {
                target: target.name,
                primary_input_name: name,
                primary_input: primary,
                available,
                consumed: Vec::new(),
                produced: Vec::new(),
            };
            let outcome = rule.build(&mut context);
            (outcome, context.consumed, context.produced)
        };

        match outcome {
            BuildOutcome::Success(output) => {
                let version = match self.write_output(target.name, output_type, name, output.as_ref())
                {
                    Ok(version) => version,
                    Err(error) => {
                        log::error!("cannot write output {}: {}", output_key, error);
                        report.failed.push(output_key);
                        report.success = false;
                        return;
                    }
                };

                // Secondary outputs only materialize once the whole build
                // succeeded; a failed write rolls the ones already written
                // back.
                let mut written = Vec::new();
                let mut secondary_entries = Vec::new();
                let mut rolled_back = false;
                for item in &produced {
                    match self.write_output(target.name, item.ty, item.name, item.instance.as_ref())
                    {
                        Ok(secondary_version) => {
                            written.push((item.ty, item.name));
                            secondary_entries.push(SecondaryEntry {
                                ty: item.ty,
                                name: item.name,
                                version: secondary_version,
                                saved_directory: SavedDirectory::Cache,
                                producer: ProducerRecord {
                                    ty: output_type,
                                    name,
                                    version,
                                },
                                references: self.detect_log_references(item.ty, item.instance.as_ref()),
                            });
                        }
                        Err(error) => {
                            log::error!(
                                "cannot write secondary output {}/{}: {}",
                                item.ty,
                                item.name,
                                error
                            );
                            for (_, secondary_name) in &written {
                                if let Some(path) = self.saved_file(SavedDirectory::Cache, target.name, *secondary_name) {
                                    let _ = fs::remove_file(path);
                                }
                            }
                            report.failed.push(output_key);
                            report.success = false;
                            rolled_back = true;
                            break;
                        }
                    }
                }
                if rolled_back {
                    return;
                }

                new_log.built.push(BuiltEntry {
                    ty: output_type,
                    name,
                    version,
                    rule_version: rule.version(),
                    platform_configuration_time_ns: self.platform_configuration_time_ns,
                    primary_input_version: primary_version,
                    saved_directory: SavedDirectory::Cache,
                    references: self.detect_log_references(output_type, output.as_ref()),
                    secondary_inputs: consumed,
                });
                index.add_native_entry(
                    output_type,
                    name,
                    NativeItemFormat::ReadableData,
                    &self.saved_relative(SavedDirectory::Cache, target.name, name),
                );
                available.insert(output_key, AvailableInput { version, instance: output });

                for (entry, item) in secondary_entries.into_iter().zip(produced) {
                    let secondary_key = ResourceKey::native(entry.ty, entry.name);
                    index.add_native_entry(
                        entry.ty,
                        entry.name,
                        NativeItemFormat::ReadableData,
                        &self.saved_relative(SavedDirectory::Cache, target.name, entry.name),
                    );
                    available.insert(
                        secondary_key,
                        AvailableInput {
                            version: entry.version,
                            instance: item.instance,
                        },
                    );
                    new_log.secondary.push(entry);
                }

                report.built.push(output_key);
            }
            BuildOutcome::Failure => {
                log::error!("build rule {} failed for input {}", rule.name(), name);
                report.failed.push(output_key);
                report.success = false;
            }
            BuildOutcome::Unsupported => {
                log::info!(
                    "build rule {} reports {} unsupported on this platform",
                    rule.name(),
                    output_key
                );
                new_log.built.push(BuiltEntry {
                    ty: output_type,
                    name,
                    version: EntryVersion::new(output_type_version, 0),
                    rule_version: rule.version(),
                    platform_configuration_time_ns: self.platform_configuration_time_ns,
                    primary_input_version: primary_version,
                    saved_directory: SavedDirectory::Unsupported,
                    references: Vec::new(),
                    secondary_inputs: consumed,
                });
                report.unsupported.push(output_key);
            }
        }
    }

    /// A platform-unsupported output escalates to a build failure only when
    /// some incoming reference requires it.
    fn check_references(
        &self,
        new_log: &TargetLog,
        available: &FxHashMap<ResourceKey, AvailableInput>,
        expected_outputs: &FxHashSet<ResourceKey>,
        report: &mut PlanReport,
    ) {
        let unsupported: FxHashSet<ResourceKey> = report.unsupported.iter().copied().collect();

        let all_references = new_log
            .raw
            .iter()
            .map(|entry| &entry.references)
            .chain(new_log.built.iter().map(|entry| &entry.references))
            .chain(new_log.secondary.iter().map(|entry| &entry.references))
            .flatten();

        for reference in all_references {
            let key = ResourceKey {
                ty: reference.ty,
                name: reference.name,
            };
            if unsupported.contains(&key) {
                if reference.required {
                    log::error!("required reference to platform-unsupported resource {}", key);
                    report.success = false;
                }
                continue;
            }
            if reference.required
                && !available.contains_key(&key)
                && !expected_outputs.contains(&key)
            {
                log::error!("required reference to missing resource {}", key);
                report.success = false;
            }
        }
    }

    //----------------------------------------------------------------------------------------------

    fn detect_log_references(&self, ty: InternedString, instance: &dyn Resource) -> Vec<LogReference> {
        let mut detected = Vec::new();
        detect_references(self.registry, self.references, ty, instance, &mut detected);
        merge_reference_flags(&detected)
            .into_iter()
            .map(|reference| LogReference {
                ty: Some(reference.ty),
                name: reference.name,
                required: reference.flags.contains(ReferenceFlags::REQUIRED),
            })
            .collect()
    }

    fn deploy_file(&self, target: InternedString, file_name: &str) -> PathBuf {
        self.paths.deploy_dir(target).join(file_name)
    }

    fn saved_file(
        &self,
        directory: SavedDirectory,
        target: InternedString,
        name: InternedString,
    ) -> Option<PathBuf> {
        self.paths
            .saved_dir(directory, target)
            .map(|dir| dir.join(format!("{}.rd", name)))
    }

    fn saved_relative(
        &self,
        directory: SavedDirectory,
        target: InternedString,
        name: InternedString,
    ) -> String {
        let dir = match directory {
            SavedDirectory::Deploy => "deploy",
            SavedDirectory::Cache => "cache",
            SavedDirectory::Unsupported => "unsupported",
        };
        format!("{}/{}/{}.rd", dir, target, name)
    }

    fn write_output(
        &self,
        target: InternedString,
        ty: InternedString,
        name: InternedString,
        instance: &dyn Resource,
    ) -> Result<EntryVersion, String> {
        let ops = self
            .codecs
            .get(ty)
            .ok_or_else(|| format!("no codec for type {}", ty))?;
        let bytes = ops.encode_readable(instance).map_err(|error| error.to_string())?;

        let path = self
            .saved_file(SavedDirectory::Cache, target, name)
            .expect("cache directory always resolves");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| error.to_string())?;
        }
        fs::write(&path, bytes).map_err(|error| error.to_string())?;

        let mtime = modification_time_ns(&path).ok_or_else(|| "no modification time".to_owned())?;
        Ok(EntryVersion::new(ops.type_version, mtime))
    }

    fn load_saved(
        &self,
        directory: SavedDirectory,
        target: InternedString,
        ty: InternedString,
        name: InternedString,
    ) -> Result<Box<dyn Resource>, String> {
        let ops = self
            .codecs
            .get(ty)
            .ok_or_else(|| format!("no codec for type {}", ty))?;
        let path = self
            .saved_file(directory, target, name)
            .ok_or_else(|| "entry has no saved payload".to_owned())?;
        let bytes = fs::read(&path).map_err(|error| error.to_string())?;
        ops.decode(PayloadKind::NativeReadableData, &bytes)
            .map_err(|error| error.to_string())
    }

    fn copy_into(&self, from: &Path, to: &Path) -> Result<(), ()> {
        if let Some(parent) = to.parent() {
            if fs::create_dir_all(parent).is_err() {
                log::error!("cannot create directory {}", parent.display());
                return Err(());
            }
        }
        match fs::copy(from, to) {
            Ok(_) => Ok(()),
            Err(error) => {
                log::error!("cannot copy {} to {}: {}", from.display(), to.display(), error);
                Err(())
            }
        }
    }
}

fn extension_of(format: NativeItemFormat) -> &'static str {
    match format {
        NativeItemFormat::Binary => crate::ident::BINARY_EXTENSION,
        NativeItemFormat::ReadableData => crate::ident::READABLE_DATA_EXTENSION,
    }
}
