//! Runtime resource provider: turns requests for `(type, name)` pairs into
//! loaded containers, reference-counts them against live requests, and
//! applies hot-reload batches.
//!
//! Requests inserted during one tick become fulfillable at the next tick at
//! the earliest: the per-tick update drains finished loads first, then
//! routes new requests, cancels orphaned pending loads, and schedules reads
//! on the task dispatcher within the configured byte budget.

mod system;

pub use self::system::{ProviderSystemConfig, ResourceProviderSystem};

use fxhash::FxHashMap;
use kiln_base::{define_id_type, EventQueue, IdGenerator, InternedString, SortedIndex};
use kiln_context::HotReloadSystem;
use kiln_resource::ident::RESOURCE_INDEX_DEFAULT_NAME;
use kiln_resource::{CodecRegistry, PayloadKind, Resource, ResourceIndex, ResourceKey, ThirdPartyBytes};
use kiln_task::{dispatch, Job, Task};
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

define_id_type! {
    /// Dense id of one live request.
    pub struct RequestId
}

define_id_type! {
    /// Id of a loaded container; fresh per (type, name) load generation.
    pub struct ContainerId
}

/// One mounted target: its name and the workspace root holding
/// `<root>/<name>/.resource_index` plus the files the index points at.
#[derive(Clone, Debug)]
pub struct TargetMount {
    pub name: InternedString,
    pub root: PathBuf,
}

/// Event emitted whenever a request's provided container changes.
/// An invalid container id means the request lost its resource.
#[derive(Clone, Copy, Debug)]
pub struct RequestUpdated {
    pub request: RequestId,
    pub key: ResourceKey,
    pub container: ContainerId,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Upper bound on bytes scheduled for reading per tick. At least one
    /// pending load is always scheduled so progress never stalls.
    pub io_byte_budget_per_tick: u64,
}

impl Default for ProviderConfig {
    fn default() -> ProviderConfig {
        ProviderConfig {
            io_byte_budget_per_tick: 8 * 1024 * 1024,
        }
    }
}

//--------------------------------------------------------------------------------------------------

struct PathEntry {
    path: PathBuf,
    kind: PayloadKind,
    size_hint: u64,
}

struct RequestRecord {
    key: ResourceKey,
    priority: u32,
    provided_container: ContainerId,
    /// Set once the dispatch pass has routed this request.
    routed: bool,
}

struct PendingLoad {
    key: ResourceKey,
    referrers: u32,
    in_flight: bool,
}

struct LoadedEntry {
    container: ContainerId,
    refcount: u32,
}

struct TypeContainers {
    generator: IdGenerator,
    containers: FxHashMap<ContainerId, Box<dyn Resource>>,
}

impl Default for TypeContainers {
    fn default() -> TypeContainers {
        TypeContainers {
            generator: IdGenerator::new(),
            containers: FxHashMap::default(),
        }
    }
}

struct LoadResult {
    key: ResourceKey,
    sort_key: u64,
    outcome: Result<Box<dyn Resource>, String>,
}

struct ProviderState {
    scan_done: bool,
    paths: FxHashMap<ResourceKey, PathEntry>,
    requests: FxHashMap<RequestId, RequestRecord>,
    new_requests: Vec<RequestId>,
    loaded: FxHashMap<ResourceKey, LoadedEntry>,
    containers: FxHashMap<Option<InternedString>, TypeContainers>,
    /// Pending loads ordered by priority (descending) then insertion.
    pending: SortedIndex<PendingLoad>,
    pending_keys: FxHashMap<ResourceKey, u64>,
    pending_insertion_counter: u32,
}

impl ProviderState {
    fn new() -> ProviderState {
        ProviderState {
            scan_done: false,
            paths: FxHashMap::default(),
            requests: FxHashMap::default(),
            new_requests: Vec::new(),
            loaded: FxHashMap::default(),
            containers: FxHashMap::default(),
            pending: SortedIndex::new(),
            pending_keys: FxHashMap::default(),
            pending_insertion_counter: 0,
        }
    }

    fn pending_sort_key(&mut self, priority: u32) -> u64 {
        let counter = self.pending_insertion_counter;
        self.pending_insertion_counter += 1;
        ((u32::max_value() - priority) as u64) << 32 | counter as u64
    }

    fn add_pending(&mut self, key: ResourceKey, priority: u32) {
        let sort_key = self.pending_sort_key(priority);
        self.pending.insert(
            sort_key,
            PendingLoad {
                key,
                referrers: 1,
                in_flight: false,
            },
        );
        self.pending_keys.insert(key, sort_key);
    }

    fn remove_pending(&mut self, key: ResourceKey) -> Option<PendingLoad> {
        let sort_key = self.pending_keys.remove(&key)?;
        self.pending.remove(sort_key)
    }
}

pub struct ResourceProvider {
    request_ids: IdGenerator,
    config: ProviderConfig,
    codecs: Arc<CodecRegistry>,
    mounts: Vec<TargetMount>,
    state: Mutex<ProviderState>,
    results: Arc<Mutex<Vec<LoadResult>>>,
    updates: EventQueue<RequestUpdated>,
}

impl ResourceProvider {
    pub fn new(
        codecs: Arc<CodecRegistry>,
        mounts: Vec<TargetMount>,
        config: ProviderConfig,
    ) -> ResourceProvider {
        ResourceProvider {
            request_ids: IdGenerator::new(),
            config,
            codecs,
            mounts,
            state: Mutex::new(ProviderState::new()),
            results: Arc::new(Mutex::new(Vec::new())),
            updates: EventQueue::new(),
        }
    }

    /// Queue of [`RequestUpdated`] events; create an iterator to observe
    /// container bindings.
    pub fn updates(&self) -> &EventQueue<RequestUpdated> {
        &self.updates
    }

    /// Registers a request. The request is routed on the next tick; its
    /// `request_updated` event arrives no earlier than that.
    pub fn insert_request(&self, key: ResourceKey, priority: u32) -> RequestId {
        let id = RequestId::from_generator(&self.request_ids);
        let mut state = self.state.lock();
        state.requests.insert(
            id,
            RequestRecord {
                key,
                priority,
                provided_container: ContainerId::INVALID,
                routed: false,
            },
        );
        state.new_requests.push(id);
        id
    }

    /// Removes a request, dropping its reference on the loaded container.
    /// The container unloads once no live request points at it.
    pub fn remove_request(&self, id: RequestId) {
        let mut state = self.state.lock();
        let record = match state.requests.remove(&id) {
            Some(record) => record,
            None => return,
        };

        if record.provided_container.is_valid() {
            self.release_loaded(&mut state, record.key);
        } else if record.routed {
            if let Some(sort_key) = state.pending_keys.get(&record.key).copied() {
                if let Some(pending) = state.pending.find_equal_mut(sort_key) {
                    pending.referrers = pending.referrers.saturating_sub(1);
                }
            }
        }
    }

    pub fn request_container(&self, id: RequestId) -> ContainerId {
        self.state
            .lock()
            .requests
            .get(&id)
            .map(|record| record.provided_container)
            .unwrap_or(ContainerId::INVALID)
    }

    /// Reads the loaded instance inside a container.
    pub fn with_container<T: Resource, R>(
        &self,
        ty: Option<InternedString>,
        container: ContainerId,
        reader: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let state = self.state.lock();
        let instance = state
            .containers
            .get(&ty)?
            .containers
            .get(&container)?
            .downcast_ref::<T>()?;
        Some(reader(instance))
    }

    /// Per-tick update. Pass the hot-reload coordination system to let the
    /// provider apply the swap while the coordinator is executing.
    pub fn update(&self, hot_reload: Option<&HotReloadSystem>) {
        let mut state = self.state.lock();
        if !state.scan_done {
            self.scan(&mut state);
        }

        self.drain_results(&mut state);
        self.route_new_requests(&mut state);
        self.cancel_orphaned(&mut state);
        self.schedule_loads(&mut state);

        if let Some(coordination) = hot_reload {
            if coordination.is_executing() {
                self.execute_hot_reload(&mut state);
                coordination.finish();
            }
        }
    }

    //----------------------------------------------------------------------------------------------

    /// Populates the `(type, name) -> path` map from every mounted target
    /// index. Runs exactly once, and again after hot reload.
    fn scan(&self, state: &mut ProviderState) {
        state.paths = self.read_indices();
        state.scan_done = true;
    }

    fn read_indices(&self) -> FxHashMap<ResourceKey, PathEntry> {
        let mut paths = FxHashMap::default();
        for mount in &self.mounts {
            let index_path = mount.root.join(mount.name.as_str()).join(RESOURCE_INDEX_DEFAULT_NAME);
            let index = match ResourceIndex::load(&index_path) {
                Ok(index) => index,
                Err(error) => {
                    log::error!("cannot read resource index for {}: {}", mount.name, error);
                    continue;
                }
            };

            for container in &index.native {
                for item in &container.items {
                    let path = mount.root.join(&item.path);
                    let size_hint = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
                    paths.insert(
                        ResourceKey::native(container.ty, item.name),
                        PathEntry {
                            path,
                            kind: item.format.payload_kind(),
                            size_hint,
                        },
                    );
                }
            }
            for item in &index.third_party {
                paths.insert(
                    ResourceKey::third_party(item.name),
                    PathEntry {
                        path: mount.root.join(&item.path),
                        kind: PayloadKind::ThirdParty,
                        size_hint: item.size,
                    },
                );
            }
        }
        paths
    }

    fn drain_results(&self, state: &mut ProviderState) {
        let results = std::mem::replace(&mut *self.results.lock(), Vec::new());
        for result in results {
            // A pending entry that disappeared or got re-queued makes this
            // result stale.
            if state.pending_keys.get(&result.key).copied() != Some(result.sort_key) {
                continue;
            }

            match result.outcome {
                Ok(instance) => {
                    let pending = state.remove_pending(result.key).expect("pending verified above");
                    let container = self.store_container(state, result.key, instance);
                    state.loaded.insert(
                        result.key,
                        LoadedEntry {
                            container,
                            refcount: pending.referrers,
                        },
                    );
                    self.bind_requests(state, result.key, container);
                }
                Err(error) => {
                    // The request stays alive without a container; a later
                    // hot reload that supplies the file heals it.
                    log::error!("cannot load resource {}: {}", result.key, error);
                    state.remove_pending(result.key);
                }
            }
        }
    }

    fn route_new_requests(&self, state: &mut ProviderState) {
        let new_requests = std::mem::replace(&mut state.new_requests, Vec::new());
        for id in new_requests {
            let (key, priority) = match state.requests.get_mut(&id) {
                Some(record) => {
                    record.routed = true;
                    (record.key, record.priority)
                }
                None => continue,
            };

            if let Some(loaded) = state.loaded.get_mut(&key) {
                loaded.refcount += 1;
                let container = loaded.container;
                if let Some(record) = state.requests.get_mut(&id) {
                    record.provided_container = container;
                }
                self.emit_update(id, key, container);
            } else if let Some(sort_key) = state.pending_keys.get(&key).copied() {
                if let Some(pending) = state.pending.find_equal_mut(sort_key) {
                    pending.referrers += 1;
                }
            } else {
                state.add_pending(key, priority);
            }
        }
    }

    fn cancel_orphaned(&self, state: &mut ProviderState) {
        let orphaned: Vec<ResourceKey> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.referrers == 0)
            .map(|(_, pending)| pending.key)
            .collect();
        for key in orphaned {
            state.remove_pending(key);
        }
    }

    fn schedule_loads(&self, state: &mut ProviderState) {
        let budget = self.config.io_byte_budget_per_tick;
        let mut scheduled_bytes = 0u64;

        let mut to_schedule = Vec::new();
        for (sort_key, pending) in state.pending.iter() {
            if pending.in_flight {
                continue;
            }
            let size_hint = state
                .paths
                .get(&pending.key)
                .map(|entry| entry.size_hint)
                .unwrap_or(0);
            if scheduled_bytes > 0 && scheduled_bytes + size_hint > budget {
                break;
            }
            scheduled_bytes += size_hint;
            to_schedule.push((sort_key, pending.key));
        }

        for (sort_key, key) in to_schedule {
            if let Some(pending) = state.pending.find_equal_mut(sort_key) {
                pending.in_flight = true;
            }
            match state.paths.get(&key) {
                Some(entry) => {
                    self.spawn_load(key, sort_key, entry.path.clone(), entry.kind);
                }
                None => {
                    log::error!("no index entry for requested resource {}", key);
                    state.remove_pending(key);
                }
            }
        }
    }

    fn spawn_load(&self, key: ResourceKey, sort_key: u64, path: PathBuf, kind: PayloadKind) {
        let codecs = self.codecs.clone();
        let results = self.results.clone();
        dispatch(Task::new(key.name, move || {
            let outcome = load_instance(&codecs, key, &path, kind);
            results.lock().push(LoadResult {
                key,
                sort_key,
                outcome,
            });
        }))
        .detach();
    }

    /// Applies a hot-reload batch: re-reads the indices, diffs them against
    /// live containers, reloads still-referenced names in parallel, and
    /// emits every `request_updated` event within the current tick.
    fn execute_hot_reload(&self, state: &mut ProviderState) {
        log::info!("applying hot reload batch");
        state.paths = self.read_indices();

        let mut removed = Vec::new();
        let mut reload = Vec::new();
        for (key, entry) in &state.loaded {
            match state.paths.get(key) {
                Some(path_entry) => reload.push((*key, path_entry.path.clone(), path_entry.kind)),
                None => removed.push((*key, entry.container)),
            }
        }

        // Still-referenced names reload as one parallel job; the batch is
        // atomic with respect to the gameplay tick.
        let batch: Arc<Mutex<Vec<(ResourceKey, Result<Box<dyn Resource>, String>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let job = Job::create();
        for (key, path, kind) in reload {
            let codecs = self.codecs.clone();
            let batch = batch.clone();
            job.dispatch_task(Task::new(key.name, move || {
                let outcome = load_instance(&codecs, key, &path, kind);
                batch.lock().push((key, outcome));
            }))
            .detach();
        }
        job.release();
        job.wait();

        for (key, outcome) in std::mem::replace(&mut *batch.lock(), Vec::new()) {
            match outcome {
                Ok(instance) => {
                    let container = state.loaded[&key].container;
                    if let Some(containers) = state.containers.get_mut(&key.ty) {
                        containers.containers.insert(container, instance);
                    }
                    // The container id survives the swap, but every request
                    // observing it must still hear about the new content.
                    self.notify_requests(state, key, container);
                }
                Err(error) => {
                    // Keep the old instance; the next reload may resolve it.
                    log::warn!("hot reload kept stale {}: {}", key, error);
                }
            }
        }

        for (key, container) in removed {
            log::warn!("resource {} disappeared from index", key);
            if let Some(containers) = state.containers.get_mut(&key.ty) {
                containers.containers.remove(&container);
            }
            state.loaded.remove(&key);
            let affected: Vec<RequestId> = state
                .requests
                .iter_mut()
                .filter(|(_, record)| record.key == key)
                .map(|(id, record)| {
                    record.provided_container = ContainerId::INVALID;
                    *id
                })
                .collect();
            for id in affected {
                self.emit_update(id, key, ContainerId::INVALID);
            }
        }

        // Requests that never got a container may be loadable now.
        let unfulfilled: Vec<(ResourceKey, u32)> = state
            .requests
            .values()
            .filter(|record| record.routed && !record.provided_container.is_valid())
            .map(|record| (record.key, record.priority))
            .collect();
        for (key, priority) in unfulfilled {
            if !state.pending_keys.contains_key(&key) && state.paths.contains_key(&key) {
                state.add_pending(key, priority);
            }
        }
    }

    //----------------------------------------------------------------------------------------------

    fn store_container(
        &self,
        state: &mut ProviderState,
        key: ResourceKey,
        instance: Box<dyn Resource>,
    ) -> ContainerId {
        let containers = state.containers.entry(key.ty).or_insert_with(TypeContainers::default);
        let container = ContainerId::from_generator(&containers.generator);
        containers.containers.insert(container, instance);
        container
    }

    fn bind_requests(&self, state: &mut ProviderState, key: ResourceKey, container: ContainerId) {
        let affected: Vec<RequestId> = state
            .requests
            .iter_mut()
            .filter(|(_, record)| {
                record.key == key && record.routed && record.provided_container != container
            })
            .map(|(id, record)| {
                record.provided_container = container;
                *id
            })
            .collect();
        for id in affected {
            self.emit_update(id, key, container);
        }
    }

    /// Like [`bind_requests`], but emits even when the container id did not
    /// change: hot reload swaps content in place.
    fn notify_requests(&self, state: &mut ProviderState, key: ResourceKey, container: ContainerId) {
        let affected: Vec<RequestId> = state
            .requests
            .iter_mut()
            .filter(|(_, record)| record.key == key && record.routed)
            .map(|(id, record)| {
                record.provided_container = container;
                *id
            })
            .collect();
        for id in affected {
            self.emit_update(id, key, container);
        }
    }

    fn release_loaded(&self, state: &mut ProviderState, key: ResourceKey) {
        let empty = match state.loaded.get_mut(&key) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };

        if empty {
            let entry = state.loaded.remove(&key).unwrap();
            if let Some(containers) = state.containers.get_mut(&key.ty) {
                // Runs the instance destructor and frees the slot; the next
                // request for this key allocates a fresh container id.
                containers.containers.remove(&entry.container);
            }
        }
    }

    fn emit_update(&self, request: RequestId, key: ResourceKey, container: ContainerId) {
        self.updates.submit(RequestUpdated {
            request,
            key,
            container,
        });
    }
}

fn load_instance(
    codecs: &CodecRegistry,
    key: ResourceKey,
    path: &std::path::Path,
    kind: PayloadKind,
) -> Result<Box<dyn Resource>, String> {
    let bytes = fs::read(path).map_err(|error| error.to_string())?;
    match key.ty {
        Some(ty) => {
            let ops = codecs
                .get(ty)
                .ok_or_else(|| format!("no codec registered for type {}", ty))?;
            ops.decode(kind, &bytes).map_err(|error| error.to_string())
        }
        None => Ok(Box::new(ThirdPartyBytes { bytes })),
    }
}
