//! Execution context: named singleton services with a three-phase
//! lifecycle.
//!
//! A system is any service that participates in the lifecycle: it is
//! created from its [`SystemApi`], allowed to connect to other systems,
//! then initialized. Querying another system during connect or init creates
//! a dependency that orders initialization and teardown. After assembly the
//! context serves lookups from any thread.
//!
//! Teardown mirrors assembly: shutdown in reverse logical-dependency order,
//! disconnect in reverse connect order, then destruction.

pub mod hot_reload;
pub mod settings;
pub mod update;

pub use self::hot_reload::{HotReloadConfig, HotReloadMode, HotReloadSystem, KeyEvent, KeyModifiers};
pub use self::settings::EngineSettings;
pub use self::update::UpdateSystem;

use downcast_rs::{impl_downcast, DowncastSync};
use fxhash::FxHashMap;
use kiln_base::{intern, AllocationGroup, InternedString};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------

/// A named singleton service owned by a [`Context`].
///
/// Systems keep their state behind interior mutability: lifecycle hooks and
/// queries hand out shared references only.
pub trait System: DowncastSync {
    fn connect(&self, _context: &Context) {}
    fn init(&self, _context: &Context) {}
    fn shutdown(&self, _context: &Context) {}
    fn disconnect(&self, _context: &Context) {}
}
impl_downcast!(sync System);

/// Opaque user configuration captured by the first request for a system.
pub type SystemConfig = Box<dyn Any + Send + Sync>;

pub struct SystemCreateContext<'a> {
    pub group: AllocationGroup,
    pub config: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> SystemCreateContext<'a> {
    pub fn config_as<T: 'static>(&self) -> Option<&T> {
        self.config.and_then(|config| config.downcast_ref::<T>())
    }
}

/// Integration record for one system: its unique name and create functor.
pub struct SystemApi {
    pub name: &'static str,
    pub create: fn(&SystemCreateContext) -> Arc<dyn System>,
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate system name \"{0}\" in system registry")]
    DuplicateName(String),
}

/// The flat array of available systems, resolved once at startup.
pub struct SystemRegistry {
    apis: Vec<&'static SystemApi>,
    by_name: FxHashMap<InternedString, usize>,
}

impl SystemRegistry {
    pub fn new(apis: &[&'static SystemApi]) -> Result<SystemRegistry, RegistryError> {
        let mut by_name = FxHashMap::default();
        for (index, api) in apis.iter().enumerate() {
            let name = intern(api.name);
            if by_name.insert(name, index).is_some() {
                return Err(RegistryError::DuplicateName(api.name.to_owned()));
            }
        }

        Ok(SystemRegistry {
            apis: apis.to_vec(),
            by_name,
        })
    }

    fn find(&self, name: InternedString) -> Option<&'static SystemApi> {
        self.by_name.get(&name).map(|index| self.apis[*index])
    }
}

//--------------------------------------------------------------------------------------------------

const PHASE_REQUESTS: u8 = 0;
const PHASE_CREATING: u8 = 1;
const PHASE_CONNECTING: u8 = 2;
const PHASE_INITIALIZING: u8 = 3;
const PHASE_READY: u8 = 4;
const PHASE_DESTROYING: u8 = 5;

const SLOT_CREATED: u8 = 0;
const SLOT_CONNECTING: u8 = 1;
const SLOT_CONNECTED: u8 = 2;
const SLOT_INITIALIZING: u8 = 3;
const SLOT_INITIALIZED: u8 = 4;

struct SystemRequest {
    name: InternedString,
    api: &'static SystemApi,
    config: Option<SystemConfig>,
}

struct SystemSlot {
    name: InternedString,
    instance: Arc<dyn System>,
    state: AtomicU8,
}

struct AssembledSystems {
    slots: Vec<SystemSlot>,
    by_name: FxHashMap<InternedString, usize>,
}

pub struct Context {
    registry: SystemRegistry,
    group: AllocationGroup,
    phase: AtomicU8,
    requests: Mutex<Vec<SystemRequest>>,
    systems: Mutex<Option<Arc<AssembledSystems>>>,
    /// Indices in the order their connect completed.
    connect_order: Mutex<Vec<usize>>,
    /// Indices in the order their init completed: a dependency always
    /// completes before its dependents, so this is a reverse topological
    /// order of the logical-dependency graph.
    init_order: Mutex<Vec<usize>>,
}

impl Context {
    pub fn new(registry: SystemRegistry, group: AllocationGroup) -> Context {
        Context {
            registry,
            group,
            phase: AtomicU8::new(PHASE_REQUESTS),
            requests: Mutex::new(Vec::new()),
            systems: Mutex::new(None),
            connect_order: Mutex::new(Vec::new()),
            init_order: Mutex::new(Vec::new()),
        }
    }

    /// Requests a system by name. Only valid before [`Context::assembly`].
    ///
    /// Repeating a request is a no-op; the first provided config wins, and a
    /// second non-null config is a programming error.
    pub fn request_system(&self, name: &str, config: Option<SystemConfig>) -> bool {
        debug_assert_eq!(self.phase.load(Ordering::Acquire), PHASE_REQUESTS);
        let name = intern(name);
        let api = match self.registry.find(name) {
            Some(api) => api,
            None => {
                log::error!("requested unknown system \"{}\"", name);
                return false;
            }
        };

        let mut requests = self.requests.lock();
        if let Some(existing) = requests.iter_mut().find(|request| request.name == name) {
            if config.is_some() {
                if existing.config.is_some() {
                    debug_assert!(false, "duplicate config for system \"{}\"", name);
                    log::error!("duplicate config for system \"{}\" ignored", name);
                } else {
                    existing.config = config;
                }
            }
            return true;
        }

        requests.push(SystemRequest { name, api, config });
        true
    }

    pub fn is_requested(&self, name: &str) -> bool {
        let name = intern(name);
        self.requests.lock().iter().any(|request| request.name == name)
    }

    /// Creates, connects and initializes every requested system.
    pub fn assembly(&self) {
        debug_assert_eq!(self.phase.load(Ordering::Acquire), PHASE_REQUESTS);
        self.phase.store(PHASE_CREATING, Ordering::Release);

        let requests = std::mem::replace(&mut *self.requests.lock(), Vec::new());
        let mut slots = Vec::with_capacity(requests.len());
        let mut by_name = FxHashMap::default();

        for request in requests {
            let create_context = SystemCreateContext {
                group: self.group.get_or_create_child(request.name),
                config: request.config.as_ref().map(|config| &**config),
            };
            let instance = (request.api.create)(&create_context);
            by_name.insert(request.name, slots.len());
            slots.push(SystemSlot {
                name: request.name,
                instance,
                state: AtomicU8::new(SLOT_CREATED),
            });
        }

        let assembled = Arc::new(AssembledSystems { slots, by_name });
        let count = assembled.slots.len();
        *self.systems.lock() = Some(assembled);

        self.phase.store(PHASE_CONNECTING, Ordering::Release);
        for index in 0..count {
            self.connect_system(index);
        }

        self.phase.store(PHASE_INITIALIZING, Ordering::Release);
        let connect_order = self.connect_order.lock().clone();
        for index in connect_order.into_iter().rev() {
            self.init_system(index);
        }

        self.phase.store(PHASE_READY, Ordering::Release);
    }

    /// Queries a system by name. During connect this recursively connects
    /// the target; during init it initializes the target first, creating a
    /// logical dependency. In the ready state it is a pure, thread-safe
    /// lookup.
    pub fn query(&self, name: InternedString) -> Option<Arc<dyn System>> {
        let systems = self.assembled()?;
        let index = *systems.by_name.get(&name)?;

        match self.phase.load(Ordering::Acquire) {
            PHASE_CONNECTING => self.connect_system(index),
            PHASE_INITIALIZING => self.init_system(index),
            PHASE_READY | PHASE_DESTROYING => {}
            phase => {
                debug_assert!(false, "query during phase {}", phase);
                return None;
            }
        }

        Some(systems.slots[index].instance.clone())
    }

    /// Query without triggering the target's connect. The only way to break
    /// a would-be connect cycle when the caller will not actually connect to
    /// the target.
    pub fn query_no_connect(&self, name: InternedString) -> Option<Arc<dyn System>> {
        let systems = self.assembled()?;
        let index = *systems.by_name.get(&name)?;
        Some(systems.slots[index].instance.clone())
    }

    pub fn query_typed<T: System>(&self, name: &str) -> Option<Arc<T>> {
        self.query(intern(name))
            .and_then(|system| system.downcast_arc::<T>().ok())
    }

    pub fn query_no_connect_typed<T: System>(&self, name: &str) -> Option<Arc<T>> {
        self.query_no_connect(intern(name))
            .and_then(|system| system.downcast_arc::<T>().ok())
    }

    pub fn allocation_group(&self) -> AllocationGroup {
        self.group
    }

    fn assembled(&self) -> Option<Arc<AssembledSystems>> {
        self.systems.lock().clone()
    }

    fn connect_system(&self, index: usize) {
        let systems = match self.assembled() {
            Some(systems) => systems,
            None => return,
        };
        let slot = &systems.slots[index];

        match slot.state.compare_exchange(
            SLOT_CREATED,
            SLOT_CONNECTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(SLOT_CONNECTING) => {
                panic!(
                    "connect cycle through system \"{}\"; break it with query_no_connect",
                    slot.name
                );
            }
            Err(_) => return,
        }

        slot.instance.connect(self);
        slot.state.store(SLOT_CONNECTED, Ordering::Release);
        self.connect_order.lock().push(index);
    }

    fn init_system(&self, index: usize) {
        let systems = match self.assembled() {
            Some(systems) => systems,
            None => return,
        };
        let slot = &systems.slots[index];

        match slot.state.compare_exchange(
            SLOT_CONNECTED,
            SLOT_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(SLOT_INITIALIZING) => {
                panic!("logical dependency cycle through system \"{}\"", slot.name);
            }
            Err(_) => return,
        }

        slot.instance.init(self);
        slot.state.store(SLOT_INITIALIZED, Ordering::Release);
        self.init_order.lock().push(index);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let systems = match self.assembled() {
            Some(systems) => systems,
            None => return,
        };
        self.phase.store(PHASE_DESTROYING, Ordering::Release);

        // Shutdown in reverse init-completion order: dependents shut down
        // before the systems they accessed during init.
        let init_order = self.init_order.lock().clone();
        for &index in init_order.iter().rev() {
            systems.slots[index].instance.shutdown(self);
        }

        let connect_order = self.connect_order.lock().clone();
        for &index in connect_order.iter().rev() {
            systems.slots[index].instance.disconnect(self);
        }

        // Destruction stage: drop instances in reverse creation order.
        *self.systems.lock() = None;
        if let Ok(mut assembled) = Arc::try_unwrap(systems) {
            while let Some(slot) = assembled.slots.pop() {
                drop(slot);
            }
        }
    }
}
