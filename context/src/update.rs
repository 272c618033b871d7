//! Update system: the per-tick driver other systems hang their frame logic
//! on.
//!
//! Systems register named update hooks, optionally ordered after other
//! hooks, and the owner of the main loop calls `run_update` once per tick.

use crate::{System, SystemApi, SystemCreateContext};
use fxhash::FxHashMap;
use kiln_base::InternedString;
use parking_lot::Mutex;
use std::sync::Arc;

struct UpdateHook {
    name: InternedString,
    after: Vec<InternedString>,
    callback: Arc<dyn Fn() + Send + Sync>,
}

pub struct UpdateSystem {
    hooks: Mutex<Vec<UpdateHook>>,
}

impl System for UpdateSystem {}

fn create_update_system(_context: &SystemCreateContext) -> Arc<dyn System> {
    Arc::new(UpdateSystem {
        hooks: Mutex::new(Vec::new()),
    })
}

static UPDATE_SYSTEM_API: SystemApi = SystemApi {
    name: UpdateSystem::NAME,
    create: create_update_system,
};

impl UpdateSystem {
    pub const NAME: &'static str = "update_system";

    pub fn api() -> &'static SystemApi {
        &UPDATE_SYSTEM_API
    }

    /// Registers `callback` to run every tick, after the hooks named in
    /// `after`. Re-registering a name replaces the previous hook.
    pub fn connect_on_run(
        &self,
        name: InternedString,
        after: &[InternedString],
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        let mut hooks = self.hooks.lock();
        hooks.retain(|hook| hook.name != name);
        hooks.push(UpdateHook {
            name,
            after: after.to_vec(),
            callback: Arc::new(callback),
        });
    }

    pub fn disconnect_on_run(&self, name: InternedString) {
        self.hooks.lock().retain(|hook| hook.name != name);
    }

    /// Runs every registered hook once, respecting `after` edges.
    /// Registration from inside a callback takes effect next tick.
    pub fn run_update(&self) {
        let callbacks = self.ordered_callbacks();
        for callback in callbacks {
            callback();
        }
    }

    fn ordered_callbacks(&self) -> Vec<Arc<dyn Fn() + Send + Sync>> {
        let hooks = self.hooks.lock();
        let mut index_of = FxHashMap::default();
        for (index, hook) in hooks.iter().enumerate() {
            index_of.insert(hook.name, index);
        }

        // Kahn's algorithm, registration order as the tie-break.
        let mut dependants: Vec<Vec<usize>> = vec![Vec::new(); hooks.len()];
        let mut missing_dependencies = vec![0usize; hooks.len()];
        for (index, hook) in hooks.iter().enumerate() {
            for dependency in &hook.after {
                if let Some(&dependency_index) = index_of.get(dependency) {
                    dependants[dependency_index].push(index);
                    missing_dependencies[index] += 1;
                }
            }
        }

        let mut ready: Vec<usize> = (0..hooks.len())
            .filter(|&index| missing_dependencies[index] == 0)
            .collect();
        let mut order = Vec::with_capacity(hooks.len());
        let mut cursor = 0;
        while cursor < ready.len() {
            let index = ready[cursor];
            cursor += 1;
            order.push(index);
            for &dependant in &dependants[index] {
                missing_dependencies[dependant] -= 1;
                if missing_dependencies[dependant] == 0 {
                    ready.push(dependant);
                }
            }
        }

        if order.len() != hooks.len() {
            log::error!("update hook dependency cycle; remaining hooks run in registration order");
            for index in 0..hooks.len() {
                if !order.contains(&index) {
                    order.push(index);
                }
            }
        }

        order.into_iter().map(|index| hooks[index].callback.clone()).collect()
    }
}
