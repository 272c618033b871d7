//! Universe scheduler bridge.
//!
//! Worlds hold named pipelines of mutators. A scheduler drives a world by
//! running pipelines to completion and ticking child worlds through the
//! [`SchedulerInterface`]; mutators within one pipeline run in parallel on
//! the task dispatcher, with ordering between them expressed by workflow
//! graph edges upstream of this layer.

pub mod pair;

pub use self::pair::{PairPipelineScheduler, PairPipelineSettings, TimeState};

use fxhash::FxHashMap;
use kiln_base::InternedString;
use kiln_task::{Job, Task};
use parking_lot::Mutex;
use std::sync::Arc;

/// Context handed to every mutator invocation.
#[derive(Clone, Copy, Debug)]
pub struct PipelineContext {
    pub world: InternedString,
    pub pipeline: InternedString,
}

type MutatorFn = Arc<dyn Fn(&PipelineContext) + Send + Sync>;

/// A gameplay-layer function invoked by a workflow graph.
pub struct Mutator {
    pub name: InternedString,
    function: MutatorFn,
}

impl Mutator {
    pub fn new(
        name: InternedString,
        function: impl Fn(&PipelineContext) + Send + Sync + 'static,
    ) -> Mutator {
        Mutator {
            name,
            function: Arc::new(function),
        }
    }
}

/// Named workflow graph of mutators.
pub struct Pipeline {
    pub name: InternedString,
    mutators: Vec<Mutator>,
}

impl Pipeline {
    pub fn new(name: InternedString) -> Pipeline {
        Pipeline {
            name,
            mutators: Vec::new(),
        }
    }

    pub fn with_mutator(mut self, mutator: Mutator) -> Pipeline {
        self.mutators.push(mutator);
        self
    }

    pub fn add_mutator(&mut self, mutator: Mutator) {
        self.mutators.push(mutator);
    }
}

/// Dispatch surface schedulers drive their world through.
pub trait SchedulerInterface {
    /// Synchronously executes the named pipeline to completion.
    fn run_pipeline(&self, name: InternedString);
    fn update_all_children(&self);
    fn update_child(&self, child: &Arc<World>);
}

/// User-authored scheduling logic for one world.
pub trait WorldScheduler: Send {
    fn execute(&mut self, interface: &dyn SchedulerInterface);
}

pub struct World {
    name: InternedString,
    pipelines: Mutex<FxHashMap<InternedString, Arc<Pipeline>>>,
    children: Mutex<Vec<Arc<World>>>,
    scheduler: Mutex<Option<Box<dyn WorldScheduler>>>,
}

impl World {
    pub fn new(name: InternedString) -> Arc<World> {
        Arc::new(World {
            name,
            pipelines: Mutex::new(FxHashMap::default()),
            children: Mutex::new(Vec::new()),
            scheduler: Mutex::new(None),
        })
    }

    pub fn name(&self) -> InternedString {
        self.name
    }

    pub fn add_pipeline(&self, pipeline: Pipeline) {
        self.pipelines.lock().insert(pipeline.name, Arc::new(pipeline));
    }

    pub fn set_scheduler(&self, scheduler: impl WorldScheduler + 'static) {
        *self.scheduler.lock() = Some(Box::new(scheduler));
    }

    pub fn add_child(self: &Arc<Self>, child: Arc<World>) {
        self.children.lock().push(child);
    }

    /// Runs the world's scheduler once. Without a scheduler the world is
    /// inert.
    pub fn update(self: &Arc<Self>) {
        let scheduler = self.scheduler.lock().take();
        let mut scheduler = match scheduler {
            Some(scheduler) => scheduler,
            None => return,
        };

        scheduler.execute(&WorldInterface { world: self });

        let mut slot = self.scheduler.lock();
        if slot.is_none() {
            *slot = Some(scheduler);
        }
    }
}

struct WorldInterface<'a> {
    world: &'a Arc<World>,
}

impl<'a> SchedulerInterface for WorldInterface<'a> {
    fn run_pipeline(&self, name: InternedString) {
        let pipeline = match self.world.pipelines.lock().get(&name) {
            Some(pipeline) => pipeline.clone(),
            None => {
                log::warn!("world {} has no pipeline {}", self.world.name, name);
                return;
            }
        };

        let context = PipelineContext {
            world: self.world.name,
            pipeline: name,
        };

        // Mutators run in parallel on the dispatcher pool; the job keeps
        // this call synchronous to pipeline completion.
        let job = Job::create();
        for mutator in &pipeline.mutators {
            let function = mutator.function.clone();
            job.dispatch_task(Task::new(mutator.name, move || function(&context)))
                .detach();
        }
        job.release();
        job.wait();
    }

    fn update_all_children(&self) {
        let children = self.world.children.lock().clone();
        for child in children {
            child.update();
        }
    }

    fn update_child(&self, child: &Arc<World>) {
        child.update();
    }
}
