//! kiln engine core.
//!
//! The backbone every game system plugs into: a context of named singleton
//! services with a three-phase lifecycle, a CPU task dispatcher, a resource
//! pipeline with a durable build log and runtime provider, a render graph
//! frontend, and the universe scheduler bridge gameplay pipelines run on.

pub use kiln_base as base;
pub use kiln_context as context;
pub use kiln_provider as provider;
pub use kiln_render_graph as render_graph;
pub use kiln_resource as resource;
pub use kiln_task as task;
pub use kiln_universe as universe;

pub mod prelude {
    pub use kiln_base::{intern, AllocationGroup, EventQueue, InternedString};
    pub use kiln_context::{
        Context, EngineSettings, HotReloadConfig, HotReloadMode, HotReloadSystem, System,
        SystemApi, SystemRegistry, UpdateSystem,
    };
    pub use kiln_provider::{
        ProviderConfig, ProviderSystemConfig, RequestUpdated, ResourceProvider,
        ResourceProviderSystem, TargetMount,
    };
    pub use kiln_render_graph::{
        PassDescription, PassInstanceRequest, RenderBackend, RenderGraph,
    };
    pub use kiln_resource::{
        BuildLog, BuildOutcome, BuildRule, CodecRegistry, Planner, Resource, ResourceIndex,
        ResourceKey, ResourceTypeOps, TypeRegistry, WorkspacePaths,
    };
    pub use kiln_task::{dispatch, dispatch_list, Job, Task, TaskList};
    pub use kiln_universe::{
        Mutator, PairPipelineScheduler, PairPipelineSettings, Pipeline, SchedulerInterface, World,
        WorldScheduler,
    };
}
