use kiln_base::intern;
use kiln_universe::pair::{LOGICAL_PIPELINE_NAME, VISUAL_PIPELINE_NAME};
use kiln_universe::{
    Mutator, PairPipelineScheduler, PairPipelineSettings, Pipeline, SchedulerInterface, World,
    WorldScheduler,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn run_pipeline_executes_every_mutator_to_completion() {
    struct OnePipelineScheduler;
    impl WorldScheduler for OnePipelineScheduler {
        fn execute(&mut self, interface: &dyn SchedulerInterface) {
            interface.run_pipeline(intern("gameplay"));
        }
    }

    let world = World::new(intern("main_world"));
    let counter = Arc::new(AtomicUsize::new(0));

    let mut pipeline = Pipeline::new(intern("gameplay"));
    for index in 0..8 {
        let counter = counter.clone();
        pipeline.add_mutator(Mutator::new(intern(&format!("mutator_{}", index)), move |context| {
            assert_eq!(context.pipeline, intern("gameplay"));
            assert_eq!(context.world, intern("main_world"));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    world.add_pipeline(pipeline);
    world.set_scheduler(OnePipelineScheduler);

    world.update();
    // run_pipeline is synchronous to pipeline completion.
    assert_eq!(counter.load(Ordering::SeqCst), 8);

    world.update();
    assert_eq!(counter.load(Ordering::SeqCst), 16);
}

#[test]
fn child_worlds_tick_recursively() {
    struct ChildrenOnlyScheduler;
    impl WorldScheduler for ChildrenOnlyScheduler {
        fn execute(&mut self, interface: &dyn SchedulerInterface) {
            interface.update_all_children();
        }
    }

    struct CountingScheduler(Arc<AtomicUsize>);
    impl WorldScheduler for CountingScheduler {
        fn execute(&mut self, _interface: &dyn SchedulerInterface) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let ticks = Arc::new(AtomicUsize::new(0));
    let parent = World::new(intern("parent_world"));
    let child = World::new(intern("child_world"));
    child.set_scheduler(CountingScheduler(ticks.clone()));
    parent.add_child(child);
    parent.set_scheduler(ChildrenOnlyScheduler);

    parent.update();
    parent.update();
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

//--------------------------------------------------------------------------------------------------

fn pair_world(
    logical: &Arc<AtomicUsize>,
    visual: &Arc<AtomicUsize>,
) -> Arc<World> {
    let world = World::new(intern("pair_world"));

    let mut logical_pipeline = Pipeline::new(intern(LOGICAL_PIPELINE_NAME));
    let counter = logical.clone();
    logical_pipeline.add_mutator(Mutator::new(intern("logical_counter"), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    world.add_pipeline(logical_pipeline);

    let mut visual_pipeline = Pipeline::new(intern(VISUAL_PIPELINE_NAME));
    let counter = visual.clone();
    visual_pipeline.add_mutator(Mutator::new(intern("visual_counter"), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    world.add_pipeline(visual_pipeline);

    world
}

#[test]
fn pair_scheduler_fixed_steps_logical_time() {
    const STEP: u64 = 1_000_000;
    let logical = Arc::new(AtomicUsize::new(0));
    let visual = Arc::new(AtomicUsize::new(0));
    let world = pair_world(&logical, &visual);

    let now = Arc::new(AtomicU64::new(0));
    let clock = now.clone();
    world.set_scheduler(PairPipelineScheduler::with_clock(
        PairPipelineSettings {
            logical_time_step_ns: STEP,
            max_logical_advance_time_ns: u64::max_value(),
        },
        move || clock.load(Ordering::SeqCst),
    ));

    // First update: zero delta, one catch-up logical step, one visual run.
    world.update();
    assert_eq!(logical.load(Ordering::SeqCst), 1);
    assert_eq!(visual.load(Ordering::SeqCst), 1);

    // Two steps of wall time pass: the accumulator runs logical twice.
    now.store(2 * STEP, Ordering::SeqCst);
    world.update();
    assert_eq!(logical.load(Ordering::SeqCst), 3);
    assert_eq!(visual.load(Ordering::SeqCst), 2);

    // No time passes: visual still runs, logical is ahead and idles.
    world.update();
    assert_eq!(logical.load(Ordering::SeqCst), 3);
    assert_eq!(visual.load(Ordering::SeqCst), 3);
}

#[test]
fn pair_scheduler_clamps_runaway_advance() {
    const STEP: u64 = 1_000_000;
    let logical = Arc::new(AtomicUsize::new(0));
    let visual = Arc::new(AtomicUsize::new(0));
    let world = pair_world(&logical, &visual);

    // Every clock read advances time, so the advance loop always looks
    // slower than the budget allows.
    let now = Arc::new(AtomicU64::new(0));
    let clock = now.clone();
    world.set_scheduler(PairPipelineScheduler::with_clock(
        PairPipelineSettings {
            logical_time_step_ns: STEP,
            max_logical_advance_time_ns: 3 * STEP,
        },
        move || clock.fetch_add(STEP, Ordering::SeqCst),
    ));

    for _ in 0..4 {
        world.update();
    }

    // The scheduler survived and kept running the visual pipeline every
    // update instead of spiralling into unbounded logical catch-up.
    assert_eq!(visual.load(Ordering::SeqCst), 4);
    assert!(logical.load(Ordering::SeqCst) <= 16);
}
