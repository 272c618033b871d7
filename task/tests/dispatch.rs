use kiln_base::intern;
use kiln_task::{dispatch, dispatch_list, Job, Task, TaskList};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::yield_now();
    }
    condition()
}

#[test]
fn single_task_runs_to_finished() {
    let counter = Arc::new(AtomicUsize::new(0));
    let observed = counter.clone();
    let handle = dispatch(Task::new(intern("single"), move || {
        observed.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(wait_until(Duration::from_secs(5), || handle.is_finished()));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    handle.detach();
}

#[test]
fn detached_task_still_runs() {
    let counter = Arc::new(AtomicUsize::new(0));
    let observed = counter.clone();
    dispatch(Task::new(intern("detached"), move || {
        observed.fetch_add(1, Ordering::SeqCst);
    }))
    .detach();

    assert!(wait_until(Duration::from_secs(5), || {
        counter.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn list_dispatch_finishes_every_task_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut list = TaskList::new();
    for _ in 0..256 {
        let observed = counter.clone();
        list.add(Task::new(intern("list_item"), move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let handles = dispatch_list(list);
    assert_eq!(handles.len(), 256);
    for handle in &handles {
        assert!(wait_until(Duration::from_secs(5), || handle.is_finished()));
    }
    // Each function ran exactly once.
    assert_eq!(counter.load(Ordering::SeqCst), 256);
}

#[test]
fn job_with_thousand_tasks_round_trip() {
    let task_counter = Arc::new(AtomicUsize::new(0));
    let completion_counter = Arc::new(AtomicUsize::new(0));

    let job = Job::create();
    let completion_task_counter = task_counter.clone();
    let completion_observed = completion_counter.clone();
    job.set_completion_task(Task::new(intern("round_trip_completion"), move || {
        // Every grouped task must have finished before the completion task
        // starts.
        assert_eq!(completion_task_counter.load(Ordering::SeqCst), 1000);
        completion_observed.fetch_add(1, Ordering::SeqCst);
    }));

    let mut list = TaskList::new();
    for _ in 0..1000 {
        let observed = task_counter.clone();
        list.add(Task::new(intern("round_trip_item"), move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
    }
    let handles = job.dispatch_task_list(list);
    for handle in handles {
        handle.detach();
    }

    job.release();
    job.wait();

    assert_eq!(task_counter.load(Ordering::SeqCst), 1000);
    assert_eq!(completion_counter.load(Ordering::SeqCst), 1);
}

#[test]
fn tasks_dispatched_from_inside_a_grouped_task_delay_completion() {
    let counter = Arc::new(AtomicUsize::new(0));
    let job = Job::create();

    let completion_seen = counter.clone();
    job.set_completion_task(Task::new(intern("nested_completion"), move || {
        // Both the outer and the nested task count as dependencies.
        assert_eq!(completion_seen.load(Ordering::SeqCst), 2);
    }));

    let outer_counter = counter.clone();
    let outer_job = job.clone();
    job.dispatch_task(Task::new(intern("nested_outer"), move || {
        outer_counter.fetch_add(1, Ordering::SeqCst);
        let nested_counter = outer_counter.clone();
        outer_job
            .dispatch_task(Task::new(intern("nested_inner"), move || {
                nested_counter.fetch_add(1, Ordering::SeqCst);
            }))
            .detach();
    }))
    .detach();

    job.release();
    job.clone().wait();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn detached_job_completes_on_its_own() {
    let completion_counter = Arc::new(AtomicUsize::new(0));
    let job = Job::create();

    let observed = completion_counter.clone();
    job.set_completion_task(Task::new(intern("detached_completion"), move || {
        observed.fetch_add(1, Ordering::SeqCst);
    }));
    job.dispatch_task(Task::new(intern("detached_body"), || {})).detach();
    job.release();
    job.detach();

    assert!(wait_until(Duration::from_secs(5), || {
        completion_counter.load(Ordering::SeqCst) == 1
    }));
}
