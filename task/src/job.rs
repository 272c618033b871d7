//! Jobs: groups of tasks forming one high-level activity.
//!
//! Lifecycle: `ASSEMBLING -> RELEASED -> COMPLETING -> DONE`. Tasks
//! dispatched through the job become its dependencies; once the job is
//! released and every grouped task has finished, the optional completion
//! task is dispatched exactly once, and the job transitions to done when it
//! finishes. Waiters sleep on a condvar signaled at the done transition.

use crate::dispatcher::{self, Task, TaskHandle, TaskList};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobStage {
    Assembling,
    Released,
    Completing,
    Done,
}

pub(crate) struct JobState {
    outstanding_tasks: AtomicUsize,
    stage: Mutex<JobStage>,
    completion_task: Mutex<Option<Task>>,
    done: Condvar,
}

impl JobState {
    fn begin_grouped_task(&self, count: usize) {
        debug_assert!({
            let stage = *self.stage.lock();
            stage == JobStage::Assembling || stage == JobStage::Released
        });
        self.outstanding_tasks.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn grouped_task_finished(self: &Arc<Self>) {
        let previous = self.outstanding_tasks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1);
        if previous == 1 {
            self.try_complete();
        }
    }

    fn try_complete(self: &Arc<Self>) {
        let mut stage = self.stage.lock();
        if *stage != JobStage::Released {
            return;
        }
        if self.outstanding_tasks.load(Ordering::Acquire) != 0 {
            return;
        }

        match self.completion_task.lock().take() {
            Some(task) => {
                *stage = JobStage::Completing;
                drop(stage);

                let state = self.clone();
                let Task { name, function } = task;
                dispatcher::dispatch(Task::new(name, move || {
                    function();
                    state.finish_completion();
                }))
                .detach();
            }
            None => {
                *stage = JobStage::Done;
                self.done.notify_all();
            }
        }
    }

    fn finish_completion(&self) {
        let mut stage = self.stage.lock();
        debug_assert_eq!(*stage, JobStage::Completing);
        *stage = JobStage::Done;
        self.done.notify_all();
    }
}

/// Handle to a job. Clones share the same job, which lets tasks dispatch
/// follow-up work into their own group.
#[derive(Clone)]
pub struct Job {
    state: Arc<JobState>,
}

impl Job {
    pub fn create() -> Job {
        Job {
            state: Arc::new(JobState {
                outstanding_tasks: AtomicUsize::new(0),
                stage: Mutex::new(JobStage::Assembling),
                completion_task: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// Installs the task dispatched once every grouped task has finished.
    /// Must be set while the job is still assembling.
    pub fn set_completion_task(&self, task: Task) {
        debug_assert_eq!(*self.state.stage.lock(), JobStage::Assembling);
        *self.state.completion_task.lock() = Some(task);
    }

    /// Dispatches `task` as a dependency of this job. Valid while
    /// assembling, or from inside a task already grouped into this job.
    pub fn dispatch_task(&self, task: Task) -> TaskHandle {
        self.state.begin_grouped_task(1);
        dispatcher::dispatch_grouped(task, self.state.clone())
    }

    pub fn dispatch_task_list(&self, list: TaskList) -> Vec<TaskHandle> {
        if list.is_empty() {
            return Vec::new();
        }

        self.state.begin_grouped_task(list.len());
        dispatcher::dispatch_list_grouped(list, Some(self.state.clone()))
    }

    /// Seals assembly, making completion possible. Idempotent.
    pub fn release(&self) {
        {
            let mut stage = self.state.stage.lock();
            if *stage != JobStage::Assembling {
                return;
            }
            *stage = JobStage::Released;
        }
        self.state.try_complete();
    }

    /// Blocks the calling thread until the job is done. Must not be called
    /// from inside a task, and only after `release`.
    pub fn wait(self) {
        let mut stage = self.state.stage.lock();
        debug_assert_ne!(*stage, JobStage::Assembling, "waiting on an unreleased job");
        while *stage != JobStage::Done {
            self.state.done.wait(&mut stage);
        }
    }

    /// Invalidates the handle; the dispatcher frees job resources once the
    /// job completes.
    pub fn detach(self) {}
}
