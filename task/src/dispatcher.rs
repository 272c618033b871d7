//! Worker pool and task queue.
//!
//! One FIFO queue behind a single mutex/condvar pair; workers take one task
//! per queue acquisition and run it outside the lock. The pool is global,
//! sized from the host's logical CPU count at first use, and lives for the
//! whole process.

use crate::job::JobState;
use kiln_base::InternedString;
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// A unit of work to run on a worker thread. Immutable once dispatched.
pub struct Task {
    pub name: InternedString,
    pub(crate) function: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new(name: InternedString, function: impl FnOnce() + Send + 'static) -> Task {
        Task {
            name,
            function: Box::new(function),
        }
    }
}

pub(crate) struct TaskState {
    finished: AtomicBool,
}

/// Observation handle for a dispatched task. Detaching relinquishes
/// observation only; the task still runs.
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    pub fn detach(self) {}
}

pub(crate) struct QueuedTask {
    name: InternedString,
    function: Box<dyn FnOnce() + Send + 'static>,
    state: Arc<TaskState>,
    job: Option<Arc<JobState>>,
}

struct DispatcherShared {
    queue: Mutex<VecDeque<QueuedTask>>,
    available: Condvar,
}

struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

lazy_static! {
    static ref DISPATCHER: Dispatcher = Dispatcher::start();
}

impl Dispatcher {
    fn start() -> Dispatcher {
        let shared = Arc::new(DispatcherShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });

        let workers = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        log::debug!("starting task dispatcher with {} workers", workers);

        for index in 0..workers {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("kiln-task-worker-{}", index))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn task worker thread");
        }

        Dispatcher { shared }
    }

    fn enqueue(&self, task: QueuedTask) {
        self.shared.queue.lock().push_back(task);
        self.shared.available.notify_one();
    }

    fn enqueue_batch(&self, tasks: Vec<QueuedTask>) {
        if tasks.is_empty() {
            return;
        }

        // One lock acquisition for the whole batch.
        self.shared.queue.lock().extend(tasks);
        self.shared.available.notify_all();
    }
}

fn worker_loop(shared: Arc<DispatcherShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                match queue.pop_front() {
                    Some(task) => break task,
                    None => shared.available.wait(&mut queue),
                }
            }
        };
        run_task(task);
    }
}

fn run_task(task: QueuedTask) {
    let function = task.function;
    let outcome = catch_unwind(AssertUnwindSafe(move || function()));
    if outcome.is_err() {
        // Task errors are not surfaced; a panic inside a task takes the
        // process down.
        log::error!("task \"{}\" panicked, aborting", task.name);
        std::process::abort();
    }

    task.state.finished.store(true, Ordering::Release);
    if let Some(job) = task.job {
        job.grouped_task_finished();
    }
}

fn make_queued(task: Task, job: Option<Arc<JobState>>) -> (QueuedTask, TaskHandle) {
    let state = Arc::new(TaskState {
        finished: AtomicBool::new(false),
    });
    let queued = QueuedTask {
        name: task.name,
        function: task.function,
        state: state.clone(),
        job,
    };
    (queued, TaskHandle { state })
}

/// Dispatches a single task.
pub fn dispatch(task: Task) -> TaskHandle {
    let (queued, handle) = make_queued(task, None);
    DISPATCHER.enqueue(queued);
    handle
}

/// Caller-assembled batch of tasks, submitted with one queue lock. Prefer
/// this over repeated [`dispatch`] calls when there is more than one task.
pub struct TaskList {
    tasks: Vec<Task>,
}

impl TaskList {
    pub fn new() -> TaskList {
        TaskList { tasks: Vec::new() }
    }

    pub fn add(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskList {
    fn default() -> TaskList {
        TaskList::new()
    }
}

/// Dispatches a whole list, splicing it into the queue in one lock.
pub fn dispatch_list(list: TaskList) -> Vec<TaskHandle> {
    dispatch_list_grouped(list, None)
}

pub(crate) fn dispatch_grouped(task: Task, job: Arc<JobState>) -> TaskHandle {
    let (queued, handle) = make_queued(task, Some(job));
    DISPATCHER.enqueue(queued);
    handle
}

pub(crate) fn dispatch_list_grouped(list: TaskList, job: Option<Arc<JobState>>) -> Vec<TaskHandle> {
    let mut queued = Vec::with_capacity(list.tasks.len());
    let mut handles = Vec::with_capacity(list.tasks.len());
    for task in list.tasks {
        let (entry, handle) = make_queued(task, job.clone());
        queued.push(entry);
        handles.push(handle);
    }

    DISPATCHER.enqueue_batch(queued);
    handles
}
