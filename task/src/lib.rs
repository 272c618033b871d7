//! CPU task dispatch.
//!
//! Tasks are the minimal unit of deferred work: a name for profiling plus a
//! function to run on a worker thread. Jobs group tasks into a high-level
//! activity that can be waited on and can trigger a completion task once
//! every grouped task has finished.

mod dispatcher;
mod job;

pub use self::dispatcher::{dispatch, dispatch_list, Task, TaskHandle, TaskList};
pub use self::job::Job;
