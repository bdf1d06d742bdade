//! Isolated worker processes for Oqto.
//!
//! A [`Task`](task::Task) is a worker process plus a dedicated duplex
//! channel to it. Workers are created either by forking the current process
//! or by forking and re-executing the current binary:
//!
//! ```text
//! main process                           worker process
//!   Task::put / Task::get  <--[frames]-->  Task::put / Task::get
//!   run_remotely loop      <--[frames]-->  CallSession
//!        ^                                      |
//!        +---------- NestedCall (exec_in_main_proc)
//! ```
//!
//! On top of tasks, [`call::run_remotely`] runs one function in a worker and
//! waits for its value, serving the worker's call-backs into the main process
//! while it waits.
//!
//! Binaries that spawn fork+exec workers must register their callables and
//! then call [`bootstrap::check_exec`] before doing anything else in `main`.

pub mod bootstrap;
pub mod call;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod role;
pub mod rwlock;
pub mod task;
pub mod transport;

pub use call::{CallContext, CallOptions, Job, run_remotely};
pub use error::{Error, RemoteError, Result};
pub use protocol::Callable;
pub use task::{Task, TaskBuilder};
