//! A worker process paired with a dedicated duplex channel.
//!
//! The parent keeps one channel endpoint and the [`ProcessHandle`]; the
//! worker gets the other endpoint and runs an entry function with its own
//! [`Task`] value, through which it talks back with [`Task::put`] and
//! [`Task::get`].

use crate::channel::{Channel, channel_pair};
use crate::config::Config;
use crate::error::{Error, RemoteError, Result};
use crate::process::{DEFAULT_POLL_INTERVAL, ExecOptions, ProcessHandle, SpawnStrategy};
use crate::protocol::{Callable, TaskBoot};
use crate::registry;
use crate::transport;
use anyhow::Context;
use dashmap::DashMap;
use log::{debug, error, info};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Process entry that runs a task worker after fork+exec.
pub const TASK_ENTRY: &str = "oqto-tasks.task";

/// How long a dropped parent-side task waits for its worker after SIGINT.
const DROP_GRACE: Duration = Duration::from_millis(500);

/// Which end of this particular task the current process holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSide {
    Parent,
    Child,
}

/// Threads currently blocked in [`Task::get`], with the task they wait on.
static WAITING: Lazy<DashMap<ThreadId, String>> = Lazy::new(DashMap::new);

struct WaitingGuard {
    thread: ThreadId,
    previous: Option<String>,
}

impl WaitingGuard {
    fn enter(task: &str) -> Self {
        let thread = thread::current().id();
        let previous = WAITING.insert(thread, task.to_string());
        Self { thread, previous }
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(outer) => {
                WAITING.insert(self.thread, outer);
            }
            None => {
                WAITING.remove(&self.thread);
            }
        }
    }
}

/// Name of the task `thread` is blocked on in [`Task::get`], if any.
pub fn waiting_on(thread: ThreadId) -> Option<String> {
    WAITING.get(&thread).map(|name| name.value().clone())
}

/// Every thread of this process currently blocked in [`Task::get`].
pub fn waiting_threads() -> Vec<(ThreadId, String)> {
    WAITING
        .iter()
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect()
}

/// Builder for a [`Task`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    must_exec: bool,
    env: HashMap<String, String>,
    worker_exe: Option<PathBuf>,
    poll_interval: Duration,
    verbose: bool,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            must_exec: false,
            env: HashMap::new(),
            worker_exe: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verbose: false,
        }
    }

    /// Take every setting from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.must_exec = config.must_exec;
        self.worker_exe = config.worker_exe.clone();
        self.poll_interval = config.join_poll_interval();
        self.env.extend(config.env.clone());
        self.verbose = config.verbose;
        self
    }

    /// Use fork+exec instead of a plain fork.
    pub fn must_exec(mut self, must_exec: bool) -> Self {
        self.must_exec = must_exec;
        self
    }

    /// Set an environment variable in a fork+exec worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn worker_exe(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_exe = Some(path.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Start a fork-only worker running `entry`.
    ///
    /// Closures cannot survive exec, so this fails with
    /// [`Error::NotTransmissible`] when fork+exec was requested; use
    /// [`spawn_entry`](Self::spawn_entry) with a registered entry instead.
    pub fn spawn<F>(self, entry: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> anyhow::Result<()>,
    {
        if self.must_exec {
            return Err(Error::NotTransmissible("a closure task entry"));
        }
        self.spawn_fork(entry)
    }

    /// Start a worker running the task entry registered as `entry`.
    pub fn spawn_entry(self, entry: &str, args: Value) -> Result<Task> {
        if self.must_exec {
            return self.spawn_exec(Callable::new(entry, args));
        }
        let f = registry::lookup_entry(entry)?;
        self.spawn_fork(move |task| f(task, args))
    }

    fn spawn_fork<F>(self, entry: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> anyhow::Result<()>,
    {
        let (parent_end, child_end) = channel_pair()?;
        let parent_fds = parent_end.raw_fds();
        let name = self.name.clone();
        let verbose = self.verbose;

        let mut process = ProcessHandle::fork_with(self.name.clone(), move || {
            // The parent's endpoint object is never dropped here; release
            // its descriptors so the parent sees EOF when we go away.
            if let Some((read, write)) = parent_fds {
                transport::close_raw(read);
                transport::close_raw(write);
            }
            let mut task = Task::worker(name, child_end, false, verbose);
            run_worker_entry(&mut task, entry)
        })?;
        process.set_poll_interval(self.poll_interval);

        Ok(Task::parent(self.name, process, parent_end, false))
    }

    fn spawn_exec(mut self, entry: Callable) -> Result<Task> {
        let (parent_end, child_end) = channel_pair()?;
        let (read_fd, write_fd) = child_end
            .raw_fds()
            .ok_or_else(|| Error::connection_lost("spawn: fresh channel is closed"))?;

        let boot = TaskBoot {
            name: self.name.clone(),
            entry,
            read_fd,
            write_fd,
            verbose: self.verbose,
        };
        if self.verbose {
            self.env
                .insert(crate::bootstrap::ENV_VERBOSE.to_string(), "1".to_string());
        }
        let options = ExecOptions {
            worker_exe: self.worker_exe.clone(),
            env: self.env,
            inherit_fds: vec![read_fd, write_fd],
            poll_interval: self.poll_interval,
        };
        let process = ProcessHandle::exec_with(
            self.name.clone(),
            &Callable::new(TASK_ENTRY, Value::Null),
            &[serde_json::to_value(&boot)?],
            &options,
        )?;
        // The worker holds its own copies now.
        drop(child_end);

        Ok(Task::parent(self.name, process, parent_end, true))
    }
}

/// One side of a spawned worker and its channel.
///
/// Dropping the parent side of a live task terminates the worker and reaps
/// it, killing it if it has not exited within a short grace period.
#[derive(Debug)]
pub struct Task {
    name: String,
    side: TaskSide,
    process: Option<ProcessHandle>,
    channel: Channel,
    must_exec: bool,
    child_pid: Option<i32>,
    verbose: bool,
}

impl Task {
    fn parent(name: String, process: ProcessHandle, channel: Channel, must_exec: bool) -> Self {
        let child_pid = process.pid();
        Self {
            name,
            side: TaskSide::Parent,
            process: Some(process),
            channel,
            must_exec,
            child_pid,
            verbose: false,
        }
    }

    pub(crate) fn worker(name: String, channel: Channel, must_exec: bool, verbose: bool) -> Self {
        Self {
            name,
            side: TaskSide::Child,
            process: None,
            channel,
            must_exec,
            child_pid: None,
            verbose,
        }
    }

    /// Move this task out, leaving a closed husk behind.
    pub(crate) fn take(&mut self) -> Task {
        Task {
            name: self.name.clone(),
            side: self.side,
            process: self.process.take(),
            channel: std::mem::replace(&mut self.channel, Channel::closed()),
            must_exec: self.must_exec,
            child_pid: self.child_pid.take(),
            verbose: self.verbose,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> TaskSide {
        self.side
    }

    pub fn is_parent(&self) -> bool {
        self.side == TaskSide::Parent
    }

    pub fn is_child(&self) -> bool {
        self.side == TaskSide::Child
    }

    pub fn must_exec(&self) -> bool {
        self.must_exec
    }

    pub fn strategy(&self) -> SpawnStrategy {
        if self.must_exec {
            SpawnStrategy::ForkExec
        } else {
            SpawnStrategy::Fork
        }
    }

    /// Worker pid, on the parent side until terminated or reaped.
    pub fn pid(&self) -> Option<i32> {
        self.child_pid
            .and(self.process.as_ref().and_then(ProcessHandle::pid))
    }

    /// Send one value to the other side.
    pub fn put<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.channel.send(value)
    }

    /// Block until the other side sends a value.
    ///
    /// A peer that went away (exited, crashed, closed its end) surfaces as
    /// [`Error::ForwardedInterrupt`]. After [`terminate`](Self::terminate)
    /// this fails with [`Error::ConnectionLost`] instead.
    pub fn get<T: DeserializeOwned>(&mut self) -> Result<T> {
        if self.channel.is_closed() {
            return Err(Error::connection_lost(format!("{}: task terminated", self.name)));
        }
        let _waiting = WaitingGuard::enter(&self.name);
        match self.channel.recv() {
            Err(e) if e.is_connection_lost() => {
                debug!("{}: peer went away: {e}", self.name);
                Err(Error::ForwardedInterrupt)
            }
            other => other,
        }
    }

    /// Close the channel and, from the parent side, interrupt the worker.
    ///
    /// Does not wait for the worker to exit. Calling it again is a no-op.
    pub fn terminate(&mut self) {
        self.channel.close();
        if self.is_parent() && self.child_pid.take().is_some() {
            if let Some(process) = self.process.as_mut() {
                debug!("{}: interrupting worker", self.name);
                process.terminate();
            }
        }
    }

    /// Wait for the worker to exit; see [`ProcessHandle::join`].
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.process.as_mut() {
            Some(process) => process.join(timeout),
            None => Ok(()),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(ProcessHandle::is_alive)
    }

    /// Worker exit status once it has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.process.as_ref().and_then(ProcessHandle::exit_status)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.is_parent() {
            return;
        }
        self.terminate();
        if let Some(process) = self.process.as_mut() {
            process.shutdown(DROP_GRACE);
        }
    }
}

/// Run a worker's entry function and turn the outcome into an exit code.
fn run_worker_entry<F>(task: &mut Task, entry: F) -> i32
where
    F: FnOnce(&mut Task) -> anyhow::Result<()>,
{
    let pid = std::process::id();
    if task.verbose {
        info!("{}: worker pid {pid} started", task.name);
    } else {
        debug!("{}: worker pid {pid} started", task.name);
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry(task)));
    task.channel.close();

    let code = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("{}: task entry failed: {e:#}", task.name);
            1
        }
        Err(payload) => {
            let remote = RemoteError::from_panic(payload);
            error!("{}: task entry panicked: {}", task.name, remote.message);
            1
        }
    };
    if task.verbose {
        info!("{}: worker pid {pid} finished with {code}", task.name);
    }
    code
}

/// Process entry behind [`TASK_ENTRY`]: adopt the inherited channel and run
/// the registered task entry named in the boot record.
pub(crate) fn run_exec_task(_bound: Value, args: Vec<Value>) -> anyhow::Result<Value> {
    let boot = args.into_iter().next().context("missing task boot record")?;
    let boot: TaskBoot = serde_json::from_value(boot).context("invalid task boot record")?;
    let channel = Channel::from_inherited_fds(boot.read_fd, boot.write_fd)
        .with_context(|| format!("{}: adopting task channel", boot.name))?;
    let entry = registry::lookup_entry(&boot.entry.name)?;

    let mut task = Task::worker(boot.name, channel, true, boot.verbose);
    let args = boot.entry.args;
    match run_worker_entry(&mut task, |task| entry(task, args)) {
        0 => Ok(Value::Null),
        code => anyhow::bail!("{}: task entry exited with {code}", task.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker_pair(name: &str) -> (Task, Task) {
        let (a, b) = channel_pair().unwrap();
        (
            Task::worker(name.to_string(), a, false, false),
            Task::worker(name.to_string(), b, false, false),
        )
    }

    #[test]
    fn test_put_get_over_channel() {
        let (mut a, mut b) = worker_pair("local");
        a.put(&json!({"n": 1})).unwrap();
        let got: Value = b.get().unwrap();
        assert_eq!(got, json!({"n": 1}));
        assert!(a.is_child());
        assert!(!a.is_alive());
        assert_eq!(a.pid(), None);
    }

    #[test]
    fn test_peer_gone_is_forwarded_interrupt() {
        let (mut a, mut b) = worker_pair("local");
        a.terminate();
        let err = b.get::<Value>().unwrap_err();
        assert!(matches!(err, Error::ForwardedInterrupt));
    }

    #[test]
    fn test_terminated_task_refuses_get() {
        let (mut a, _b) = worker_pair("local");
        a.terminate();
        a.terminate();
        assert!(a.get::<Value>().unwrap_err().is_connection_lost());
        assert!(a.put(&1).unwrap_err().is_connection_lost());
    }

    #[test]
    fn test_waiting_table_tracks_blocked_get() {
        let (a, mut b) = worker_pair("diag");
        let waiter = thread::spawn(move || {
            let mut a = a;
            let v: Value = a.get().unwrap();
            (v, thread::current().id())
        });

        let mut seen = false;
        for _ in 0..100 {
            if waiting_threads().iter().any(|(_, name)| name == "diag") {
                seen = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(seen);

        b.put(&"wake").unwrap();
        let (v, id) = waiter.join().unwrap();
        assert_eq!(v, json!("wake"));
        assert_eq!(waiting_on(id), None);
    }

    #[test]
    fn test_nested_waits_restore_outer_entry() {
        let me = thread::current().id();
        let outer = WaitingGuard::enter("outer");
        {
            let _inner = WaitingGuard::enter("inner");
            assert_eq!(waiting_on(me).as_deref(), Some("inner"));
        }
        assert_eq!(waiting_on(me).as_deref(), Some("outer"));
        drop(outer);
        assert_eq!(waiting_on(me), None);
    }

    #[test]
    fn test_entry_outcome_to_exit_code() {
        let (mut a, _b) = worker_pair("codes");
        assert_eq!(run_worker_entry(&mut a, |_| Ok(())), 0);

        let (mut a, _b) = worker_pair("codes");
        assert_eq!(run_worker_entry(&mut a, |_| anyhow::bail!("nope")), 1);

        let (mut a, _b) = worker_pair("codes");
        assert_eq!(run_worker_entry(&mut a, |_| panic!("entry blew up")), 1);
        assert!(a.put(&1).unwrap_err().is_connection_lost());
    }

    #[test]
    fn test_closure_rejected_for_exec() {
        let err = TaskBuilder::new("exec-closure")
            .must_exec(true)
            .spawn(|_task| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::NotTransmissible(_)));
    }

    #[test]
    fn test_builder_takes_config() {
        let config = Config {
            must_exec: true,
            join_poll_interval_ms: 50,
            ..Config::default()
        };
        let builder = TaskBuilder::new("cfg").config(&config).env("A", "1");
        assert!(builder.must_exec);
        assert_eq!(builder.poll_interval, Duration::from_millis(50));
        assert_eq!(builder.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_take_leaves_closed_husk() {
        let (mut a, mut b) = worker_pair("take");
        let mut taken = a.take();
        taken.put(&7).unwrap();
        assert_eq!(b.get::<i32>().unwrap(), 7);
        assert!(a.put(&1).unwrap_err().is_connection_lost());
    }
}
