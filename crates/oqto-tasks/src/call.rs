//! Run a function in a worker process and wait for its result, letting the
//! worker call back into the calling process while it runs.
//!
//! The caller side is [`run_remotely`]: it spawns a one-shot [`Task`] and
//! loops on its channel. Each [`Message::NestedCall`] it receives is run
//! locally and answered on the same channel before the loop goes back to
//! waiting for the original result. The worker side is a [`CallSession`]:
//! job code reaches the caller through
//! [`CallContext::exec_in_main_proc`], which holds the session for the whole
//! round trip.

use crate::config::Config;
use crate::error::{Error, PROTOCOL_VIOLATION, RemoteError, Result};
use crate::protocol::{Callable, Message};
use crate::registry;
use crate::role;
use crate::task::{Task, TaskBuilder};
use anyhow::Context;
use log::{debug, error, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Task entry that serves a [`Job::Call`] in the worker.
pub const CALL_ENTRY: &str = "oqto-tasks.call";

/// Pid of the process whose call session is installed, 0 if none.
///
/// Stored as a pid rather than a flag: a worker forked while its parent
/// serves a session inherits the value, which then names another process.
static ACTIVE_SESSION: AtomicU32 = AtomicU32::new(0);

pub type JobFn =
    Box<dyn FnOnce(&CallContext<'_>) -> std::result::Result<Value, RemoteError> + Send>;

/// The work handed to [`run_remotely`].
pub enum Job {
    /// A closure; only usable with the fork-only strategy.
    Closure(JobFn),
    /// A registered callable; usable with either strategy.
    Call(Callable),
}

impl Job {
    pub fn closure<F>(f: F) -> Self
    where
        F: FnOnce(&CallContext<'_>) -> std::result::Result<Value, RemoteError> + Send + 'static,
    {
        Job::Closure(Box::new(f))
    }

    pub fn call(name: impl Into<String>, args: Value) -> Self {
        Job::Call(Callable::new(name, args))
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Closure(_) => f.write_str("Job::Closure(..)"),
            Job::Call(callable) => f.debug_tuple("Job::Call").field(callable).finish(),
        }
    }
}

/// Options for [`run_remotely`].
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Worker name, for diagnostics.
    pub name: String,
    pub config: Config,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            name: "call".to_string(),
            config: Config::default(),
        }
    }
}

impl CallOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn must_exec(mut self, must_exec: bool) -> Self {
        self.config.must_exec = must_exec;
        self
    }

    fn task_builder(&self) -> TaskBuilder {
        TaskBuilder::new(self.name.clone()).config(&self.config)
    }
}

/// Where the running code sits in a call chain.
#[derive(Debug, Clone, Copy)]
pub enum CallContext<'a> {
    /// The main process, not serving any call.
    Main,
    /// A worker serving a call; nested calls go through this session.
    Worker(&'a CallSession),
}

impl<'a> CallContext<'a> {
    pub fn main() -> Self {
        CallContext::Main
    }

    pub fn is_main_process(&self) -> bool {
        matches!(self, CallContext::Main)
    }

    /// Run `callable` in the main process.
    ///
    /// In the main process it runs right here. In a worker the request is
    /// sent to the process that started the call, which answers once the
    /// callable finished there; the call may recurse through further
    /// workers before it reaches the main process. A worker holding a
    /// [`CallContext::Main`] has no way to reach the main process and gets
    /// [`Error::ProtocolViolation`].
    pub fn exec_in_main_proc(&self, callable: &Callable) -> Result<Value> {
        match self {
            CallContext::Main if !role::is_main_process() => Err(Error::ProtocolViolation(
                format!("{}: exec_in_main_proc outside a call session", callable.name),
            )),
            CallContext::Main => registry::invoke(self, callable).map_err(RemoteError::into_error),
            CallContext::Worker(session) => session.exec(callable),
        }
    }

    /// Typed form of [`exec_in_main_proc`](Self::exec_in_main_proc).
    pub fn exec_in_main_proc_typed<A, R>(&self, name: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.exec_in_main_proc(&Callable::with_args(name, args)?)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Run the callable registered as `name` in the main process.
pub fn in_main_proc(ctx: &CallContext<'_>, name: &str, args: Value) -> Result<Value> {
    ctx.exec_in_main_proc(&Callable::new(name, args))
}

/// Worker-side state of one call. At most one exists per process.
#[derive(Debug)]
pub struct CallSession {
    task: Mutex<Task>,
    owner: u32,
    /// Set once the caller answered a nested call out of order.
    violated: AtomicBool,
}

impl CallSession {
    /// Take over `task` as the channel for nested calls from this process.
    pub fn install(task: Task) -> Result<Self> {
        let me = std::process::id();
        let current = ACTIVE_SESSION.load(Ordering::Acquire);
        if current == me {
            return Err(Error::SessionActive);
        }
        ACTIVE_SESSION
            .compare_exchange(current, me, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::SessionActive)?;
        debug!("{}: call session installed", task.name());
        Ok(Self {
            task: Mutex::new(task),
            owner: me,
            violated: AtomicBool::new(false),
        })
    }

    /// Whether a session is installed in this process.
    pub fn is_active() -> bool {
        ACTIVE_SESSION.load(Ordering::Acquire) == std::process::id()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Task> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exec(&self, callable: &Callable) -> Result<Value> {
        let mut task = self.lock();
        debug!("{}: nested call {}", task.name(), callable.name);
        task.put(&Message::NestedCall(callable.clone()))?;
        match task.get::<Message>()? {
            Message::Result(value) => Ok(value),
            Message::Exception(e) => Err(e.into_error()),
            other => {
                self.violated.store(true, Ordering::Release);
                Err(Error::ProtocolViolation(format!(
                    "expected result or exception for nested call {}, got {}",
                    callable.name,
                    other.type_name()
                )))
            }
        }
    }

    /// Whether the channel went out of sync during this session.
    pub fn is_violated(&self) -> bool {
        self.violated.load(Ordering::Acquire)
    }

    fn reply(&self, message: &Message) -> Result<()> {
        self.lock().put(message)
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        let _ = ACTIVE_SESSION.compare_exchange(self.owner, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Worker side of a call: install a session on `task`, run `job`, and send
/// its outcome back.
///
/// Losing the parent before the reply is sent is not an error (there is no
/// one left to tell). A protocol violation is: once one happened during the
/// session the worker exits without replying, whatever the job returned.
pub(crate) fn serve<F>(task: Task, job: F) -> anyhow::Result<()>
where
    F: FnOnce(&CallContext<'_>) -> std::result::Result<Value, RemoteError>,
{
    let name = task.name().to_string();
    let session = CallSession::install(task)?;
    let ctx = CallContext::Worker(&session);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&ctx)));
    if session.is_violated() {
        anyhow::bail!("{name}: protocol violation during nested call, not replying");
    }
    let reply = match outcome {
        Ok(Ok(value)) => Message::Result(value),
        Ok(Err(e)) if e.kind == PROTOCOL_VIOLATION => {
            anyhow::bail!("{name}: {e}");
        }
        Ok(Err(e)) => {
            debug!("{name}: call failed: {e}");
            Message::Exception(e)
        }
        Err(payload) => {
            let e = RemoteError::from_panic(payload);
            error!("{name}: call panicked: {}", e.message);
            Message::Exception(e)
        }
    };

    match session.reply(&reply) {
        Ok(()) => Ok(()),
        Err(e) if e.is_connection_lost() => {
            warn!("{name}: caller went away before the reply was sent: {e}");
            Ok(())
        }
        Err(e) => Err(e).context("sending call reply"),
    }
}

/// Task entry behind [`CALL_ENTRY`].
pub(crate) fn serve_call_entry(task: &mut Task, args: Value) -> anyhow::Result<()> {
    let callable: Callable = serde_json::from_value(args).context("invalid call job")?;
    serve(task.take(), move |ctx| registry::invoke(ctx, &callable))
}

/// Run `job` in a new worker and wait for its result.
///
/// Nested calls from the worker are run here with `ctx`, so a worker that
/// itself serves a call forwards them further up the chain.
pub fn run_remotely(ctx: &CallContext<'_>, job: Job, options: &CallOptions) -> Result<Value> {
    let builder = options.task_builder();
    let mut task = match job {
        Job::Closure(f) => builder.spawn(move |task| serve(task.take(), f))?,
        Job::Call(callable) => builder.spawn_entry(CALL_ENTRY, serde_json::to_value(&callable)?)?,
    };
    drive(ctx, &mut task)
}

/// Typed form of [`run_remotely`].
pub fn run_remotely_typed<R: DeserializeOwned>(
    ctx: &CallContext<'_>,
    job: Job,
    options: &CallOptions,
) -> Result<R> {
    let value = run_remotely(ctx, job, options)?;
    Ok(serde_json::from_value(value)?)
}

/// Caller loop: answer nested calls until the result or exception arrives.
fn drive(ctx: &CallContext<'_>, task: &mut Task) -> Result<Value> {
    loop {
        let message = match task.get::<Message>() {
            Ok(message) => message,
            Err(e) => {
                task.terminate();
                task.join(None)?;
                return Err(e);
            }
        };

        match message {
            Message::Result(value) => {
                task.join(None)?;
                return Ok(value);
            }
            Message::Exception(e) => {
                task.join(None)?;
                return Err(e.into_error());
            }
            Message::NestedCall(callable) => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| registry::invoke(ctx, &callable)));
                let reply = match outcome {
                    Ok(Ok(value)) => Message::Result(value),
                    Ok(Err(e)) => {
                        debug!("{}: nested call {} failed: {e}", task.name(), callable.name);
                        Message::Exception(e)
                    }
                    Err(payload) => Message::Exception(RemoteError::from_panic(payload)),
                };
                if let Err(e) = task.put(&reply) {
                    task.terminate();
                    task.join(None)?;
                    return Err(if e.is_connection_lost() {
                        Error::ForwardedInterrupt
                    } else {
                        e
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel_pair;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    // Sessions are process-wide; tests installing one run one at a time.
    static SESSION_TESTS: Mutex<()> = Mutex::new(());

    fn task_pair(name: &str) -> (Task, Task) {
        let (host, worker) = channel_pair().unwrap();
        (
            Task::worker(name.to_string(), host, false, false),
            Task::worker(name.to_string(), worker, false, false),
        )
    }

    fn serve_on_thread<F>(worker: Task, job: F) -> thread::JoinHandle<anyhow::Result<()>>
    where
        F: FnOnce(&CallContext<'_>) -> std::result::Result<Value, RemoteError> + Send + 'static,
    {
        thread::spawn(move || serve(worker, job))
    }

    #[test]
    fn test_drive_returns_result() {
        let _serial = SESSION_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut host, worker) = task_pair("result");
        let served = serve_on_thread(worker, |_ctx| Ok(json!("done")));

        let value = drive(&CallContext::main(), &mut host).unwrap();
        assert_eq!(value, json!("done"));
        served.join().unwrap().unwrap();
    }

    #[test]
    fn test_drive_reraises_exception() {
        let _serial = SESSION_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut host, worker) = task_pair("exception");
        let served = serve_on_thread(worker, |_ctx| {
            Err(RemoteError::new("ValueError", "bad input"))
        });

        let err = drive(&CallContext::main(), &mut host).unwrap_err();
        match err {
            Error::Remote(remote) => {
                assert_eq!(remote.kind, "ValueError");
                assert_eq!(remote.message, "bad input");
            }
            other => panic!("unexpected error: {other}"),
        }
        served.join().unwrap().unwrap();
    }

    #[test]
    fn test_nested_call_runs_on_host_and_loop_resumes() {
        static HOST_HITS: AtomicUsize = AtomicUsize::new(0);
        registry::register("call-test-host-counter", |ctx, args| {
            assert!(ctx.is_main_process());
            let step = args.as_u64().unwrap_or(1) as usize;
            Ok(json!(HOST_HITS.fetch_add(step, Ordering::SeqCst) + step))
        });

        let _serial = SESSION_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut host, worker) = task_pair("nested");
        let served = serve_on_thread(worker, |ctx| {
            assert!(!ctx.is_main_process());
            let first = in_main_proc(ctx, "call-test-host-counter", json!(1))?;
            let second: u64 = ctx.exec_in_main_proc_typed("call-test-host-counter", &10)?;
            Ok(json!([first, second]))
        });

        let value = drive(&CallContext::main(), &mut host).unwrap();
        assert_eq!(value, json!([1, 11]));
        assert_eq!(HOST_HITS.load(Ordering::SeqCst), 11);
        served.join().unwrap().unwrap();
    }

    #[test]
    fn test_nested_exception_reaches_worker() {
        registry::register("call-test-host-fails", |_ctx, _args| {
            Err(RemoteError::new("KeyError", "missing"))
        });

        let _serial = SESSION_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut host, worker) = task_pair("nested-exception");
        let served = serve_on_thread(worker, |ctx| {
            let err = in_main_proc(ctx, "call-test-host-fails", Value::Null).unwrap_err();
            Ok(json!(err.to_string()))
        });

        let value = drive(&CallContext::main(), &mut host).unwrap();
        assert_eq!(value, json!("remote call failed: KeyError: missing"));
        served.join().unwrap().unwrap();
    }

    #[test]
    fn test_worker_gone_is_forwarded_interrupt() {
        let (mut host, worker) = task_pair("gone");
        drop(worker);
        let err = drive(&CallContext::main(), &mut host).unwrap_err();
        assert!(matches!(err, Error::ForwardedInterrupt));
    }

    #[test]
    fn test_reply_to_vanished_caller_is_swallowed() {
        let _serial = SESSION_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let (host, worker) = task_pair("orphan");
        drop(host);
        serve(worker, |_ctx| Ok(json!(1))).unwrap();
    }

    #[test]
    fn test_protocol_violation_is_fatal() {
        let _serial = SESSION_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut host, worker) = task_pair("violation");
        let served = serve_on_thread(worker, |ctx| {
            let err = in_main_proc(ctx, "anything", Value::Null).unwrap_err();
            assert!(matches!(err, Error::ProtocolViolation(_)));
            Err(err.into())
        });

        let request: Message = host.get().unwrap();
        assert_eq!(request.type_name(), "nested_call");
        host.put(&Message::NestedCall(Callable::new("bogus", Value::Null)))
            .unwrap();

        assert!(served.join().unwrap().is_err());
        assert!(matches!(
            host.get::<Message>().unwrap_err(),
            Error::ForwardedInterrupt
        ));
    }

    #[test]
    fn test_ignored_protocol_violation_is_still_fatal() {
        let _serial = SESSION_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut host, worker) = task_pair("violation-ignored");
        let served = serve_on_thread(worker, |ctx| {
            let outcome = in_main_proc(ctx, "anything", Value::Null);
            assert!(matches!(outcome, Err(Error::ProtocolViolation(_))));
            Ok(json!("finished normally"))
        });

        let _request: Message = host.get().unwrap();
        host.put(&Message::NestedCall(Callable::new("bogus", Value::Null)))
            .unwrap();

        assert!(served.join().unwrap().is_err());
        assert!(matches!(
            host.get::<Message>().unwrap_err(),
            Error::ForwardedInterrupt
        ));
    }

    #[test]
    fn test_second_session_rejected() {
        let _serial = SESSION_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let (a, b) = task_pair("session");
        let first = CallSession::install(a).unwrap();
        assert!(CallSession::is_active());
        assert!(matches!(CallSession::install(b), Err(Error::SessionActive)));
        drop(first);
        assert!(!CallSession::is_active());

        let (c, _d) = task_pair("session-again");
        let _again = CallSession::install(c).unwrap();
    }

    #[test]
    fn test_exec_in_main_proc_runs_directly_in_main() {
        registry::register("call-test-direct", |_ctx, args| Ok(json!({"echo": args})));
        let value = in_main_proc(&CallContext::main(), "call-test-direct", json!(5)).unwrap();
        assert_eq!(value, json!({"echo": 5}));

        let err = in_main_proc(&CallContext::main(), "call-test-unregistered", Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::Remote(ref e) if e.kind == "UnknownCallable"));
    }

    #[test]
    fn test_closure_job_rejected_for_exec() {
        let options = CallOptions::new("closure-exec").must_exec(true);
        let err = run_remotely(
            &CallContext::main(),
            Job::closure(|_ctx| Ok(Value::Null)),
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotTransmissible(_)));
    }
}
