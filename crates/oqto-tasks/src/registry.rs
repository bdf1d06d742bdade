//! Named function registries.
//!
//! Closures cannot cross an exec boundary, and a nested call always runs in
//! a different process than the one that asked for it, so functions travel
//! as a [`Callable`] (name plus arguments) and are looked up here on the
//! receiving side. Every binary that can act as a worker has to register
//! the same names before calling [`crate::bootstrap::check_exec`].
//!
//! Three kinds of functions are kept apart:
//! - callables, run by [`crate::call::run_remotely`] and nested calls;
//! - task entries, the worker side of a [`Task`];
//! - process entries, the raw target of [`crate::process::ProcessHandle::exec_with`].

use crate::call::{self, CallContext};
use crate::error::{Error, RemoteError, Result};
use crate::protocol::Callable;
use crate::task::{self, Task};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

pub type CallableFn =
    Arc<dyn Fn(&CallContext<'_>, Value) -> std::result::Result<Value, RemoteError> + Send + Sync>;
pub type EntryFn = Arc<dyn Fn(&mut Task, Value) -> anyhow::Result<()> + Send + Sync>;
pub type ProcessFn = Arc<dyn Fn(Value, Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

static CALLABLES: Lazy<DashMap<String, CallableFn>> = Lazy::new(DashMap::new);

static ENTRIES: Lazy<DashMap<String, EntryFn>> = Lazy::new(|| {
    let map: DashMap<String, EntryFn> = DashMap::new();
    map.insert(call::CALL_ENTRY.to_string(), Arc::new(call::serve_call_entry));
    map
});

static PROCESSES: Lazy<DashMap<String, ProcessFn>> = Lazy::new(|| {
    let map: DashMap<String, ProcessFn> = DashMap::new();
    map.insert(task::TASK_ENTRY.to_string(), Arc::new(task::run_exec_task));
    map
});

/// Register a callable under `name`, replacing any previous one.
pub fn register<F>(name: impl Into<String>, f: F)
where
    F: Fn(&CallContext<'_>, Value) -> std::result::Result<Value, RemoteError>
        + Send
        + Sync
        + 'static,
{
    CALLABLES.insert(name.into(), Arc::new(f));
}

/// Register a callable with typed arguments and result.
pub fn register_typed<A, R, F>(name: impl Into<String>, f: F)
where
    A: DeserializeOwned,
    R: Serialize,
    F: Fn(&CallContext<'_>, A) -> std::result::Result<R, RemoteError> + Send + Sync + 'static,
{
    register(name, move |ctx, args| {
        let args: A = serde_json::from_value(args)?;
        let result = f(ctx, args)?;
        Ok(serde_json::to_value(result)?)
    });
}

/// Register a callable that always runs in the main process.
///
/// Invoked in a worker (including a worker answering a nested call for a
/// worker of its own), it forwards itself one step up the call chain until
/// it reaches the main process.
pub fn register_in_main<F>(name: impl Into<String>, f: F)
where
    F: Fn(Value) -> std::result::Result<Value, RemoteError> + Send + Sync + 'static,
{
    let name = name.into();
    let forward_as = name.clone();
    register(name, move |ctx, args| match ctx {
        CallContext::Main => f(args),
        CallContext::Worker(_) => {
            Ok(ctx.exec_in_main_proc(&Callable::new(forward_as.clone(), args))?)
        }
    });
}

/// Register a task entry under `name`.
pub fn register_entry<F>(name: impl Into<String>, f: F)
where
    F: Fn(&mut Task, Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    ENTRIES.insert(name.into(), Arc::new(f));
}

/// Register a process entry under `name`.
///
/// The entry receives the callable's bound arguments and the positional
/// arguments from the handshake; its return value is sent back to the
/// parent as the exit value.
pub fn register_process<F>(name: impl Into<String>, f: F)
where
    F: Fn(Value, Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    PROCESSES.insert(name.into(), Arc::new(f));
}

/// Names of all registered callables, sorted.
pub fn callable_names() -> Vec<String> {
    let mut names: Vec<String> = CALLABLES.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
}

pub fn is_registered(name: &str) -> bool {
    CALLABLES.contains_key(name)
}

// Lookups clone the Arc out so no map shard stays locked while the function
// runs (it may register or look up other names).

pub(crate) fn lookup_callable(name: &str) -> Result<CallableFn> {
    CALLABLES
        .get(name)
        .map(|f| f.value().clone())
        .ok_or_else(|| Error::UnknownCallable(name.to_string()))
}

pub(crate) fn lookup_entry(name: &str) -> Result<EntryFn> {
    ENTRIES
        .get(name)
        .map(|f| f.value().clone())
        .ok_or_else(|| Error::UnknownCallable(name.to_string()))
}

pub(crate) fn lookup_process(name: &str) -> Result<ProcessFn> {
    PROCESSES
        .get(name)
        .map(|f| f.value().clone())
        .ok_or_else(|| Error::UnknownCallable(name.to_string()))
}

/// Run a callable in this process.
pub fn invoke(
    ctx: &CallContext<'_>,
    callable: &Callable,
) -> std::result::Result<Value, RemoteError> {
    let f = lookup_callable(&callable.name)?;
    f(ctx, callable.args.clone())
}
