//! Process role tracking.
//!
//! Every process taking part in a task records once whether it is the
//! original process or a spawned worker. The accessors here are for code
//! that has no task or call context at hand (diagnostics, guards); code that
//! does should ask its [`Task`](crate::task::Task) or
//! [`CallContext`](crate::call::CallContext) instead.

use log::warn;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

const UNSET: u8 = 0;
const PARENT: u8 = 1;
const CHILD: u8 = 2;

static ROLE: AtomicU8 = AtomicU8::new(UNSET);
static IS_FORK: AtomicBool = AtomicBool::new(false);
static FORK_WARNED: AtomicBool = AtomicBool::new(false);

/// Which side of a spawn this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Parent,
    Child,
}

/// The recorded role, or `None` if this process never spawned or was spawned.
pub fn current() -> Option<ProcessRole> {
    match ROLE.load(Ordering::Acquire) {
        PARENT => Some(ProcessRole::Parent),
        CHILD => Some(ProcessRole::Child),
        _ => None,
    }
}

/// True unless this process is a spawned worker.
pub fn is_main_process() -> bool {
    current() != Some(ProcessRole::Child)
}

/// True in a worker created by fork without exec.
pub fn is_fork() -> bool {
    IS_FORK.load(Ordering::Acquire)
}

/// Record that this process spawned a worker. No-op once any role is set.
pub(crate) fn mark_parent() {
    let _ = ROLE.compare_exchange(UNSET, PARENT, Ordering::AcqRel, Ordering::Acquire);
}

/// Record that this process is a worker. First thing a child does.
pub(crate) fn mark_child(forked_without_exec: bool) {
    ROLE.store(CHILD, Ordering::Release);
    IS_FORK.store(forked_without_exec, Ordering::Release);
    FORK_WARNED.store(false, Ordering::Release);
}

/// Run `f` unless this is a fork-without-exec worker.
///
/// Inside such a worker the locks and native state inherited from the
/// parent may be inconsistent, so `f` is skipped, `None` is returned and a
/// warning is logged (once per process).
pub fn guard_not_in_fork<T>(label: &str, f: impl FnOnce() -> T) -> Option<T> {
    if is_fork() {
        if !FORK_WARNED.swap(true, Ordering::AcqRel) {
            warn!("{label}: must not be run in a forked worker without exec, skipping");
        }
        return None;
    }
    Some(f())
}
