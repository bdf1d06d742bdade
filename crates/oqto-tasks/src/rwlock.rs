//! Reader/writer lock with a reentrant write section.
//!
//! Recursion rules:
//! - Inside a read section, another read section is fine.
//! - Inside a write section, any further read or write section is fine.
//! - Inside a read section, a write section always blocks, even on the same
//!   thread: the outer read keeps the reader count above zero until it ends.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    readers: usize,
    writer: Option<ThreadId>,
    write_depth: usize,
}

impl State {
    fn write_blocked(&self, me: ThreadId) -> bool {
        self.readers > 0 || self.writer.is_some_and(|owner| owner != me)
    }

    fn read_blocked(&self, me: ThreadId) -> bool {
        self.writer.is_some_and(|owner| owner != me)
    }
}

/// Data-less reader/writer lock. Sections end when their guard drops.
#[derive(Debug, Default)]
pub struct ReadWriteLock {
    state: Mutex<State>,
    changed: Condvar,
}

/// An open read section.
#[must_use = "the read section ends when the guard is dropped"]
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a ReadWriteLock,
}

/// An open write section.
#[must_use = "the write section ends when the guard is dropped"]
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a ReadWriteLock,
}

impl ReadWriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter a read section. Waits only while another thread is writing.
    pub fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.lock_state();
        while state.read_blocked(me) {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.readers += 1;
        ReadGuard { lock: self }
    }

    /// Enter a write section once no read section is open.
    pub fn write(&self) -> WriteGuard<'_> {
        let me = thread::current().id();
        let mut state = self.lock_state();
        while state.write_blocked(me) {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.enter_write(&mut state, me)
    }

    /// Like [`write`](Self::write), giving up after `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> Option<WriteGuard<'_>> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        while state.write_blocked(me) {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (next, _) = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        Some(self.enter_write(&mut state, me))
    }

    /// Number of open read sections, across all threads.
    pub fn reader_count(&self) -> usize {
        self.lock_state().readers
    }

    fn enter_write(&self, state: &mut State, me: ThreadId) -> WriteGuard<'_> {
        state.writer = Some(me);
        state.write_depth += 1;
        WriteGuard { lock: self }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.lock_state();
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.changed.notify_all();
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.lock_state();
        state.write_depth -= 1;
        if state.write_depth == 0 {
            state.writer = None;
            self.lock.changed.notify_all();
        }
    }
}
