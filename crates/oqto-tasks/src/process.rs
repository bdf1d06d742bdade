//! Worker process spawning and lifecycle.
//!
//! Two strategies:
//! - [`SpawnStrategy::Fork`]: the child is a memory copy of the caller that
//!   runs a closure and exits. Fast, but it inherits every open resource and
//!   any lock another thread held at fork time.
//! - [`SpawnStrategy::ForkExec`]: the child replaces its image with a fresh
//!   run of the worker executable (by default the current one), which picks
//!   up its job through [`crate::bootstrap::check_exec`].

use crate::bootstrap::FORK_EXEC_FLAG;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::Callable;
use crate::role;
use crate::transport::{self, Transport};
use fork::Fork;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default step for timed joins.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// How a worker process is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStrategy {
    /// fork() only.
    Fork,
    /// fork() followed by exec() of the worker executable.
    ForkExec,
}

/// Options for [`ProcessHandle::exec_with`].
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Executable to run; defaults to the current executable.
    pub worker_exe: Option<PathBuf>,
    /// Environment overrides applied to the child.
    pub env: HashMap<String, String>,
    /// Extra descriptors the child inherits (close-on-exec cleared in the child only).
    pub inherit_fds: Vec<RawFd>,
    /// Step for timed joins.
    pub poll_interval: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            worker_exe: None,
            env: HashMap::new(),
            inherit_fds: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Handle to a spawned worker process.
///
/// The exit status is fetched lazily, cached once known, and never queried
/// again; the pid is forgotten as soon as the process is reaped.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: Option<i32>,
    strategy: SpawnStrategy,
    parent_pid: u32,
    exit_status: Option<ExitStatus>,
    poll_interval: Duration,
    /// fork+exec only: the bootstrap pipes, kept to collect the exit value.
    bootstrap: Option<Channel>,
    exit_value: Option<Value>,
}

impl ProcessHandle {
    fn new(name: String, pid: i32, strategy: SpawnStrategy, poll_interval: Duration) -> Self {
        Self {
            name,
            pid: Some(pid),
            strategy,
            parent_pid: std::process::id(),
            exit_status: None,
            poll_interval,
            bootstrap: None,
            exit_value: None,
        }
    }

    /// Fork and run `f` in the child, exiting with its return code.
    ///
    /// The child never returns into the caller's code: after `f` it leaves
    /// through `_exit`, skipping destructors and atexit handlers inherited
    /// from the parent. A panic in `f` exits with status 1.
    pub fn fork_with<F>(name: impl Into<String>, f: F) -> Result<Self>
    where
        F: FnOnce() -> i32,
    {
        let name = name.into();
        role::mark_parent();
        // Unflushed output would otherwise be written twice.
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        match fork::fork() {
            Ok(Fork::Child) => {
                role::mark_child(true);
                let code = match panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(code) => code,
                    Err(_) => {
                        error!("{name}: worker panicked");
                        1
                    }
                };
                let _ = io::stdout().flush();
                let _ = io::stderr().flush();
                // SAFETY: terminates this process; nothing runs afterwards.
                unsafe { libc::_exit(code) }
            }
            Ok(Fork::Parent(pid)) => {
                debug!("{name}: forked worker pid {pid}");
                Ok(Self::new(
                    name,
                    pid,
                    SpawnStrategy::Fork,
                    DEFAULT_POLL_INTERVAL,
                ))
            }
            Err(_) => Err(Error::Spawn(format!(
                "fork failed: {}",
                io::Error::last_os_error()
            ))),
        }
    }

    /// Fork and exec the worker executable, then hand it `target` and `args`.
    ///
    /// The child is started as `<exe> --fork-exec-proc <write_fd> <read_fd>`
    /// with stdin on `/dev/null`. The handshake frames (`name`, `target`,
    /// `args`) are written to it before this returns.
    pub fn exec_with(
        name: impl Into<String>,
        target: &Callable,
        args: &[Value],
        options: &ExecOptions,
    ) -> Result<Self> {
        let name = name.into();
        role::mark_parent();

        let exe = match &options.worker_exe {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };

        let (p2c_read, p2c_write) = rustix::pipe::pipe()?;
        let (c2p_read, c2p_write) = rustix::pipe::pipe()?;
        for fd in [&p2c_read, &p2c_write, &c2p_read, &c2p_write] {
            transport::set_cloexec(fd.as_raw_fd(), true)?;
        }

        let child_write = c2p_write.as_raw_fd();
        let child_read = p2c_read.as_raw_fd();
        let mut inherit = vec![child_write, child_read];
        inherit.extend(options.inherit_fds.iter().copied());

        let mut command = Command::new(&exe);
        command
            .arg(FORK_EXEC_FLAG)
            .arg(child_write.to_string())
            .arg(child_read.to_string())
            .stdin(Stdio::null())
            .envs(&options.env);
        // SAFETY: runs between fork and exec; fcntl is async-signal-safe and
        // the closure does not allocate.
        unsafe {
            command.pre_exec(move || {
                for fd in &inherit {
                    transport::set_cloexec(*fd, false)?;
                }
                Ok(())
            });
        }

        debug!(
            "{name}: exec {} {FORK_EXEC_FLAG} {child_write} {child_read}",
            exe.display()
        );
        let child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("exec {}: {e}", exe.display())))?;
        let pid = child.id() as i32;
        // Reaped through waitpid by this handle.
        drop(child);
        drop(p2c_read);
        drop(c2p_write);

        let mut handle = Self::new(name, pid, SpawnStrategy::ForkExec, options.poll_interval);
        let mut bootstrap = Channel::new(Transport::new(c2p_read, p2c_write));

        let handshake = bootstrap
            .send(&handle.name)
            .and_then(|_| bootstrap.send(target))
            .and_then(|_| bootstrap.send(args));
        if let Err(e) = handshake {
            warn!("{}: handshake with worker pid {pid} failed: {e}", handle.name);
            handle.kill()?;
            return Err(Error::Spawn(format!("handshake failed: {e}")));
        }

        handle.bootstrap = Some(bootstrap);
        info!("{}: started worker pid {pid}", handle.name);
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid while the process is tracked (not yet reaped).
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn strategy(&self) -> SpawnStrategy {
        self.strategy
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Value returned by the exec'd worker's entry, once reaped.
    pub fn exit_value(&self) -> Option<&Value> {
        self.exit_value.as_ref()
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    fn wait(&mut self, nohang: bool) -> Result<()> {
        if std::process::id() != self.parent_pid {
            return Err(Error::NotParent);
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        let options = if nohang { libc::WNOHANG } else { 0 };
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: status points to a valid c_int.
            let ret = unsafe { libc::waitpid(pid, &mut status, options) };
            if ret == pid {
                break;
            }
            if ret == 0 {
                // Still running.
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECHILD) => {
                    // Reaped elsewhere; nothing more to learn.
                    debug!("{}: pid {pid} already reaped", self.name);
                    self.pid = None;
                    return Ok(());
                }
                _ => return Err(err.into()),
            }
        }

        let exit_status = ExitStatus::from_raw(status);
        debug!("{}: pid {pid} exited with {exit_status}", self.name);
        self.exit_status = Some(exit_status);
        self.pid = None;
        self.collect_exit_value();
        Ok(())
    }

    fn collect_exit_value(&mut self) {
        let Some(mut bootstrap) = self.bootstrap.take() else {
            return;
        };
        // The worker is gone; whatever it wrote is already in the pipe. A
        // grandchild still holding the pipe must not block us.
        if let Some((read_fd, _)) = bootstrap.raw_fds() {
            let _ = transport::set_nonblocking(read_fd, true);
        }
        match bootstrap.recv::<Value>() {
            Ok(value) => self.exit_value = Some(value),
            Err(e) => debug!("{}: no exit value: {e}", self.name),
        }
        bootstrap.close();
    }

    /// Non-blocking liveness check; caches the exit status if it exited.
    pub fn is_alive(&mut self) -> bool {
        if self.pid.is_none() {
            return false;
        }
        if let Err(e) = self.wait(true) {
            debug!("{}: liveness check failed: {e}", self.name);
            return false;
        }
        self.pid.is_some()
    }

    /// Wait for the process to exit.
    ///
    /// With a timeout the wait is coarse: it polls every `poll_interval`
    /// (one second by default) and, once less than one interval remains,
    /// sleeps the remainder once and returns whether or not the process
    /// exited. Do not rely on sub-interval accuracy.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let Some(mut remaining) = timeout else {
            return self.wait(false);
        };
        while self.is_alive() {
            if remaining < self.poll_interval {
                thread::sleep(remaining);
                self.is_alive();
                break;
            }
            thread::sleep(self.poll_interval);
            remaining -= self.poll_interval;
        }
        Ok(())
    }

    /// Send SIGINT if the process is still tracked as alive.
    pub fn terminate(&mut self) {
        if let Some(pid) = self.pid.filter(|_| self.is_alive()) {
            send_signal(pid, libc::SIGINT);
        }
    }

    /// Interrupt the process, give it `grace` to exit, then kill it.
    ///
    /// Always leaves the process reaped. Errors are logged, not returned.
    pub(crate) fn shutdown(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        self.terminate();
        let deadline = Instant::now() + grace;
        while self.is_alive() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL);
        }
        if let Err(e) = self.kill() {
            debug!("{}: kill after grace period failed: {e}", self.name);
        }
    }

    /// Send SIGKILL and reap.
    pub fn kill(&mut self) -> Result<()> {
        if let Some(pid) = self.pid.filter(|_| self.is_alive()) {
            send_signal(pid, libc::SIGKILL);
            self.wait(false)?;
        }
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(pid) = self.pid
            && std::process::id() == self.parent_pid
        {
            debug!("{}: handle dropped while pid {pid} is unreaped", self.name);
        }
    }
}

/// Deliver `signal` to `pid`, ignoring failures (the process may be gone).
pub(crate) fn send_signal(pid: i32, signal: libc::c_int) {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == -1 {
        debug!(
            "signal {signal} to pid {pid} failed: {}",
            io::Error::last_os_error()
        );
    }
}
