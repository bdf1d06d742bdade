//! Startup path of a fork+exec worker.
//!
//! A worker is the same program started again as
//! `<exe> --fork-exec-proc <write_fd> <read_fd>`. [`check_exec`] recognizes
//! that invocation, reads the handshake frames `name`, `target` and `args`
//! from `read_fd`, runs the process entry registered as `target.name`, writes
//! its return value to `write_fd` and exits. The program's own `main` never
//! continues in a worker.

use crate::channel::Channel;
use crate::error::{RemoteError, Result};
use crate::logging;
use crate::protocol::Callable;
use crate::registry;
use crate::role;
use crate::transport;
use log::{debug, error};
use serde_json::Value;
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};

/// Command-line flag marking a fork+exec worker.
pub const FORK_EXEC_FLAG: &str = "--fork-exec-proc";

/// Enables debug logging in an exec'd worker.
pub const ENV_VERBOSE: &str = "OQTO_TASKS_VERBOSE";

/// Take over the process if it was started as a fork+exec worker.
///
/// Call this first in `main`, after registering callables and entries and
/// before parsing arguments or starting threads. Returns normally when the
/// worker flag is absent; otherwise it never returns. Exit code 0 means the
/// entry ran and returned, 1 means the handshake or the entry failed.
pub fn check_exec() {
    let args: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let Some(pos) = args.iter().position(|arg| arg == FORK_EXEC_FLAG) else {
        return;
    };

    logging::init_from_env();
    let code = match parse_fds(&args[pos + 1..]) {
        Some((write_fd, read_fd)) => run_worker(write_fd, read_fd),
        None => {
            error!("{FORK_EXEC_FLAG} expects <write_fd> <read_fd>, got {:?}", &args[pos + 1..]);
            1
        }
    };
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    std::process::exit(code);
}

fn parse_fds(args: &[String]) -> Option<(RawFd, RawFd)> {
    match args {
        [write, read, ..] => Some((write.parse().ok()?, read.parse().ok()?)),
        _ => None,
    }
}

struct Handshake {
    name: String,
    target: Callable,
    args: Vec<Value>,
}

fn read_handshake(channel: &mut Channel) -> Result<Handshake> {
    Ok(Handshake {
        name: channel.recv()?,
        target: channel.recv()?,
        args: channel.recv()?,
    })
}

fn run_worker(write_fd: RawFd, read_fd: RawFd) -> i32 {
    role::mark_child(false);

    let mut bootstrap = match Channel::from_inherited_fds(read_fd, write_fd) {
        Ok(channel) => channel,
        Err(e) => {
            error!("worker bootstrap: {e}");
            return 1;
        }
    };
    let Handshake { name, target, args } = match read_handshake(&mut bootstrap) {
        Ok(handshake) => handshake,
        Err(e) => {
            error!("worker bootstrap: handshake failed: {e}");
            return 1;
        }
    };

    let pid = std::process::id();
    debug!("{name}: worker pid {pid} running {}", target.name);
    let entry = match registry::lookup_process(&target.name) {
        Ok(entry) => entry,
        Err(e) => {
            error!("{name}: {e}");
            return 1;
        }
    };

    let exit_value = match panic::catch_unwind(AssertUnwindSafe(|| entry(target.args, args))) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            error!("{name}: worker failed: {e:#}");
            return 1;
        }
        Err(payload) => {
            error!("{name}: worker panicked: {}", RemoteError::from_panic(payload).message);
            return 1;
        }
    };

    // The parent reads the exit value only after reaping us; never block on it.
    if let Some((_, write)) = bootstrap.raw_fds() {
        let _ = transport::set_nonblocking(write, true);
    }
    if let Err(e) = bootstrap.send(&exit_value) {
        debug!("{name}: exit value not delivered: {e}");
    }
    bootstrap.close();
    debug!("{name}: worker pid {pid} done");
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_fds() {
        assert_eq!(parse_fds(&strings(&["7", "4"])), Some((7, 4)));
        assert_eq!(parse_fds(&strings(&["7", "4", "extra"])), Some((7, 4)));
        assert_eq!(parse_fds(&strings(&["7"])), None);
        assert_eq!(parse_fds(&strings(&["x", "4"])), None);
    }

    #[test]
    fn test_check_exec_returns_without_flag() {
        // The unit test binary is never started with the worker flag.
        check_exec();
    }
}
