//! Logger setup shared by the CLI and exec'd workers.

use crate::bootstrap::ENV_VERBOSE;
use crate::config::parse_flag;

/// Install the `env_logger` backend.
///
/// `RUST_LOG` wins when set; otherwise the filter is `debug` with `verbose`
/// and `info` without. Safe to call more than once.
pub fn init(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .try_init();
}

/// [`init`] with verbosity taken from `OQTO_TASKS_VERBOSE`.
pub fn init_from_env() {
    let verbose = std::env::var(ENV_VERBOSE).is_ok_and(|v| parse_flag(&v));
    init(verbose);
}
