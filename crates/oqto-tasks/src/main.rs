//! oqto-tasks - run registered functions in isolated worker processes.
//!
//! Usage:
//!   oqto-tasks list
//!   oqto-tasks call sum '[1, 2, 3]'
//!   oqto-tasks --must-exec call main-pid

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::debug;
use serde_json::{Value, json};

use oqto_tasks::call::{self, CallContext, CallOptions, Job};
use oqto_tasks::config::Config;
use oqto_tasks::{RemoteError, bootstrap, logging, registry};

#[derive(Parser, Debug)]
#[command(name = "oqto-tasks")]
#[command(about = "Run registered functions in isolated worker processes")]
#[command(version)]
struct Args {
    /// Config file path (TOML).
    #[arg(short, long, env = "OQTO_TASKS_CONFIG")]
    config: Option<PathBuf>,

    /// Fork and exec a fresh worker instead of forking only.
    #[arg(long)]
    must_exec: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a registered callable in a worker and print its result.
    Call {
        /// Callable name.
        name: String,

        /// Arguments as JSON (default: null).
        args: Option<String>,
    },
    /// List registered callables.
    List,
}

fn register_demo_callables() {
    registry::register("echo", |_ctx, args| Ok(args));
    registry::register("pid", |_ctx, _args| Ok(json!(std::process::id())));
    registry::register("fail", |_ctx, args| {
        let message = args.as_str().unwrap_or("requested failure").to_string();
        Err(RemoteError::new("DemoError", message))
    });
    registry::register_typed("sum", |_ctx, values: Vec<i64>| {
        Ok::<_, RemoteError>(values.iter().sum::<i64>())
    });
    // Asks the process that started the call for its pid.
    registry::register("main-pid", |ctx, _args| {
        Ok(call::in_main_proc(ctx, "pid", Value::Null)?)
    });
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env();
    if args.must_exec {
        config.must_exec = true;
    }
    if args.verbose {
        config.verbose = true;
    }
    Ok(config)
}

fn main() -> Result<()> {
    register_demo_callables();
    bootstrap::check_exec();

    let args = Args::parse();
    logging::init(args.verbose);
    let config = load_config(&args)?;
    debug!("config: {config:?}");

    match args.command {
        Command::Call { name, args } => {
            let args: Value = match args {
                Some(raw) => serde_json::from_str(&raw).context("parsing call arguments")?,
                None => Value::Null,
            };
            let options = CallOptions::new(format!("oqto-tasks {name}")).with_config(config);
            let result = call::run_remotely(&CallContext::main(), Job::call(name, args), &options)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::List => {
            for name in registry::callable_names() {
                println!("{name}");
            }
        }
    }
    Ok(())
}
