use std::path::PathBuf;

use clap::Parser;

use crate::Result;
use crate::config;
use crate::logger::{self, LogLevel};
use crate::params::{Flags, ParamStore};
use crate::registry::StepRegistry;
use crate::scheduler::Build;

/// The engine's command-line contract. An embedding program parses this and
/// hands it to [`make_with`], or just calls [`make`].
#[derive(Debug, Clone, Parser)]
#[clap(name = "dynamake", about = env!("CARGO_PKG_DESCRIPTION"), version = env!("CARGO_PKG_VERSION"))]
pub struct EngineArgs {
    /// Additional configuration files, loaded in order after DynaMake.yaml
    #[clap(long, value_name = "PATH")]
    pub config: Vec<PathBuf>,
    /// Step definition modules to load
    #[clap(long, value_name = "NAME")]
    pub module: Vec<String>,
    /// Cap on concurrent external commands (0 unlimited, negative = fraction
    /// of logical CPUs)
    #[clap(short, long, value_name = "N", allow_hyphen_values = true)]
    pub jobs: Option<i64>,
    /// Rebuild steps whose recorded actions, inputs, outputs or parameters
    /// changed
    #[clap(long = "rebuild_changed_actions", value_name = "BOOL")]
    pub rebuild_changed_actions: Option<bool>,
    /// Stop starting new actions after the first failure
    #[clap(long = "failure_aborts_build", value_name = "BOOL")]
    pub failure_aborts_build: Option<bool>,
    /// Delete non-precious outputs before running a step's first action
    #[clap(long = "remove_stale_outputs", value_name = "BOOL")]
    pub remove_stale_outputs: Option<bool>,
    /// Delete non-precious outputs of failed actions
    #[clap(long = "remove_failed_outputs", value_name = "BOOL")]
    pub remove_failed_outputs: Option<bool>,
    /// Delete directories rendered empty by output removal
    #[clap(long = "remove_empty_directories", value_name = "BOOL")]
    pub remove_empty_directories: Option<bool>,
    /// Touch outputs after success so they are newer than all inputs
    #[clap(long = "touch_success_outputs", value_name = "BOOL")]
    pub touch_success_outputs: Option<bool>,
    /// Wait for outputs to become visible on NFS
    #[clap(long = "wait_nfs_outputs", value_name = "BOOL")]
    pub wait_nfs_outputs: Option<bool>,
    /// Seconds to wait for NFS outputs
    #[clap(long = "nfs_outputs_timeout", value_name = "SECONDS")]
    pub nfs_outputs_timeout: Option<u64>,
    /// Log actions skipped as up to date
    #[clap(long = "log_skipped_actions", value_name = "BOOL")]
    pub log_skipped_actions: Option<bool>,
    /// Dry run: stop each step at its first action that would run
    #[clap(short = 'n', long = "no_actions")]
    pub no_actions: bool,
    /// Log verbosity
    #[clap(long = "log-level", value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
    /// Targets to build
    #[clap(value_name = "TARGET", required = true)]
    pub targets: Vec<String>,
}

impl EngineArgs {
    /// Apply the CLI overrides, the highest-precedence parameter layer.
    pub fn apply(&self, store: &mut ParamStore) -> Result<()> {
        if let Some(jobs) = self.jobs {
            store.set_override_value("jobs", jobs)?;
        }
        for (name, value) in [
            ("rebuild_changed_actions", self.rebuild_changed_actions),
            ("failure_aborts_build", self.failure_aborts_build),
            ("remove_stale_outputs", self.remove_stale_outputs),
            ("remove_failed_outputs", self.remove_failed_outputs),
            ("remove_empty_directories", self.remove_empty_directories),
            ("touch_success_outputs", self.touch_success_outputs),
            ("wait_nfs_outputs", self.wait_nfs_outputs),
            ("log_skipped_actions", self.log_skipped_actions),
        ] {
            if let Some(value) = value {
                store.set_override_value(name, value)?;
            }
        }
        if let Some(timeout) = self.nfs_outputs_timeout {
            store.set_override_value("nfs_outputs_timeout", timeout)?;
        }
        if self.no_actions {
            store.set_override_value("no_actions", true)?;
        }
        if let Some(level) = self.log_level {
            store.set_override_value("log_level", level.to_string())?;
        }
        Ok(())
    }
}

/// Entry point for an embedding program: parse the command line, register
/// steps, run the requested targets. Returns the process exit code.
pub fn make<F>(register: F) -> Result<i32>
where
    F: FnOnce(&EngineArgs, &mut StepRegistry) -> Result<()>,
{
    let _ = color_eyre::install();
    make_with(EngineArgs::parse(), register)
}

pub fn make_with<F>(args: EngineArgs, register: F) -> Result<i32>
where
    F: FnOnce(&EngineArgs, &mut StepRegistry) -> Result<()>,
{
    let root = std::env::current_dir()?;
    let mut store = ParamStore::new();
    config::load_project_file(&mut store, &root)?;
    for path in &args.config {
        config::load_file(&mut store, path)?;
    }
    args.apply(&mut store)?;
    let flags = Flags::resolve(&store)?;
    logger::init(flags.log_level);

    let mut registry = StepRegistry::default();
    register(&args, &mut registry)?;

    let build = Build::new(registry, store)?;
    match build.run(args.targets.iter().map(|t| t.as_str())) {
        Ok(_) => Ok(0),
        Err(err) => {
            error!("{err:#}");
            Ok(1)
        }
    }
}
