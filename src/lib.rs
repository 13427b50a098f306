#[macro_use]
extern crate log;

mod action_log;
mod annotation;
mod cli;
mod config;
mod env;
mod error;
mod logger;
mod oracle;
mod params;
mod pattern;
mod registry;
mod resources;
mod runner;
mod scheduler;
mod stat_cache;
mod step;
mod step_context;

#[cfg(test)]
mod tests;

pub use action_log::{ActionLog, ActionRecord, StepRecord, SubStepRecord};
pub use annotation::{Annotated, Annotations, emphasized, exists, optional, phony, precious};
pub use cli::{EngineArgs, make, make_with};
pub use error::{Error, Result};
pub use logger::LogLevel;
pub use oracle::RunReason;
pub use params::{Flags, ParamStore};
pub use pattern::{Bindings, Pattern};
pub use registry::StepRegistry;
pub use runner::Action;
pub use scheduler::{Build, BuildReport};
pub use step::{InstanceKey, Step};
pub use step_context::StepContext;
