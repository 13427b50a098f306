//! Typed global parameters with layered resolution.
//!
//! Precedence, lowest first: hard-coded default, project config file,
//! `--config` files in load order, explicit CLI override. The engine's own
//! flags are registered here like any user parameter, so the same chain
//! applies to them.

use std::collections::BTreeMap;
use std::str::FromStr;

use indexmap::IndexMap;
use serde_yaml::Value;

use crate::Result;
use crate::error::Error;
use crate::logger::LogLevel;
use crate::env;

#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub default: Value,
    pub help: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    defs: IndexMap<String, ParamDef>,
    file_layers: Vec<BTreeMap<String, Value>>,
    overrides: BTreeMap<String, Value>,
    resources: IndexMap<String, u64>,
}

impl ParamStore {
    /// A store with the engine's builtin parameters registered.
    pub fn new() -> Self {
        let mut store = ParamStore::default();
        let jobs_default = env::DYNAMAKE_JOBS.unwrap_or(-1);
        for (name, default, help) in [
            (
                "jobs",
                Value::from(jobs_default),
                "cap on concurrent external commands (0 unlimited, negative = fraction of logical CPUs)",
            ),
            (
                "rebuild_changed_actions",
                Value::from(true),
                "rebuild steps whose recorded actions, inputs, outputs or parameters changed",
            ),
            (
                "failure_aborts_build",
                Value::from(true),
                "stop starting new actions after the first failure",
            ),
            (
                "remove_stale_outputs",
                Value::from(true),
                "delete non-precious outputs before running a step's first action",
            ),
            (
                "remove_failed_outputs",
                Value::from(true),
                "delete non-precious outputs of failed actions",
            ),
            (
                "remove_empty_directories",
                Value::from(false),
                "delete directories rendered empty by output removal",
            ),
            (
                "touch_success_outputs",
                Value::from(false),
                "touch outputs after success so they are newer than all inputs",
            ),
            (
                "wait_nfs_outputs",
                Value::from(false),
                "wait for outputs to become visible on NFS before declaring them missing",
            ),
            (
                "nfs_outputs_timeout",
                Value::from(60),
                "seconds to wait for NFS outputs",
            ),
            (
                "log_skipped_actions",
                Value::from(false),
                "log actions that were skipped as up-to-date",
            ),
            (
                "no_actions",
                Value::from(false),
                "dry run: stop each step at its first action that would run",
            ),
            (
                "log_level",
                Value::from("WARN"),
                "log verbosity (STDOUT, STDERR, INFO, FILE, WHY, TRACE, DEBUG, WARN)",
            ),
        ] {
            store
                .define(name, default, help)
                .expect("builtin parameters are unique");
        }
        store
    }

    pub fn define(
        &mut self,
        name: impl Into<String>,
        default: impl Into<Value>,
        help: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        if self.defs.contains_key(&name) {
            eyre::bail!("parameter `{name}` is already defined");
        }
        self.defs.insert(
            name.clone(),
            ParamDef {
                name,
                default: default.into(),
                help: help.into(),
            },
        );
        Ok(())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    pub fn defs(&self) -> impl Iterator<Item = &ParamDef> {
        self.defs.values()
    }

    /// Register a parameter as a consumable resource. Its resolved value is
    /// the global budget; `default_draw` is drawn per action unless the
    /// action overrides it.
    pub fn resource_parameter(&mut self, name: &str, default_draw: u64) -> Result<()> {
        if !self.is_defined(name) {
            return Err(Error::UnknownParameter(name.to_string()).into());
        }
        self.resources.insert(name.to_string(), default_draw);
        Ok(())
    }

    pub fn resource_defaults(&self) -> &IndexMap<String, u64> {
        &self.resources
    }

    pub(crate) fn push_file_layer(&mut self, layer: BTreeMap<String, Value>) {
        self.file_layers.push(layer);
    }

    /// Parse a raw override with the parameter's declared type.
    fn parse_as(def: &ParamDef, raw: &str) -> Result<Value> {
        let invalid = || Error::InvalidParameterValue {
            name: def.name.clone(),
            value: raw.to_string(),
        };
        let value = match &def.default {
            Value::Bool(_) => Value::Bool(bool::from_str(raw).map_err(|_| invalid())?),
            Value::Number(n) if n.is_f64() => {
                Value::from(f64::from_str(raw).map_err(|_| invalid())?)
            }
            Value::Number(_) => Value::from(i64::from_str(raw).map_err(|_| invalid())?),
            Value::String(_) => Value::String(raw.to_string()),
            _ => serde_yaml::from_str(raw).map_err(|_| invalid())?,
        };
        Ok(value)
    }

    pub fn set_override(&mut self, name: &str, raw: &str) -> Result<()> {
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        let value = Self::parse_as(def, raw)?;
        self.overrides.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_override_value(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        if !self.is_defined(name) {
            return Err(Error::UnknownParameter(name.to_string()).into());
        }
        self.overrides.insert(name.to_string(), value.into());
        Ok(())
    }

    pub fn value(&self, name: &str) -> Result<Value> {
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        if let Some(value) = self.overrides.get(name) {
            return Ok(value.clone());
        }
        for layer in self.file_layers.iter().rev() {
            if let Some(value) = layer.get(name) {
                return Ok(value.clone());
            }
        }
        Ok(def.default.clone())
    }

    /// Stable string rendering, as recorded in action logs.
    pub fn value_str(&self, name: &str) -> Result<String> {
        let value = self.value(name)?;
        Ok(match value {
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Null => "null".to_string(),
            other => serde_yaml::to_string(&other)?.trim_end().to_string(),
        })
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.value(name)? {
            Value::Bool(b) => Ok(b),
            other => Err(self.type_error(name, &other)),
        }
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        match self.value(name)? {
            Value::Number(n) if n.as_i64().is_some() => Ok(n.as_i64().unwrap()),
            other => Err(self.type_error(name, &other)),
        }
    }

    pub fn get_u64(&self, name: &str) -> Result<u64> {
        match self.value(name)? {
            Value::Number(n) if n.as_u64().is_some() => Ok(n.as_u64().unwrap()),
            other => Err(self.type_error(name, &other)),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<String> {
        match self.value(name)? {
            Value::String(s) => Ok(s),
            other => Err(self.type_error(name, &other)),
        }
    }

    fn type_error(&self, name: &str, value: &Value) -> eyre::Report {
        Error::InvalidParameterValue {
            name: name.to_string(),
            value: serde_yaml::to_string(value)
                .unwrap_or_default()
                .trim_end()
                .to_string(),
        }
        .into()
    }
}

/// The engine flags, resolved once per build.
#[derive(Debug, Clone)]
pub struct Flags {
    /// `None` means unlimited.
    pub jobs: Option<usize>,
    pub rebuild_changed_actions: bool,
    pub failure_aborts_build: bool,
    pub remove_stale_outputs: bool,
    pub remove_failed_outputs: bool,
    pub remove_empty_directories: bool,
    pub touch_success_outputs: bool,
    pub wait_nfs_outputs: bool,
    pub nfs_outputs_timeout: u64,
    pub log_skipped_actions: bool,
    pub no_actions: bool,
    pub log_level: LogLevel,
}

impl Flags {
    pub fn resolve(store: &ParamStore) -> Result<Flags> {
        let raw_jobs = store.get_i64("jobs")?;
        let nproc = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let jobs = match raw_jobs {
            0 => None,
            n if n > 0 => Some(n as usize),
            n => Some((nproc / n.unsigned_abs() as usize).max(1)),
        };
        let log_level = store.get_str("log_level")?;
        let log_level = LogLevel::from_str(&log_level).map_err(|_| Error::InvalidParameterValue {
            name: "log_level".to_string(),
            value: log_level.clone(),
        })?;
        Ok(Flags {
            jobs,
            rebuild_changed_actions: store.get_bool("rebuild_changed_actions")?,
            failure_aborts_build: store.get_bool("failure_aborts_build")?,
            remove_stale_outputs: store.get_bool("remove_stale_outputs")?,
            remove_failed_outputs: store.get_bool("remove_failed_outputs")?,
            remove_empty_directories: store.get_bool("remove_empty_directories")?,
            touch_success_outputs: store.get_bool("touch_success_outputs")?,
            wait_nfs_outputs: store.get_bool("wait_nfs_outputs")?,
            nfs_outputs_timeout: store.get_u64("nfs_outputs_timeout")?,
            log_skipped_actions: store.get_bool("log_skipped_actions")?,
            no_actions: store.get_bool("no_actions")?,
            log_level,
        })
    }
}
