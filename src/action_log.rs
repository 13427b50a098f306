//! The persistent per-step-instance record used for change detection.
//!
//! A record file exists exactly for instances whose last execution succeeded.
//! Writes replace the previous record atomically (temp file + rename) so a
//! crash or concurrent reader never observes a half-written record; a file
//! that fails to parse is treated as "never built".

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::step::InstanceKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// The action fingerprint: the argument vector with phony segments
    /// removed.
    pub argv: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubStepRecord {
    pub step: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub sub_steps: Vec<SubStepRecord>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    /// Parameter values actually read through the store during the run.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct ActionLog {
    dir: PathBuf,
}

/// Escape a binding value for filename safety.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '+' | '@' => out.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    out
}

impl ActionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/<step>.actions.yaml` for parameterless instances,
    /// `<dir>/<step>/<k1>=<v1>&…&<kn>=<vn>.actions.yaml` otherwise, with the
    /// bindings sorted by name.
    pub fn record_path(&self, key: &InstanceKey) -> PathBuf {
        if key.bindings.is_empty() {
            self.dir.join(format!("{}.actions.yaml", key.step))
        } else {
            let encoded = key
                .bindings
                .iter()
                .map(|(k, v)| format!("{}={}", escape_value(k), escape_value(v)))
                .collect::<Vec<_>>()
                .join("&");
            self.dir
                .join(&key.step)
                .join(format!("{encoded}.actions.yaml"))
        }
    }

    /// A missing or unreadable record means "never built".
    pub fn load(&self, key: &InstanceKey) -> Option<StepRecord> {
        let path = self.record_path(key);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_yaml::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("{key}: discarding corrupt record {}: {err}", path.display());
                None
            }
        }
    }

    pub fn store(&self, key: &InstanceKey, record: &StepRecord) -> Result<()> {
        let path = self.record_path(key);
        let parent = path.parent().expect("record paths always have a parent");
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(serde_yaml::to_string(record)?.as_bytes())?;
        tmp.persist(&path)
            .wrap_err_with(|| format!("failed to persist {}", path.display()))?;
        trace!("{key}: wrote record {}", path.display());
        Ok(())
    }
}
