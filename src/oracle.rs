//! Decides whether an action must run or can be skipped as up to date.
//!
//! The rules short-circuit in order: phony outputs always run; an absent
//! record runs when record comparison is enabled; any divergence from the
//! recorded inputs/outputs/sub-steps/fingerprints/parameters runs; a missing
//! output runs; an input newer than an output runs; otherwise skip.

use std::collections::BTreeMap;

use crate::action_log::{StepRecord, SubStepRecord};
use crate::annotation::Annotated;
use crate::params::Flags;
use crate::stat_cache::StatCache;

#[derive(Debug, Clone, PartialEq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RunReason {
    PhonyOutputs,
    NeverBuilt,
    ActionCountChanged { recorded: usize },
    ActionChanged { index: usize },
    RequiredChanged { path: String },
    SubStepsChanged,
    OutputsChanged,
    ConfigChanged { name: String },
    MissingOutput { output: String },
    InputNewer { input: String, output: String },
    /// An earlier action of this pass already ran, or the step restarted.
    Forced,
}

impl RunReason {
    pub fn message(&self) -> String {
        match self {
            RunReason::PhonyOutputs => "output is phony".to_string(),
            RunReason::NeverBuilt => "no record of a previous build".to_string(),
            RunReason::ActionCountChanged { recorded } => {
                format!("more actions than the {recorded} recorded")
            }
            RunReason::ActionChanged { index } => {
                format!("action #{index} differs from the recorded one")
            }
            RunReason::RequiredChanged { path } => {
                format!("`{path}` was not required by the recorded build")
            }
            RunReason::SubStepsChanged => "sub-steps differ from the recorded ones".to_string(),
            RunReason::OutputsChanged => "outputs differ from the recorded ones".to_string(),
            RunReason::ConfigChanged { name } => {
                format!("parameter `{name}` changed since the recorded build")
            }
            RunReason::MissingOutput { output } => format!("output `{output}` is missing"),
            RunReason::InputNewer { input, output } => {
                format!("input `{input}` is newer than output `{output}`")
            }
            RunReason::Forced => "an earlier action already ran".to_string(),
        }
    }
}

/// Everything known about the step instance at the point an action is about
/// to be issued.
pub(crate) struct ActionCheck<'a> {
    pub record: Option<&'a StepRecord>,
    /// Index of this action within the step.
    pub index: usize,
    /// Fingerprint of this action (argv with phony segments removed).
    pub fingerprint: &'a [String],
    /// Paths required so far, in require order.
    pub required: &'a [Annotated],
    /// Sub-step instances invoked so far, in require order.
    pub sub_steps: &'a [SubStepRecord],
    /// Parameter values read so far.
    pub config: &'a BTreeMap<String, String>,
    /// Paths currently matched by the step's output patterns.
    pub outputs: &'a [Annotated],
}

pub(crate) fn must_run(
    flags: &Flags,
    stats: &StatCache,
    step_has_phony_output: bool,
    check: &ActionCheck,
) -> Option<RunReason> {
    if step_has_phony_output {
        return Some(RunReason::PhonyOutputs);
    }

    if flags.rebuild_changed_actions {
        let Some(record) = check.record else {
            return Some(RunReason::NeverBuilt);
        };
        if check.index >= record.actions.len() {
            return Some(RunReason::ActionCountChanged {
                recorded: record.actions.len(),
            });
        }
        if record.actions[check.index].argv != check.fingerprint {
            return Some(RunReason::ActionChanged { index: check.index });
        }
        for required in check.required {
            if !record.required.iter().any(|r| r == required.value()) {
                return Some(RunReason::RequiredChanged {
                    path: required.value().to_string(),
                });
            }
        }
        if !record.sub_steps.starts_with(check.sub_steps) {
            return Some(RunReason::SubStepsChanged);
        }
        for (name, value) in check.config {
            if record.config.get(name) != Some(value) {
                return Some(RunReason::ConfigChanged { name: name.clone() });
            }
        }
        let recorded: std::collections::BTreeSet<&str> =
            record.outputs.iter().map(|s| s.as_str()).collect();
        let resolved: std::collections::BTreeSet<&str> =
            check.outputs.iter().map(|o| o.value()).collect();
        if recorded != resolved {
            return Some(RunReason::OutputsChanged);
        }
    }

    for output in check.outputs {
        if output.is_exists_only() || output.is_optional() || output.is_phony() {
            continue;
        }
        if stats.mtime_ns(output.value()).is_none() {
            return Some(RunReason::MissingOutput {
                output: output.value().to_string(),
            });
        }
    }

    for output in check.outputs {
        if output.is_exists_only() || output.is_phony() {
            continue;
        }
        let Some(output_mtime) = stats.mtime_ns(output.value()) else {
            continue;
        };
        for input in check.required {
            if input.is_exists_only() {
                continue;
            }
            let Some(input_mtime) = stats.mtime_ns(input.value()) else {
                continue;
            };
            if input_mtime > output_mtime {
                return Some(RunReason::InputNewer {
                    input: input.value().to_string(),
                    output: output.value().to_string(),
                });
            }
        }
    }

    None
}

/// Synthetic modification time for a phony target: one nanosecond past its
/// newest input, so dependents only rebuild when a real input changed.
pub(crate) fn phony_mtime(stats: &StatCache, inputs: &[Annotated]) -> i128 {
    inputs
        .iter()
        .filter(|i| !i.is_exists_only())
        .filter_map(|i| stats.mtime_ns(i.value()))
        .max()
        .map(|m| m + 1)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::ActionRecord;
    use crate::params::ParamStore;

    fn flags() -> Flags {
        Flags::resolve(&ParamStore::new()).unwrap()
    }

    fn annotated(paths: &[&str]) -> Vec<Annotated> {
        paths.iter().map(|p| Annotated::new(*p)).collect()
    }

    fn record_with_action(argv: &[&str]) -> StepRecord {
        StepRecord {
            step: "copy".to_string(),
            parameters: BTreeMap::new(),
            required: vec!["bar".to_string()],
            outputs: vec!["foo".to_string()],
            sub_steps: vec![],
            actions: vec![ActionRecord {
                argv: argv.iter().map(|s| s.to_string()).collect(),
                start: chrono::Utc::now(),
                end: chrono::Utc::now(),
            }],
            config: BTreeMap::new(),
        }
    }

    fn write(dir: &std::path::Path, name: &str) {
        std::fs::write(dir.join(name), name).unwrap();
    }

    /// Pin mtimes explicitly so the tests never depend on filesystem
    /// timestamp granularity.
    fn set_mtime(dir: &std::path::Path, name: &str, offset_secs: u64) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.join(name))
            .unwrap();
        let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000 + offset_secs);
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn phony_always_runs() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatCache::new(dir.path());
        let config = BTreeMap::new();
        let reason = must_run(
            &flags(),
            &stats,
            true,
            &ActionCheck {
                record: None,
                index: 0,
                fingerprint: &[],
                required: &[],
                sub_steps: &[],
                config: &config,
                outputs: &[],
            },
        );
        assert_eq!(reason, Some(RunReason::PhonyOutputs));
    }

    #[test]
    fn missing_record_runs_when_comparison_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatCache::new(dir.path());
        let config = BTreeMap::new();
        let fingerprint = vec!["cp".to_string()];
        let reason = must_run(
            &flags(),
            &stats,
            false,
            &ActionCheck {
                record: None,
                index: 0,
                fingerprint: &fingerprint,
                required: &[],
                sub_steps: &[],
                config: &config,
                outputs: &[],
            },
        );
        assert_eq!(reason, Some(RunReason::NeverBuilt));
    }

    #[test]
    fn up_to_date_skips() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bar");
        write(dir.path(), "foo");
        set_mtime(dir.path(), "bar", 0);
        set_mtime(dir.path(), "foo", 1);
        let stats = StatCache::new(dir.path());
        let record = record_with_action(&["cp", "bar", "foo"]);
        let fingerprint: Vec<String> = ["cp", "bar", "foo"].iter().map(|s| s.to_string()).collect();
        let config = BTreeMap::new();
        let reason = must_run(
            &flags(),
            &stats,
            false,
            &ActionCheck {
                record: Some(&record),
                index: 0,
                fingerprint: &fingerprint,
                required: &annotated(&["bar"]),
                sub_steps: &[],
                config: &config,
                outputs: &annotated(&["foo"]),
            },
        );
        assert_eq!(reason, None);
    }

    #[test]
    fn changed_fingerprint_runs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bar");
        write(dir.path(), "foo");
        let stats = StatCache::new(dir.path());
        let record = record_with_action(&["cp", "bar", "foo"]);
        let fingerprint: Vec<String> =
            ["cp", "-v", "bar", "foo"].iter().map(|s| s.to_string()).collect();
        let config = BTreeMap::new();
        let reason = must_run(
            &flags(),
            &stats,
            false,
            &ActionCheck {
                record: Some(&record),
                index: 0,
                fingerprint: &fingerprint,
                required: &annotated(&["bar"]),
                sub_steps: &[],
                config: &config,
                outputs: &annotated(&["foo"]),
            },
        );
        assert_eq!(reason, Some(RunReason::ActionChanged { index: 0 }));
    }

    #[test]
    fn changed_parameter_runs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bar");
        write(dir.path(), "foo");
        let stats = StatCache::new(dir.path());
        let mut record = record_with_action(&["cp", "bar", "foo"]);
        record.config.insert("mode".to_string(), "release".to_string());
        let fingerprint: Vec<String> = ["cp", "bar", "foo"].iter().map(|s| s.to_string()).collect();
        let config = BTreeMap::from([("mode".to_string(), "debug".to_string())]);
        let reason = must_run(
            &flags(),
            &stats,
            false,
            &ActionCheck {
                record: Some(&record),
                index: 0,
                fingerprint: &fingerprint,
                required: &annotated(&["bar"]),
                sub_steps: &[],
                config: &config,
                outputs: &annotated(&["foo"]),
            },
        );
        assert_eq!(
            reason,
            Some(RunReason::ConfigChanged {
                name: "mode".to_string()
            })
        );
    }

    #[test]
    fn missing_output_runs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bar");
        let stats = StatCache::new(dir.path());
        let record = record_with_action(&["cp", "bar", "foo"]);
        let fingerprint: Vec<String> = ["cp", "bar", "foo"].iter().map(|s| s.to_string()).collect();
        let config = BTreeMap::new();
        let reason = must_run(
            &flags(),
            &stats,
            false,
            &ActionCheck {
                record: Some(&record),
                index: 0,
                fingerprint: &fingerprint,
                required: &annotated(&["bar"]),
                sub_steps: &[],
                config: &config,
                outputs: &annotated(&["foo"]),
            },
        );
        assert_eq!(
            reason,
            Some(RunReason::MissingOutput {
                output: "foo".to_string()
            })
        );
    }

    #[test]
    fn newer_input_runs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "foo");
        write(dir.path(), "bar");
        set_mtime(dir.path(), "foo", 0);
        set_mtime(dir.path(), "bar", 1);
        let stats = StatCache::new(dir.path());
        let record = record_with_action(&["cp", "bar", "foo"]);
        let fingerprint: Vec<String> = ["cp", "bar", "foo"].iter().map(|s| s.to_string()).collect();
        let config = BTreeMap::new();
        let reason = must_run(
            &flags(),
            &stats,
            false,
            &ActionCheck {
                record: Some(&record),
                index: 0,
                fingerprint: &fingerprint,
                required: &annotated(&["bar"]),
                sub_steps: &[],
                config: &config,
                outputs: &annotated(&["foo"]),
            },
        );
        assert_eq!(
            reason,
            Some(RunReason::InputNewer {
                input: "bar".to_string(),
                output: "foo".to_string()
            })
        );
    }

    #[test]
    fn disabled_record_comparison_falls_back_to_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bar");
        write(dir.path(), "foo");
        set_mtime(dir.path(), "bar", 0);
        set_mtime(dir.path(), "foo", 1);
        let stats = StatCache::new(dir.path());
        let mut flags = flags();
        flags.rebuild_changed_actions = false;
        let config = BTreeMap::new();
        // No record at all, but outputs exist and are newer than inputs.
        let reason = must_run(
            &flags,
            &stats,
            false,
            &ActionCheck {
                record: None,
                index: 0,
                fingerprint: &[],
                required: &annotated(&["bar"]),
                sub_steps: &[],
                config: &config,
                outputs: &annotated(&["foo"]),
            },
        );
        assert_eq!(reason, None);
    }

    #[test]
    fn phony_mtime_is_one_past_newest_input() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bar");
        let stats = StatCache::new(dir.path());
        let inputs = annotated(&["bar"]);
        let expected = stats.mtime_ns("bar").unwrap() + 1;
        assert_eq!(phony_mtime(&stats, &inputs), expected);
        assert_eq!(phony_mtime(&stats, &[]), 1);
    }
}
