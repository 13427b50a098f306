//! External action execution.
//!
//! An [`Action`] is built by [`crate::StepContext::shell`] or
//! [`crate::StepContext::spawn`] and driven by `run()`: implied sync,
//! up-to-date check, stale-output scrub, resource admission, launch with
//! line-framed output tagged by step instance, exit handling, and the
//! post-success output policies.

use std::io::ErrorKind;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use indexmap::IndexMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::Result;
use crate::action_log::ActionRecord;
use crate::annotation::Annotated;
use crate::error::Error;
use crate::oracle::{self, ActionCheck, RunReason};
use crate::stat_cache::StatCache;
use crate::step_context::{Phase, StepContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActionKind {
    Shell,
    Spawn,
}

/// One external command, with its resource draws.
pub struct Action {
    ctx: StepContext,
    kind: ActionKind,
    argv: Vec<Annotated>,
    resources: IndexMap<String, u64>,
}

impl Action {
    pub(crate) fn new<I, S>(ctx: StepContext, kind: ActionKind, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Annotated>,
    {
        Self {
            ctx,
            kind,
            argv: argv.into_iter().map(Into::into).collect(),
            resources: IndexMap::new(),
        }
    }

    /// Draw `amount` of the named resource for the duration of this action,
    /// overriding the step and registration defaults.
    pub fn resource(mut self, name: impl Into<String>, amount: u64) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    pub async fn run(self) -> Result<()> {
        let ctx = self.ctx.clone();
        ctx.sync().await?;

        let label = ctx.cell.key.to_string();
        let argv: Vec<String> = self.argv.iter().map(|a| a.value().to_string()).collect();
        let fingerprint: Vec<String> = self
            .argv
            .iter()
            .filter(|a| !a.is_phony())
            .map(|a| a.value().to_string())
            .collect();
        let display = shell_words::join(argv.iter().map(|s| s.as_str()));
        let outputs = ctx.outputs()?;
        let flags = &ctx.build.flags;

        let index = ctx.run.borrow().actions.len();
        let decision = {
            let run = ctx.run.borrow();
            match run.phase {
                Phase::Force => Some(RunReason::Forced),
                Phase::Probe => oracle::must_run(
                    flags,
                    &ctx.build.stats,
                    ctx.cell.step.has_phony_output(),
                    &ActionCheck {
                        record: run.record.as_ref(),
                        index,
                        fingerprint: &fingerprint,
                        required: &run.required,
                        sub_steps: &run.sub_steps,
                        config: &run.config,
                        outputs: &outputs,
                    },
                ),
            }
        };

        let Some(reason) = decision else {
            // Skipped: carry the recorded action forward so the new record
            // stays complete.
            {
                let mut run = ctx.run.borrow_mut();
                let recorded = run
                    .record
                    .as_ref()
                    .and_then(|r| r.actions.get(index))
                    .cloned();
                run.actions.push(recorded.unwrap_or_else(|| ActionRecord {
                    argv: fingerprint.clone(),
                    start: Utc::now(),
                    end: Utc::now(),
                }));
                run.skipped += 1;
            }
            ctx.build.report.borrow_mut().actions_skipped += 1;
            if flags.log_skipped_actions {
                info!("{label}: skipped `{display}` (up to date)");
            } else {
                debug!(target: "dynamake::why", "{label}: skipped `{display}` (up to date)");
            }
            return Ok(());
        };

        debug!(target: "dynamake::why", "{label}: `{display}` must run: {}", reason.message());

        if flags.no_actions {
            info!("{label}: would run `{display}`");
            return Err(Error::DryRunStop.into());
        }

        if ctx.run.borrow().skipped > 0 {
            // Earlier actions were skipped as up to date, so their effects
            // may be stale; restart the step and run everything.
            return Err(Error::Restart.into());
        }

        ctx.run.borrow_mut().phase = Phase::Force;

        let scrub = {
            let mut run = ctx.run.borrow_mut();
            let first = !run.scrubbed;
            run.scrubbed = true;
            first
        };
        if scrub && flags.remove_stale_outputs {
            scrub_outputs(
                &ctx.build.stats,
                &outputs,
                flags.remove_empty_directories,
                "stale",
            )?;
        }

        if ctx.build.failed.is_cancelled() {
            return Err(Error::Aborted.into());
        }
        let draws = ctx
            .build
            .resources
            .draws(&ctx.cell.step.resources, &self.resources);
        let admission = ctx.build.resources.admit(&draws, &ctx.build.failed).await?;
        if ctx.build.failed.is_cancelled() {
            return Err(Error::Aborted.into());
        }

        let start = Utc::now();
        info!("{label}: $ {display}");
        let status = execute(&label, self.kind, &argv, ctx.build.stats.root()).await?;
        let end = Utc::now();
        drop(admission);

        ctx.build
            .stats
            .invalidate_all(outputs.iter().map(|o| o.value()));

        if !status.success() {
            if flags.remove_failed_outputs {
                scrub_outputs(
                    &ctx.build.stats,
                    &outputs,
                    flags.remove_empty_directories,
                    "failed",
                )?;
            }
            return Err(Error::ActionFailed {
                step: label,
                cmd: display,
                status: render_status(status),
            }
            .into());
        }

        if flags.wait_nfs_outputs {
            if let Some(output) =
                wait_outputs(&ctx.build.stats, &outputs, flags.nfs_outputs_timeout).await
            {
                return Err(Error::MissingOutput {
                    step: label,
                    output,
                }
                .into());
            }
        }

        {
            let mut run = ctx.run.borrow_mut();
            run.actions.push(ActionRecord {
                argv: fingerprint,
                start,
                end,
            });
            run.ran += 1;
        }
        ctx.build.report.borrow_mut().actions_run += 1;
        Ok(())
    }
}

fn render_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "no exit status".to_string(),
    }
}

async fn execute(
    label: &str,
    kind: ActionKind,
    argv: &[String],
    cwd: &Path,
) -> Result<ExitStatus> {
    let mut cmd = match kind {
        ActionKind::Shell => {
            let mut cmd = Command::new("sh");
            cmd.arg("-o").arg("errexit").arg("-c").arg(argv.join(" "));
            cmd
        }
        ActionKind::Spawn => {
            let Some((program, rest)) = argv.split_first() else {
                eyre::bail!("{label}: empty command");
            };
            let mut cmd = Command::new(program);
            cmd.args(rest);
            cmd
        }
    };
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    trace!("{label}: started pid {:?}", child.id());
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let pump_stdout = async {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "dynamake::stdout", "{label}: {line}");
            }
        }
    };
    let pump_stderr = async {
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "dynamake::stderr", "{label}: {line}");
            }
        }
    };
    let (status, (), ()) = tokio::join!(child.wait(), pump_stdout, pump_stderr);
    Ok(status?)
}

fn scrub_outputs(
    stats: &StatCache,
    outputs: &[Annotated],
    remove_empty_directories: bool,
    why: &str,
) -> Result<()> {
    for output in outputs {
        if output.is_precious() || output.is_phony() {
            continue;
        }
        remove_path(stats, output.value(), remove_empty_directories, why)?;
    }
    Ok(())
}

pub(crate) fn remove_path(
    stats: &StatCache,
    path: &str,
    remove_empty_directories: bool,
    why: &str,
) -> Result<()> {
    let abs = stats.abs(path);
    match std::fs::remove_file(&abs) {
        Ok(()) => debug!(target: "dynamake::file", "removed {why} output `{path}`"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    stats.invalidate(path);
    if remove_empty_directories {
        let mut dir = abs.parent();
        while let Some(current) = dir {
            if current == stats.root() {
                break;
            }
            if std::fs::remove_dir(current).is_err() {
                break;
            }
            debug!(target: "dynamake::file", "removed empty directory `{}`", current.display());
            dir = current.parent();
        }
    }
    Ok(())
}

pub(crate) fn touch(stats: &StatCache, path: &str, mtime_ns: i128) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(stats.abs(path))?;
    let mtime = UNIX_EPOCH + Duration::from_nanos(mtime_ns.max(0) as u64);
    file.set_modified(mtime)?;
    debug!(target: "dynamake::file", "touched `{path}`");
    stats.invalidate(path);
    Ok(())
}

pub(crate) fn now_ns() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0)
}

async fn wait_outputs(
    stats: &StatCache,
    outputs: &[Annotated],
    timeout_secs: u64,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    for output in outputs {
        if output.is_optional() || output.is_phony() {
            continue;
        }
        loop {
            stats.invalidate(output.value());
            if stats.exists(output.value()) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Some(output.value().to_string());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    None
}
