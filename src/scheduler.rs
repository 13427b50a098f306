//! The step executor: a single OS thread drives every step coroutine
//! cooperatively on a `LocalSet`, so engine state is plain `Rc`/`RefCell`
//! and only external commands run in parallel.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::action_log::{ActionLog, StepRecord};
use crate::annotation::Annotated;
use crate::env;
use crate::error::Error;
use crate::oracle;
use crate::params::{Flags, ParamStore};
use crate::pattern::Bindings;
use crate::registry::StepRegistry;
use crate::resources::ResourcePool;
use crate::runner;
use crate::stat_cache::StatCache;
use crate::step::{InstanceKey, StepDef};
use crate::step_context::{Phase, RequireTarget, RunState, StepContext};

#[derive(Debug, Clone, PartialEq, strum::EnumIs)]
pub(crate) enum InstanceStatus {
    Pending,
    Running,
    Completed,
    /// Dry run stopped the step at its first pending action.
    Stopped,
    Failed(String),
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Stopped | InstanceStatus::Failed(_)
        )
    }
}

/// One step instance: created on first require, memoized for the rest of
/// the build.
pub(crate) struct InstanceCell {
    pub key: InstanceKey,
    pub step: Rc<StepDef>,
    status: watch::Sender<InstanceStatus>,
}

impl InstanceCell {
    fn new(key: InstanceKey, step: Rc<StepDef>) -> Self {
        let (status, _) = watch::channel(InstanceStatus::Pending);
        Self { key, step, status }
    }

    pub fn set_status(&self, status: InstanceStatus) {
        self.status.send_replace(status);
    }

    pub async fn wait_terminal(&self) -> InstanceStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => status.clone(),
            Err(_) => InstanceStatus::Failed("scheduler shut down".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub actions_run: usize,
    pub actions_skipped: usize,
    /// Actions a dry run would have executed.
    pub would_run: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
}

pub(crate) struct BuildContext {
    pub registry: StepRegistry,
    pub params: ParamStore,
    pub flags: Flags,
    pub stats: StatCache,
    pub resources: ResourcePool,
    pub log: ActionLog,
    /// Latched on the first failure (or any configuration error); no new
    /// actions start once set, but running ones are left to finish.
    pub failed: CancellationToken,
    instances: RefCell<HashMap<InstanceKey, Rc<InstanceCell>>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    /// Who each instance is currently blocked on in `sync`, for cycle
    /// detection.
    waiting: RefCell<HashMap<InstanceKey, InstanceKey>>,
    pub report: RefCell<BuildReport>,
    first_error: RefCell<Option<String>>,
}

impl BuildContext {
    /// Resolve a required path: the step instance that produces it, a source
    /// file, or nothing.
    pub fn resolve_instance(self: &Rc<Self>, path: &str) -> Result<RequireTarget> {
        let Some((step, bindings)) = self.registry.resolve(path)? else {
            if self.stats.exists(path) {
                trace!("`{path}` is a source file");
                return Ok(RequireTarget::Source);
            }
            return Ok(RequireTarget::Missing);
        };
        let key = InstanceKey {
            step: step.name.clone(),
            bindings,
        };
        if let Some(cell) = self.instances.borrow().get(&key) {
            return Ok(RequireTarget::Instance(cell.clone()));
        }
        let cell = Rc::new(InstanceCell::new(key.clone(), step));
        self.instances.borrow_mut().insert(key, cell.clone());
        let build = self.clone();
        let spawned = cell.clone();
        let handle = tokio::task::spawn_local(async move {
            build.execute_instance(spawned).await;
        });
        self.tasks.borrow_mut().push(handle);
        Ok(RequireTarget::Instance(cell))
    }

    /// Wait for `target` to reach a terminal state, failing fast on a
    /// `require` cycle.
    pub async fn await_instance(
        &self,
        waiter: Option<&InstanceKey>,
        target: &InstanceCell,
    ) -> Result<InstanceStatus> {
        if let Some(waiter) = waiter {
            let mut chain = target.key.clone();
            loop {
                if chain == *waiter {
                    return Err(Error::CyclicRequire(target.key.to_string()).into());
                }
                let next = self.waiting.borrow().get(&chain).cloned();
                match next {
                    Some(next) => chain = next,
                    None => break,
                }
            }
            self.waiting
                .borrow_mut()
                .insert(waiter.clone(), target.key.clone());
        }
        let status = target.wait_terminal().await;
        if let Some(waiter) = waiter {
            self.waiting.borrow_mut().remove(waiter);
        }
        Ok(status)
    }

    /// The paths currently matched by each output pattern, with the
    /// instance's bindings substituted: literal paths directly, dynamic
    /// patterns by globbing.
    pub fn resolve_outputs(&self, step: &StepDef, bindings: &Bindings) -> Result<Vec<Annotated>> {
        let mut outputs = vec![];
        for pattern in &step.outputs {
            let resolved = pattern.interpolate(bindings)?;
            if resolved.is_dynamic() {
                for (path, _) in resolved.glob(self.stats.root(), &Bindings::new())? {
                    outputs.push(path);
                }
            } else {
                outputs.push(resolved.format(&Bindings::new())?);
            }
        }
        Ok(outputs)
    }

    async fn execute_instance(self: Rc<Self>, cell: Rc<InstanceCell>) {
        cell.set_status(InstanceStatus::Running);
        debug!("{}: starting", cell.key);
        let mut phase = Phase::Probe;
        let (result, run) = loop {
            let record = self.log.load(&cell.key);
            let run = Rc::new(RefCell::new(RunState::new(record, phase)));
            let ctx = StepContext::new(self.clone(), cell.clone(), run.clone());
            let result = (cell.step.body.clone())(ctx).await;
            let restart = phase == Phase::Probe
                && matches!(
                    result.as_ref().err().and_then(|e| e.downcast_ref::<Error>()),
                    Some(Error::Restart)
                );
            if restart {
                debug!("{}: restarting from the beginning", cell.key);
                let skipped = run.borrow().skipped;
                self.report.borrow_mut().actions_skipped -= skipped;
                phase = Phase::Force;
                continue;
            }
            break (result, run);
        };
        match result {
            Ok(()) => {
                let run = run.borrow();
                match self.finish_instance(&cell, &run) {
                    Ok(()) => {
                        self.report.borrow_mut().steps_completed += 1;
                        debug!("{}: done", cell.key);
                        cell.set_status(InstanceStatus::Completed);
                    }
                    Err(err) => self.fail_instance(&cell, err),
                }
            }
            Err(err)
                if matches!(err.downcast_ref::<Error>(), Some(Error::DryRunStop)) =>
            {
                self.report.borrow_mut().would_run += 1;
                cell.set_status(InstanceStatus::Stopped);
            }
            Err(err) => self.fail_instance(&cell, err),
        }
    }

    /// Post-body bookkeeping for a successful step: enforce output presence,
    /// apply the touch policy, assign phony synthetic times, and replace the
    /// persistent record.
    fn finish_instance(&self, cell: &InstanceCell, run: &RunState) -> Result<()> {
        let outputs = self.resolve_outputs(&cell.step, &cell.key.bindings)?;
        for output in &outputs {
            if output.is_phony() || output.is_optional() {
                continue;
            }
            if !self.stats.exists(output.value()) {
                return Err(Error::MissingOutput {
                    step: cell.key.to_string(),
                    output: output.value().to_string(),
                }
                .into());
            }
        }

        if self.flags.touch_success_outputs && run.ran > 0 {
            let target = oracle::phony_mtime(&self.stats, &run.required).max(runner::now_ns());
            for output in &outputs {
                if output.is_phony() || output.is_exists_only() {
                    continue;
                }
                runner::touch(&self.stats, output.value(), target)?;
            }
        }

        for output in &outputs {
            if output.is_phony() {
                let mtime = oracle::phony_mtime(&self.stats, &run.required);
                self.stats.set_synthetic(output.value(), mtime);
            }
        }

        let record = StepRecord {
            step: cell.step.name.clone(),
            parameters: cell.key.bindings.clone(),
            required: run.required.iter().map(|r| r.value().to_string()).collect(),
            outputs: outputs.iter().map(|o| o.value().to_string()).collect(),
            sub_steps: run.sub_steps.clone(),
            actions: run.actions.clone(),
            config: run.config.clone(),
        };
        self.log.store(&cell.key, &record)?;
        Ok(())
    }

    fn fail_instance(&self, cell: &InstanceCell, err: eyre::Report) {
        let aborted = matches!(err.downcast_ref::<Error>(), Some(Error::Aborted));
        let configuration = err
            .downcast_ref::<Error>()
            .is_some_and(|e| e.is_configuration());
        let msg = format!("{err:#}");
        if aborted {
            debug!("{}: aborted", cell.key);
        } else {
            error!("{}: {msg}", cell.key);
            self.first_error
                .borrow_mut()
                .get_or_insert_with(|| msg.clone());
        }
        self.report.borrow_mut().steps_failed += 1;
        if self.flags.failure_aborts_build || configuration {
            self.failed.cancel();
        }
        cell.set_status(InstanceStatus::Failed(msg));
    }
}

/// One engine invocation: a registry, a parameter store, and a working
/// directory to build in.
pub struct Build {
    registry: StepRegistry,
    params: ParamStore,
    root: PathBuf,
}

impl Build {
    pub fn new(registry: StepRegistry, params: ParamStore) -> Result<Self> {
        Ok(Self {
            registry,
            params,
            root: std::env::current_dir()?,
        })
    }

    /// Resolve paths, run commands, and keep state relative to `root`
    /// instead of the process working directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Require every target and drive the build to completion.
    pub fn run<I, S>(&self, targets: I) -> Result<BuildReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<Annotated>,
    {
        let flags = Flags::resolve(&self.params)?;
        let resources = ResourcePool::new(&flags, &self.params)?;
        let state_dir = self.root.join(&*env::DYNAMAKE_PERSISTENT_DIR);
        let ctx = Rc::new(BuildContext {
            registry: self.registry.clone(),
            params: self.params.clone(),
            flags,
            stats: StatCache::new(&self.root),
            resources,
            log: ActionLog::new(state_dir),
            failed: CancellationToken::new(),
            instances: RefCell::new(HashMap::new()),
            tasks: RefCell::new(vec![]),
            waiting: RefCell::new(HashMap::new()),
            report: RefCell::new(BuildReport::default()),
            first_error: RefCell::new(None),
        });
        let targets: Vec<Annotated> = targets.into_iter().map(Into::into).collect();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = tokio::task::LocalSet::new();
        let outcome: Result<()> = local.block_on(&rt, async {
            let mut waits = vec![];
            let mut failure: Option<eyre::Report> = None;
            for target in &targets {
                match ctx.resolve_instance(target.value()) {
                    Ok(resolved) => waits.push((target.clone(), resolved)),
                    Err(err) => {
                        ctx.failed.cancel();
                        failure.get_or_insert(err);
                        break;
                    }
                }
            }
            for (path, target) in waits {
                match target {
                    RequireTarget::Source => {}
                    RequireTarget::Missing => {
                        if !path.is_optional() {
                            failure.get_or_insert_with(|| {
                                Error::NoRule(path.value().to_string()).into()
                            });
                        }
                    }
                    RequireTarget::Instance(cell) => {
                        let status = ctx.await_instance(None, &cell).await?;
                        if status.is_failed() && !path.is_optional() {
                            failure.get_or_insert_with(|| {
                                eyre::eyre!("target `{}` failed", path.value())
                            });
                        }
                    }
                }
            }
            // Drain: every spawned instance reaches a terminal state before
            // the scheduler exits.
            loop {
                let handle = ctx.tasks.borrow_mut().pop();
                match handle {
                    Some(handle) => {
                        let _ = handle.await;
                    }
                    None => break,
                }
            }
            match failure {
                Some(err) => Err(err),
                None => Ok(()),
            }
        });

        let report = ctx.report.borrow().clone();
        let first_error = ctx.first_error.borrow().clone();
        match outcome {
            Ok(()) => {
                // A failed independent branch still fails the build, even
                // when every requested target was produced.
                if let Some(msg) = first_error {
                    eyre::bail!("{msg}");
                }
                info!(
                    "done: {} action{} run, {} skipped",
                    report.actions_run,
                    if report.actions_run == 1 { "" } else { "s" },
                    report.actions_skipped,
                );
                Ok(report)
            }
            Err(err) => match first_error {
                Some(msg) => Err(eyre::eyre!("{msg}")),
                None => Err(err),
            },
        }
    }
}
