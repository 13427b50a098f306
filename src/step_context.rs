//! The handle a step body uses to talk to the engine.
//!
//! `require` never blocks; it resolves the path to a producing step (or a
//! source file) and queues it. `sync` is the barrier that waits for every
//! queued requirement, and every `shell`/`spawn` implies one. Foreign
//! futures must be funneled through `done` so the engine sees exactly one
//! suspension point.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;

use crate::Result;
use crate::action_log::{ActionRecord, StepRecord, SubStepRecord};
use crate::annotation::Annotated;
use crate::error::Error;
use crate::pattern::{Bindings, Pattern};
use crate::runner::{Action, ActionKind};
use crate::scheduler::{BuildContext, InstanceCell, InstanceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Actions may be skipped as up to date.
    Probe,
    /// Every action runs unconditionally (restart pass, or an earlier action
    /// of this pass already ran).
    Force,
}

pub(crate) enum RequireTarget {
    /// No producing step; the path exists on disk.
    Source,
    /// No producing step and the path does not exist.
    Missing,
    Instance(Rc<InstanceCell>),
}

pub(crate) struct PendingRequire {
    pub path: Annotated,
    pub target: RequireTarget,
}

/// Mutable state of one pass over a step body.
pub(crate) struct RunState {
    pub phase: Phase,
    pub record: Option<StepRecord>,
    /// Every path required so far, in require order.
    pub required: Vec<Annotated>,
    /// Requirements not yet waited on by a `sync`.
    pub pending: Vec<PendingRequire>,
    pub sub_steps: Vec<SubStepRecord>,
    pub actions: Vec<ActionRecord>,
    pub config: BTreeMap<String, String>,
    /// Actions skipped during this pass.
    pub skipped: usize,
    /// Actions executed during this pass.
    pub ran: usize,
    /// Stale outputs have been scrubbed already.
    pub scrubbed: bool,
}

impl RunState {
    pub fn new(record: Option<StepRecord>, phase: Phase) -> Self {
        Self {
            phase,
            record,
            required: vec![],
            pending: vec![],
            sub_steps: vec![],
            actions: vec![],
            config: BTreeMap::new(),
            skipped: 0,
            ran: 0,
            scrubbed: false,
        }
    }
}

/// Opaque handle passed to a step body; everything the body does goes
/// through it.
#[derive(Clone)]
pub struct StepContext {
    pub(crate) build: Rc<BuildContext>,
    pub(crate) cell: Rc<InstanceCell>,
    pub(crate) run: Rc<RefCell<RunState>>,
}

impl StepContext {
    pub(crate) fn new(
        build: Rc<BuildContext>,
        cell: Rc<InstanceCell>,
        run: Rc<RefCell<RunState>>,
    ) -> Self {
        Self { build, cell, run }
    }

    /// The step name.
    pub fn name(&self) -> &str {
        &self.cell.step.name
    }

    /// The bindings extracted from the path that triggered this instance.
    pub fn bindings(&self) -> Bindings {
        self.cell.key.bindings.clone()
    }

    /// One binding by name.
    pub fn bind(&self, name: &str) -> Result<String> {
        self.cell
            .key
            .bindings
            .get(name)
            .cloned()
            .ok_or_else(|| eyre::eyre!("step `{}` has no binding `{name}`", self.cell.key))
    }

    /// Queue a dependency. Resolution happens now, execution is concurrent,
    /// and the caller only observes completion at the next `sync`.
    pub fn require(&self, path: impl Into<Annotated>) -> Result<()> {
        let path = path.into();
        if path.value().is_empty() {
            eyre::bail!("{}: required an empty path", self.cell.key);
        }
        let target = self.build.resolve_instance(path.value())?;
        let mut run = self.run.borrow_mut();
        if let RequireTarget::Instance(cell) = &target {
            run.sub_steps.push(SubStepRecord {
                step: cell.step.name.clone(),
                parameters: cell.key.bindings.clone(),
            });
        }
        run.required.push(path.clone());
        run.pending.push(PendingRequire { path, target });
        Ok(())
    }

    pub fn require_all<I, S>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Annotated>,
    {
        for path in paths {
            self.require(path)?;
        }
        Ok(())
    }

    /// Barrier: wait for every queued requirement to reach a terminal state.
    /// A failed non-optional prerequisite fails this step too.
    pub async fn sync(&self) -> Result<()> {
        let pending: Vec<PendingRequire> = self.run.borrow_mut().pending.drain(..).collect();
        let mut failed: Option<eyre::Report> = None;
        for requirement in pending {
            match requirement.target {
                RequireTarget::Source => {}
                RequireTarget::Missing => {
                    if !requirement.path.is_optional() && failed.is_none() {
                        failed = Some(
                            Error::NoRule(requirement.path.value().to_string()).into(),
                        );
                    }
                }
                RequireTarget::Instance(cell) => {
                    let status = self
                        .build
                        .await_instance(Some(&self.cell.key), &cell)
                        .await?;
                    if matches!(status, InstanceStatus::Failed(_))
                        && !requirement.path.is_optional()
                        && failed.is_none()
                    {
                        failed = Some(
                            Error::DependencyFailed {
                                step: self.cell.key.to_string(),
                                dep: requirement.path.value().to_string(),
                            }
                            .into(),
                        );
                    }
                }
            }
        }
        match failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// An external command run through `sh`; the arguments are joined into
    /// one command line. Implies a `sync`.
    pub fn shell<I, S>(&self, argv: I) -> Action
    where
        I: IntoIterator<Item = S>,
        S: Into<Annotated>,
    {
        Action::new(self.clone(), ActionKind::Shell, argv)
    }

    /// An external command executed directly from its argument vector.
    /// Implies a `sync`.
    pub fn spawn<I, S>(&self, argv: I) -> Action
    where
        I: IntoIterator<Item = S>,
        S: Into<Annotated>,
    {
        Action::new(self.clone(), ActionKind::Spawn, argv)
    }

    /// Wrap a foreign future so the engine treats it as a single opaque
    /// suspension of this step.
    pub async fn done<F: Future>(&self, future: F) -> F::Output {
        future.await
    }

    /// Read a parameter. The resolved value becomes part of this step's
    /// record, so a later change triggers a rebuild.
    pub fn param(&self, name: &str) -> Result<serde_yaml::Value> {
        let value = self.build.params.value(name)?;
        let rendered = self.build.params.value_str(name)?;
        self.run.borrow_mut().config.insert(name.to_string(), rendered);
        Ok(value)
    }

    pub fn param_str(&self, name: &str) -> Result<String> {
        let value = self.build.params.value_str(name)?;
        self.run
            .borrow_mut()
            .config
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// The i-th required path, in require order.
    pub fn input(&self, index: usize) -> Result<Annotated> {
        let run = self.run.borrow();
        run.required.get(index).cloned().ok_or_else(|| {
            eyre::eyre!(
                "{}: input #{index} out of range ({} required)",
                self.cell.key,
                run.required.len()
            )
        })
    }

    pub fn inputs(&self) -> Vec<Annotated> {
        self.run.borrow().required.clone()
    }

    /// The paths currently matched by this step's output patterns.
    pub fn outputs(&self) -> Result<Vec<Annotated>> {
        self.build
            .resolve_outputs(&self.cell.step, &self.cell.key.bindings)
    }

    /// The path of the i-th declared output pattern. Dynamic patterns have
    /// no single path; use [`StepContext::outputs`] for those.
    pub fn output(&self, index: usize) -> Result<Annotated> {
        let pattern = self.cell.step.outputs.get(index).ok_or_else(|| {
            eyre::eyre!(
                "{}: output #{index} out of range ({} declared)",
                self.cell.key,
                self.cell.step.outputs.len()
            )
        })?;
        let resolved = pattern.interpolate(&self.cell.key.bindings)?;
        if resolved.is_dynamic() {
            eyre::bail!(
                "{}: output #{index} (`{pattern}`) is dynamic and has no single path",
                self.cell.key
            );
        }
        resolved.format(&Bindings::new())
    }

    /// Expand a pattern against the filesystem, ordered by path.
    pub fn glob(&self, pattern: impl Into<Annotated>) -> Result<Vec<(Annotated, Bindings)>> {
        let pattern = Pattern::parse(pattern)?;
        pattern.glob(self.build.stats.root(), &self.cell.key.bindings)
    }

    /// Glob `pattern` and render `template` once per match.
    pub fn extract(
        &self,
        pattern: impl Into<Annotated>,
        template: impl Into<Annotated>,
    ) -> Result<Vec<Annotated>> {
        let pattern = Pattern::parse(pattern)?;
        let template = Pattern::parse(template)?;
        pattern.extract(
            self.build.stats.root(),
            &template,
            &self.cell.key.bindings,
        )
    }
}
