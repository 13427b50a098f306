use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::Result;
use crate::annotation::Annotated;
use crate::pattern::{Bindings, Pattern};
use crate::step_context::StepContext;

pub(crate) type StepBody =
    Rc<dyn Fn(StepContext) -> Pin<Box<dyn Future<Output = Result<()>>>>>;

/// A registered unit of build logic, built with the fluent constructor and
/// handed to [`crate::StepRegistry::register`].
///
/// ```no_run
/// # use dynamake::{Step, StepRegistry};
/// let mut registry = StepRegistry::default();
/// registry
///     .register(
///         Step::new("compile")
///             .output("obj/{*name}.o")
///             .run(|ctx| async move {
///                 let name = ctx.bind("name")?;
///                 ctx.require(format!("src/{name}.c"))?;
///                 ctx.shell([format!("cc -c src/{name}.c -o obj/{name}.o")])
///                     .run()
///                     .await
///             }),
///     )
///     .unwrap();
/// ```
pub struct Step {
    pub(crate) name: String,
    pub(crate) outputs: Vec<Annotated>,
    pub(crate) priority: i64,
    pub(crate) resources: IndexMap<String, u64>,
    pub(crate) body: Option<StepBody>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outputs: vec![],
            priority: 0,
            resources: IndexMap::new(),
            body: None,
        }
    }

    pub fn output(mut self, pattern: impl Into<Annotated>) -> Self {
        self.outputs.push(pattern.into());
        self
    }

    pub fn outputs<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Annotated>,
    {
        self.outputs.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Higher priorities win when several steps claim the same path.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Default draw against the named resource for each of this step's
    /// actions.
    pub fn resource(mut self, name: impl Into<String>, draw: u64) -> Self {
        self.resources.insert(name.into(), draw);
        self
    }

    pub fn run<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(StepContext) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.body = Some(Rc::new(move |ctx| Box::pin(body(ctx))));
        self
    }
}

/// A validated step definition as held by the registry.
pub(crate) struct StepDef {
    pub name: String,
    pub outputs: Vec<Pattern>,
    pub priority: i64,
    pub resources: IndexMap<String, u64>,
    pub body: StepBody,
}

impl StepDef {
    pub fn has_phony_output(&self) -> bool {
        self.outputs.iter().any(|p| p.is_phony())
    }
}

impl fmt::Display for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("name", &self.name)
            .field("outputs", &self.outputs)
            .field("priority", &self.priority)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

/// Identity of a step instance: the step plus the bindings extracted from
/// the path that triggered it. Two `require`s producing the same key share
/// one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub step: String,
    pub bindings: Bindings,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bindings.is_empty() {
            write!(f, "{}", self.step)
        } else {
            let bindings = self
                .bindings
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .join("&");
            write!(f, "{}/{}", self.step, bindings)
        }
    }
}
