use std::rc::Rc;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::Result;
use crate::error::Error;
use crate::pattern::{Bindings, Pattern};
use crate::step::{Step, StepDef};

/// Index of registered steps, keyed by their output patterns.
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: IndexMap<String, Rc<StepDef>>,
}

impl StepRegistry {
    pub fn register(&mut self, step: Step) -> Result<()> {
        let Step {
            name,
            outputs,
            priority,
            resources,
            body,
        } = step;
        if self.steps.contains_key(&name) {
            eyre::bail!("step `{name}` is already registered");
        }
        if outputs.is_empty() {
            eyre::bail!("step `{name}` declares no output patterns");
        }
        let Some(body) = body else {
            eyre::bail!("step `{name}` has no body");
        };

        let outputs: Vec<Pattern> = outputs
            .into_iter()
            .map(Pattern::parse)
            .collect::<Result<_>>()?;

        // Every output pattern of one step must capture the same names.
        let captures = outputs[0].capture_names().into_iter().sorted().collect_vec();
        for pattern in &outputs[1..] {
            let other = pattern.capture_names().into_iter().sorted().collect_vec();
            if other != captures {
                return Err(Error::CaptureSetMismatch {
                    step: name,
                    first: captures.join(","),
                    second: other.join(","),
                }
                .into());
            }
        }

        self.steps.insert(
            name.clone(),
            Rc::new(StepDef {
                name,
                outputs,
                priority,
                resources,
                body,
            }),
        );
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Rc<StepDef>> {
        self.steps.get(name).cloned()
    }

    /// Resolve a required path to the step that produces it.
    ///
    /// All steps with a matching output pattern are restricted to the highest
    /// priority tier; more than one survivor is a configuration error, none
    /// means the path must be a source file. Within the chosen step,
    /// ambiguous matches prefer the pattern with more literal characters
    /// before its first capture, then declaration order.
    pub(crate) fn resolve(&self, path: &str) -> Result<Option<(Rc<StepDef>, Bindings)>> {
        let env = Bindings::new();
        let mut candidates: Vec<(Rc<StepDef>, Bindings, usize)> = vec![];
        for step in self.steps.values() {
            let mut best: Option<(Bindings, usize)> = None;
            for pattern in &step.outputs {
                if let Some(bindings) = pattern.matches(path, &env)? {
                    let specificity = pattern.specificity();
                    if best.as_ref().is_none_or(|(_, s)| specificity > *s) {
                        best = Some((bindings, specificity));
                    }
                }
            }
            if let Some((bindings, specificity)) = best {
                candidates.push((step.clone(), bindings, specificity));
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }
        let top = candidates.iter().map(|(s, _, _)| s.priority).max().unwrap();
        candidates.retain(|(s, _, _)| s.priority == top);
        if candidates.len() > 1 {
            return Err(Error::AmbiguousRule {
                path: path.to_string(),
                steps: candidates
                    .iter()
                    .map(|(s, _, _)| s.name.clone())
                    .collect(),
                priority: top,
            }
            .into());
        }
        let (step, bindings, _) = candidates.remove(0);
        Ok(Some((step, bindings)))
    }
}
