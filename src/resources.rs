use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::error::Error;
use crate::params::{Flags, ParamStore};

/// Named consumable budgets for external actions.
///
/// Admission is FIFO per resource (the semaphores are fair); draws against
/// several resources are acquired in registration order so concurrent
/// admissions cannot deadlock each other.
pub(crate) struct ResourcePool {
    budgets: IndexMap<String, u64>,
    default_draws: IndexMap<String, u64>,
    semaphores: IndexMap<String, Arc<Semaphore>>,
    jobs: Option<Arc<Semaphore>>,
}

#[derive(Debug)]
pub(crate) struct Admission {
    _permits: Vec<OwnedSemaphorePermit>,
}

impl ResourcePool {
    pub fn new(flags: &Flags, store: &ParamStore) -> Result<Self> {
        let mut budgets = IndexMap::new();
        let mut default_draws = IndexMap::new();
        let mut semaphores = IndexMap::new();
        for (name, default_draw) in store.resource_defaults() {
            let budget = store.get_u64(name)?;
            if *default_draw > budget {
                return Err(Error::ResourceOverBudget {
                    name: name.clone(),
                    draw: *default_draw,
                    budget,
                }
                .into());
            }
            budgets.insert(name.clone(), budget);
            default_draws.insert(name.clone(), *default_draw);
            let permits = budget.min(Semaphore::MAX_PERMITS as u64) as usize;
            semaphores.insert(name.clone(), Arc::new(Semaphore::new(permits)));
        }
        let jobs = flags
            .jobs
            .map(|n| Arc::new(Semaphore::new(n.min(Semaphore::MAX_PERMITS))));
        Ok(Self {
            budgets,
            default_draws,
            semaphores,
            jobs,
        })
    }

    /// Per-action draws: the registered defaults overlaid with the step's
    /// defaults and the action's own overrides.
    pub fn draws(
        &self,
        step_defaults: &IndexMap<String, u64>,
        action_overrides: &IndexMap<String, u64>,
    ) -> IndexMap<String, u64> {
        let mut draws = self.default_draws.clone();
        for (name, draw) in step_defaults.iter().chain(action_overrides) {
            draws.insert(name.clone(), *draw);
        }
        draws
    }

    /// Reserve every named draw, waiting while the running totals would
    /// exceed a budget. Cancels cleanly when the build aborts.
    pub async fn admit(
        &self,
        draws: &IndexMap<String, u64>,
        aborted: &CancellationToken,
    ) -> Result<Admission> {
        let mut permits = vec![];
        for (name, semaphore) in &self.semaphores {
            let draw = draws.get(name).copied().unwrap_or(0);
            if draw == 0 {
                continue;
            }
            let budget = self.budgets[name];
            if draw > budget {
                return Err(Error::ResourceOverBudget {
                    name: name.clone(),
                    draw,
                    budget,
                }
                .into());
            }
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_many_owned(draw as u32) => permit,
                _ = aborted.cancelled() => return Err(Error::Aborted.into()),
            };
            permits.push(permit.expect("resource semaphore is never closed"));
        }
        if let Some(jobs) = &self.jobs {
            let permit = tokio::select! {
                permit = jobs.clone().acquire_owned() => permit,
                _ = aborted.cancelled() => return Err(Error::Aborted.into()),
            };
            permits.push(permit.expect("jobs semaphore is never closed"));
        }
        Ok(Admission { _permits: permits })
    }
}
