//! Sequential execution of a plan.

use std::fmt;

use crate::{
    accounts::AccountResolver,
    actions::{ActionExecutor, ActionSummary},
    artifacts::ArtifactRegistry,
    backend::ChainBackend,
    error::DeployError,
    external::ExternalRefLoader,
    graph::{ExecutionPlan, Selection, TaskGraph},
    store::ArtifactStore,
    strategy::{DeployOutcome, DeploymentStrategy},
};

/// What a run did to one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub name: String,
    pub outcome: DeployOutcome,
    pub actions: ActionSummary,
}

/// Summary of a successful run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
}

impl RunReport {
    pub fn get(&self, unit: &str) -> Option<&UnitReport> {
        self.units.iter().find(|report| report.name == unit)
    }

    /// Units whose processing submitted deployment transactions.
    pub fn changed_units(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|report| report.outcome.changed_chain())
    }

    pub fn actions_submitted(&self) -> usize {
        self.units.iter().map(|report| report.actions.submitted).sum()
    }

    pub fn actions_skipped(&self) -> usize {
        self.units.iter().map(|report| report.actions.skipped).sum()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unit(s) processed, {} changed, {} action(s) submitted, {} skipped",
            self.units.len(),
            self.changed_units().count(),
            self.actions_submitted(),
            self.actions_skipped()
        )
    }
}

/// Drives units through the deployment strategy and their post-deploy actions.
///
/// Units run one at a time in plan order. The first failure stops the run; records written by
/// earlier units are kept, so running again resumes where it stopped.
pub struct Scheduler<'a, B, S> {
    store: &'a mut S,
    artifacts: &'a ArtifactRegistry,
    strategy: DeploymentStrategy<'a, B>,
    actions: ActionExecutor<'a, B>,
}

impl<'a, B, S> Scheduler<'a, B, S>
where
    B: ChainBackend,
    S: ArtifactStore,
{
    pub fn new(
        backend: &'a B,
        store: &'a mut S,
        artifacts: &'a ArtifactRegistry,
        accounts: &'a AccountResolver,
        external: &'a ExternalRefLoader,
    ) -> Self {
        Self {
            store,
            artifacts,
            strategy: DeploymentStrategy::new(backend, artifacts, accounts, external),
            actions: ActionExecutor::new(backend, accounts, external),
        }
    }

    /// Plan `selection` and execute it.
    pub async fn run(&mut self, graph: &TaskGraph, selection: &Selection) -> Result<RunReport, DeployError> {
        let plan = graph.plan(selection)?;
        self.execute(&plan).await
    }

    pub async fn execute(&mut self, plan: &ExecutionPlan) -> Result<RunReport, DeployError> {
        self.preflight(plan)?;

        tracing::info!(units = plan.len(), order = ?plan.names(), "Starting deployment run");

        let mut report = RunReport::default();
        for unit in plan.units() {
            tracing::info!(unit = %unit.name, strategy = %unit.strategy, "Processing unit");

            let outcome = self
                .strategy
                .apply(&mut *self.store, unit)
                .await
                .map_err(|source| {
                    tracing::error!(unit = %unit.name, stage = "deploy", error = %format!("{source:#}"), "Unit failed");
                    DeployError::DeploymentFailed {
                        unit: unit.name.clone(),
                        source,
                    }
                })?;

            let actions = self.actions.run(&*self.store, unit).await.inspect_err(|err| {
                tracing::error!(unit = %unit.name, stage = "action", error = %err, "Unit failed");
            })?;

            report.units.push(UnitReport {
                name: unit.name.clone(),
                outcome,
                actions,
            });
        }

        tracing::info!(summary = %report, "Deployment run complete");
        Ok(report)
    }

    /// Checks that need no network access: artifacts are loaded and unchecked actions are
    /// reported before anything is submitted.
    fn preflight(&self, plan: &ExecutionPlan) -> Result<(), DeployError> {
        for unit in plan.units() {
            for contract in unit.required_contracts() {
                self.artifacts
                    .get(contract)
                    .map_err(|source| DeployError::DeploymentFailed {
                        unit: unit.name.clone(),
                        source,
                    })?;
            }
        }

        for (unit, action) in plan.unchecked_actions() {
            tracing::warn!(
                unit = %unit.name,
                target = %action.target,
                method = %action.method,
                "Action has no skip_if_unchanged check and is submitted on every run"
            );
        }

        Ok(())
    }
}
