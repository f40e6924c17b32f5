//! Post-deploy configuration calls.

use std::collections::HashSet;

use alloy_core::dyn_abi::Specifier;
use anyhow::{Context, Result};

use crate::{
    accounts::AccountResolver,
    args::{ArgResolver, select_function},
    backend::ChainBackend,
    error::DeployError,
    external::ExternalRefLoader,
    store::ArtifactStore,
    unit::{Action, SkipCheck, Unit},
};

/// What running the actions of one unit did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub submitted: usize,
    pub skipped: usize,
}

/// Runs the post-deploy actions of units, never applying the same action twice in one run.
pub struct ActionExecutor<'a, B> {
    backend: &'a B,
    accounts: &'a AccountResolver,
    external: &'a ExternalRefLoader,
    applied: HashSet<(String, usize)>,
}

impl<'a, B: ChainBackend> ActionExecutor<'a, B> {
    pub fn new(backend: &'a B, accounts: &'a AccountResolver, external: &'a ExternalRefLoader) -> Self {
        Self {
            backend,
            accounts,
            external,
            applied: HashSet::new(),
        }
    }

    /// Run every action of `unit` in declaration order, stopping at the first failure.
    pub async fn run<S: ArtifactStore>(&mut self, store: &S, unit: &Unit) -> Result<ActionSummary, DeployError> {
        let mut summary = ActionSummary::default();

        for (index, action) in unit.post_actions.iter().enumerate() {
            if !self.applied.insert((unit.name.clone(), index)) {
                tracing::debug!(unit = %unit.name, index, "Action already applied in this run");
                continue;
            }

            let submitted = self
                .apply(store, action)
                .await
                .map_err(|source| DeployError::ActionFailed {
                    unit: unit.name.clone(),
                    index,
                    method: action.method.clone(),
                    source,
                })?;

            if submitted {
                summary.submitted += 1;
            } else {
                summary.skipped += 1;
            }
        }

        Ok(summary)
    }

    /// Returns whether a transaction was submitted.
    async fn apply<S: ArtifactStore>(&self, store: &S, action: &Action) -> Result<bool> {
        let resolver = ArgResolver::new(self.backend, store, self.accounts, self.external);
        let target = resolver.record(&action.target)?;
        let signer = self.accounts.resolve(&action.signer)?;

        if let Some(check) = &action.skip_if_unchanged {
            if self.already_applied(&resolver, check, action).await? {
                tracing::info!(
                    target = %action.target,
                    method = %action.method,
                    check = %check.method,
                    "Target already in the desired state, skipping action"
                );
                return Ok(false);
            }
        }

        let calldata = resolver
            .encode_call(&target.abi, &action.method, &action.args)
            .await
            .with_context(|| format!("Failed to prepare `{}.{}`", action.target, action.method))?;

        let receipt = self
            .backend
            .send_call(target.caller_address(), calldata, signer.address)
            .await
            .with_context(|| format!("`{}.{}` failed", action.target, action.method))?;

        tracing::info!(
            target = %action.target,
            method = %action.method,
            signer = %signer.role,
            tx_hash = %receipt.transaction_hash,
            "Action submitted"
        );
        Ok(true)
    }

    async fn already_applied<S: ArtifactStore>(
        &self,
        resolver: &ArgResolver<'_, B, S>,
        check: &SkipCheck,
        action: &Action,
    ) -> Result<bool> {
        let target = resolver.record(&action.target)?;
        let getter = select_function(&target.abi, &check.method, check.args.len())?;
        let output = getter
            .outputs
            .first()
            .with_context(|| format!("`{}` returns nothing to compare", check.method))?
            .resolve()?;

        let values = resolver.resolve_values(&getter.inputs, &check.args).await?;
        let expected = resolver
            .resolve(&check.expect, &output)
            .await
            .context("Failed to resolve the expected value")?;
        let current = resolver
            .call_getter(target.caller_address(), getter, &values)
            .await
            .with_context(|| format!("Failed to evaluate `{}.{}`", action.target, check.method))?;

        tracing::debug!(
            target = %action.target,
            check = %check.method,
            current = ?current,
            expected = ?expected,
            "Evaluated skip check"
        );
        Ok(current == expected)
    }
}
