//! Errors surfaced by the orchestrator.

use thiserror::Error;

/// The stage of a unit at which a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    /// Deploying (or upgrading) the unit's contract.
    Deploy,
    /// Running one of the unit's post-deploy actions.
    Action,
}

/// Errors returned by graph construction and by a run.
///
/// Graph errors (`CyclicDependency`, `UnknownUnit`, `DuplicateUnit`, `UndeclaredDependency`,
/// `NotDeployable`, `ReservedUnitName`) are raised before any network interaction.
/// `DeploymentFailed` and `ActionFailed` carry the underlying cause; `UnknownRole` and
/// `ExternalReferenceUnavailable` usually appear inside that cause chain and can be recovered
/// with [`anyhow::Error::downcast_ref`].
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// `referenced_by` is the referencing unit, or `None` when the name came from the selection.
    #[error("unknown unit `{name}` (referenced by {})", .referenced_by.as_deref().unwrap_or("the selection"))]
    UnknownUnit {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("unit `{0}` is declared more than once")]
    DuplicateUnit(String),

    #[error("unit `{unit}` references `{reference}` which is not one of its dependencies")]
    UndeclaredDependency { unit: String, reference: String },

    /// A unit references a configuration-only unit as if it had an address.
    #[error("unit `{unit}` references `{reference}`, which deploys no contract")]
    NotDeployable { unit: String, reference: String },

    #[error("unit name `{0}` is reserved for the shared proxy admin record")]
    ReservedUnitName(String),

    #[error("role `{role}` is not configured for network `{network}`")]
    UnknownRole { role: String, network: String },

    #[error("role `{role}` maps to account index {index} but the node only exposes {available} accounts")]
    RoleIndexOutOfRange {
        role: String,
        index: usize,
        available: usize,
    },

    #[error("external reference `{key}` is unavailable")]
    ExternalReferenceUnavailable { key: String },

    #[error("deployment of unit `{unit}` failed")]
    DeploymentFailed {
        unit: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("action #{index} (`{method}`) of unit `{unit}` failed")]
    ActionFailed {
        unit: String,
        index: usize,
        method: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DeployError {
    /// The unit a run failed at, if the error happened during execution.
    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::DeploymentFailed { unit, .. } | Self::ActionFailed { unit, .. } => Some(unit),
            _ => None,
        }
    }

    /// The stage a run failed at, if the error happened during execution.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::DeploymentFailed { .. } => Some(Stage::Deploy),
            Self::ActionFailed { .. } => Some(Stage::Action),
            _ => None,
        }
    }

    /// Find a typed orchestrator error in the cause chain of an execution failure.
    pub fn cause(&self) -> Option<&DeployError> {
        match self {
            Self::DeploymentFailed { source, .. } | Self::ActionFailed { source, .. } => {
                source.downcast_ref::<DeployError>()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_unit() {
        let err = DeployError::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: A -> B -> A");
    }

    #[test]
    fn test_execution_errors_report_unit_and_stage() {
        let err = DeployError::ActionFailed {
            unit: "grant-perm".into(),
            index: 1,
            method: "grantRole".into(),
            source: anyhow::anyhow!("execution reverted"),
        };
        assert_eq!(err.unit(), Some("grant-perm"));
        assert_eq!(err.stage(), Some(Stage::Action));
        assert_eq!(err.stage().unwrap().to_string(), "action");
    }

    #[test]
    fn test_cause_recovers_typed_error_through_context() {
        use anyhow::Context;

        let inner: anyhow::Result<()> = Err(DeployError::UnknownRole {
            role: "verifier".into(),
            network: "localhost".into(),
        }
        .into());
        let err = DeployError::DeploymentFailed {
            unit: "NFTFactory".into(),
            source: inner.context("Failed to resolve deployer").unwrap_err(),
        };

        assert!(matches!(err.cause(), Some(DeployError::UnknownRole { .. })));
    }
}
