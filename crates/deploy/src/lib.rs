//! mintwright-deploy - Deployment orchestration for interdependent contracts.
//!
//! Units declared in a manifest are resolved into a dependency-ordered plan, then deployed
//! (directly or behind an upgradeable proxy) and configured through post-deploy actions.
//! Records of deployed units are persisted so that re-running only does what changed.

pub mod accounts;
pub mod actions;
pub mod args;
pub mod artifacts;
pub mod backend;
pub mod error;
pub mod external;
pub mod graph;
pub mod manifest;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod testing;
pub mod unit;

pub use accounts::{AccountResolver, RoleAssignment, RoleTable, SignerIdentity};
pub use actions::ActionSummary;
pub use artifacts::{ArtifactRegistry, ContractArtifact};
pub use backend::{ChainBackend, DeployReceipt, TxReceipt};
pub use error::{DeployError, Stage};
pub use external::{ExternalLookup, ExternalRefLoader, SENTINEL_ADDRESS};
pub use graph::{ExecutionPlan, Selection, TaskGraph};
pub use manifest::{MANIFEST_FILENAME, Manifest};
pub use rpc::JsonRpcBackend;
pub use scheduler::{RunReport, Scheduler, UnitReport};
pub use store::{ArtifactStore, DeploymentRecord, JsonDirStore, MemoryStore};
pub use strategy::{DeployOutcome, ERC1967_ADMIN_SLOT};
pub use unit::{Action, ArgSpec, Placeholder, ProxyKind, ProxyOptions, ReadCall, SkipCheck, Strategy, Unit};
