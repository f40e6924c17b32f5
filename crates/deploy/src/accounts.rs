//! Role to signer resolution.
//!
//! Roles are configured per network, the same way named accounts are declared for a node:
//!
//! ```toml
//! [roles.deployer]
//! default = 0
//!
//! [roles.verifier]
//! default = 1
//!
//! [roles.universal]
//! default = "0x5f1BcFf513a637c564B52643b3E2EC218C7b1F91"
//! bsc_testnet = 2
//! ```
//!
//! An integer is an index into the accounts exposed by the node; a string is a literal address.
//! The `default` key applies to every network without its own entry.

use std::collections::BTreeMap;

use alloy_core::primitives::Address;
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{backend::ChainBackend, error::DeployError};

/// Key applying to networks that have no explicit assignment.
pub const DEFAULT_NETWORK_KEY: &str = "default";

/// How a role maps to an account on one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleAssignment {
    /// Index into the node's account list.
    Index(usize),
    /// A fixed address.
    Address(Address),
}

/// Role name to per-network assignments.
pub type RoleTable = BTreeMap<String, BTreeMap<String, RoleAssignment>>;

/// A concrete identity a role resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerIdentity {
    pub role: String,
    pub address: Address,
}

/// Resolves roles to signers for one network.
///
/// A pure function of `(role, network)` over static configuration and the node's account list.
#[derive(Debug, Clone)]
pub struct AccountResolver {
    network: String,
    roles: RoleTable,
    accounts: Vec<Address>,
}

impl AccountResolver {
    pub fn new(network: impl Into<String>, roles: RoleTable, accounts: Vec<Address>) -> Self {
        Self {
            network: network.into(),
            roles,
            accounts,
        }
    }

    /// Build a resolver, fetching the node's accounts only when some role needs them.
    pub async fn connect<B: ChainBackend>(
        network: impl Into<String>,
        roles: RoleTable,
        backend: &B,
    ) -> anyhow::Result<Self> {
        let mut resolver = Self::new(network, roles, Vec::new());
        if resolver.needs_node_accounts() {
            resolver.accounts = backend
                .accounts()
                .await
                .context("Failed to fetch the node's accounts")?;
            tracing::debug!(accounts = resolver.accounts.len(), "Fetched node accounts");
        }
        Ok(resolver)
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// The assignment for `role` on the active network, if configured.
    pub fn assignment(&self, role: &str) -> Option<RoleAssignment> {
        let by_network = self.roles.get(role)?;
        by_network
            .get(&self.network)
            .or_else(|| by_network.get(DEFAULT_NETWORK_KEY))
            .copied()
    }

    pub fn resolve(&self, role: &str) -> Result<SignerIdentity, DeployError> {
        let assignment = self.assignment(role).ok_or_else(|| DeployError::UnknownRole {
            role: role.to_string(),
            network: self.network.clone(),
        })?;

        let address = match assignment {
            RoleAssignment::Address(address) => address,
            RoleAssignment::Index(index) => {
                *self
                    .accounts
                    .get(index)
                    .ok_or_else(|| DeployError::RoleIndexOutOfRange {
                        role: role.to_string(),
                        index,
                        available: self.accounts.len(),
                    })?
            }
        };

        Ok(SignerIdentity {
            role: role.to_string(),
            address,
        })
    }

    /// Roles that need an index into the node's accounts on this network.
    pub fn needs_node_accounts(&self) -> bool {
        self.roles
            .keys()
            .filter_map(|role| self.assignment(role))
            .any(|assignment| matches!(assignment, RoleAssignment::Index(_)))
    }
}
