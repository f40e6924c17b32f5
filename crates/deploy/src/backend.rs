//! The network boundary the orchestrator drives.

use std::future::Future;

use alloy_core::primitives::{Address, B256, Bytes};
use anyhow::Result;

/// Result of a confirmed contract creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployReceipt {
    pub address: Address,
    pub transaction_hash: B256,
}

/// Result of a confirmed state-changing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
}

/// Capabilities of a chain the orchestrator deploys to.
///
/// Every method resolves once the transaction is confirmed (or the read completes); there is
/// no fire-and-forget submission. Signing is the backend's concern: callers only name the
/// sender address.
pub trait ChainBackend: Send + Sync {
    /// Accounts the node can sign for, in index order.
    fn accounts(&self) -> impl Future<Output = Result<Vec<Address>>> + Send;

    /// Submit a contract creation with `init_code` (bytecode followed by encoded constructor
    /// arguments) and wait for the receipt.
    fn deploy_contract(
        &self,
        init_code: Bytes,
        from: Address,
    ) -> impl Future<Output = Result<DeployReceipt>> + Send;

    /// Submit a state-changing call and wait for the receipt. A reverted call is an error.
    fn send_call(
        &self,
        to: Address,
        calldata: Bytes,
        from: Address,
    ) -> impl Future<Output = Result<TxReceipt>> + Send;

    /// Perform a read-only call against the latest state.
    fn read(&self, to: Address, calldata: Bytes) -> impl Future<Output = Result<Bytes>> + Send;

    /// The storage word at `slot` of `address`.
    fn storage_at(&self, address: Address, slot: B256) -> impl Future<Output = Result<B256>> + Send;

    /// Keccak-256 of the runtime code at `address`, or `None` when there is no code.
    fn code_hash(&self, address: Address) -> impl Future<Output = Result<Option<B256>>> + Send;
}
