//! JSON-RPC implementation of [`ChainBackend`].
//!
//! Transactions are sent with `eth_sendTransaction`, so the node must hold (or proxy) the keys
//! of the accounts roles resolve to. Receipts are polled until mined.

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, keccak256};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use crate::backend::{ChainBackend, DeployReceipt, TxReceipt};

/// Default timeout for a single RPC request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between receipt polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default time to wait for a transaction to be mined.
const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);

/// The node has no receipt for the transaction yet.
#[derive(Debug, thiserror::Error)]
#[error("Transaction {0} is still pending")]
struct ReceiptPending(B256);

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result, or an error if the request failed or returned an error response.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response = client
        .post(url)
        .json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let result: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    if let Some(error) = result.get("error") {
        anyhow::bail!(
            "RPC error from {}: {}",
            method,
            error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
        );
    }

    let result_value = result
        .get("result")
        .context("No result in response")?
        .clone();

    serde_json::from_value(result_value)
        .with_context(|| format!("Failed to deserialize {} result", method))
}

/// Parse a hex-encoded JSON-RPC quantity (`"0x1a"`).
fn parse_quantity(value: &str) -> anyhow::Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid hex quantity '{}'", value))
}

/// The subset of a transaction receipt the orchestrator needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contract_address: Option<Address>,
    #[serde(default)]
    block_number: Option<String>,
}

impl RpcReceipt {
    fn succeeded(&self) -> anyhow::Result<bool> {
        // Pre-byzantium receipts carry no status; treat them as successful.
        match &self.status {
            Some(status) => Ok(parse_quantity(status)? == 1),
            None => Ok(true),
        }
    }

    fn block_number(&self) -> anyhow::Result<Option<u64>> {
        self.block_number.as_deref().map(parse_quantity).transpose()
    }
}

/// A [`ChainBackend`] talking to a node over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct JsonRpcBackend {
    client: reqwest::Client,
    url: Url,
    poll_interval: Duration,
    confirmation_timeout: Duration,
}

impl JsonRpcBackend {
    pub fn new(rpc_url: &str) -> anyhow::Result<Self> {
        let url = Url::parse(rpc_url).with_context(|| format!("Invalid RPC URL '{}'", rpc_url))?;

        Ok(Self {
            client: create_client()?,
            url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        })
    }

    /// Override how receipts are polled.
    pub fn with_confirmation(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.confirmation_timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> anyhow::Result<T> {
        json_rpc_call(&self.client, self.url.as_str(), method, params).await
    }

    /// The chain ID reported by the node.
    pub async fn chain_id(&self) -> anyhow::Result<u64> {
        let id: String = self.call("eth_chainId", vec![]).await?;
        parse_quantity(&id)
    }

    async fn submit(&self, tx: Value) -> anyhow::Result<RpcReceipt> {
        let tx_hash: B256 = self
            .call("eth_sendTransaction", vec![tx])
            .await
            .context("Failed to submit transaction")?;

        tracing::debug!(tx_hash = %tx_hash, "Transaction submitted, waiting for receipt");

        let receipt = self.wait_for_receipt(tx_hash).await?;
        if !receipt.succeeded()? {
            anyhow::bail!("Transaction {} reverted", tx_hash);
        }

        Ok(receipt)
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> anyhow::Result<RpcReceipt> {
        let max_polls = (self.confirmation_timeout.as_millis() / self.poll_interval.as_millis().max(1))
            .max(1) as usize;

        let fetch = || async {
            let receipt: Option<RpcReceipt> = self
                .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
                .await
                .context("Failed to fetch receipt")?;
            receipt.ok_or_else(|| anyhow::Error::new(ReceiptPending(tx_hash)))
        };

        // Only a missing receipt is retried; RPC failures surface immediately.
        let result = fetch
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.poll_interval)
                    .with_max_times(max_polls),
            )
            .when(|err: &anyhow::Error| err.is::<ReceiptPending>())
            .notify(|err: &anyhow::Error, after: Duration| {
                tracing::trace!(error = %err, retry_in = ?after, "Receipt not available yet");
            })
            .await;

        match result {
            Err(err) if err.is::<ReceiptPending>() => Err(err.context(format!(
                "Timed out after {:?} waiting for transaction {} to be mined",
                self.confirmation_timeout, tx_hash
            ))),
            other => other,
        }
    }
}

impl ChainBackend for JsonRpcBackend {
    async fn accounts(&self) -> anyhow::Result<Vec<Address>> {
        self.call("eth_accounts", vec![])
            .await
            .context("Failed to list node accounts")
    }

    async fn deploy_contract(&self, init_code: Bytes, from: Address) -> anyhow::Result<DeployReceipt> {
        let receipt = self
            .submit(json!({ "from": from, "data": init_code }))
            .await
            .context("Contract creation failed")?;

        let address = receipt
            .contract_address
            .context("Receipt of a contract creation has no contract address")?;

        Ok(DeployReceipt {
            address,
            transaction_hash: receipt.transaction_hash,
        })
    }

    async fn send_call(&self, to: Address, calldata: Bytes, from: Address) -> anyhow::Result<TxReceipt> {
        let receipt = self
            .submit(json!({ "from": from, "to": to, "data": calldata }))
            .await
            .with_context(|| format!("Call to {} failed", to))?;

        Ok(TxReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number()?,
        })
    }

    async fn read(&self, to: Address, calldata: Bytes) -> anyhow::Result<Bytes> {
        self.call("eth_call", vec![json!({ "to": to, "data": calldata }), json!("latest")])
            .await
            .with_context(|| format!("Read from {} failed", to))
    }

    async fn storage_at(&self, address: Address, slot: B256) -> anyhow::Result<B256> {
        self.call("eth_getStorageAt", vec![json!(address), json!(slot), json!("latest")])
            .await
            .with_context(|| format!("Failed to read storage slot {} of {}", slot, address))
    }

    async fn code_hash(&self, address: Address) -> anyhow::Result<Option<B256>> {
        let code: Bytes = self
            .call("eth_getCode", vec![json!(address), json!("latest")])
            .await
            .with_context(|| format!("Failed to fetch code at {}", address))?;

        Ok((!code.is_empty()).then(|| keccak256(&code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_receipt_status() {
        let mined: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": B256::with_last_byte(1),
            "status": "0x1",
            "contractAddress": Address::with_last_byte(2),
            "blockNumber": "0x10"
        }))
        .unwrap();
        assert!(mined.succeeded().unwrap());
        assert_eq!(mined.block_number().unwrap(), Some(16));
        assert_eq!(mined.contract_address, Some(Address::with_last_byte(2)));

        let reverted: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": B256::with_last_byte(1),
            "status": "0x0",
            "contractAddress": null
        }))
        .unwrap();
        assert!(!reverted.succeeded().unwrap());
        assert_eq!(reverted.block_number().unwrap(), None);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(JsonRpcBackend::new("not a url").is_err());
        assert!(JsonRpcBackend::new("http://localhost:8545").is_ok());
    }

    fn backend(server: &ServerGuard) -> JsonRpcBackend {
        JsonRpcBackend::new(&server.url())
            .unwrap()
            .with_confirmation(Duration::from_millis(10), Duration::from_millis(50))
    }

    fn respond(server: &mut ServerGuard, method: &str, body: Value) -> mockito::Mock {
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "method": method })))
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    fn result(value: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": 1, "result": value })
    }

    #[tokio::test]
    async fn test_reverted_transaction_fails_the_call() {
        let mut server = Server::new_async().await;
        let tx_hash = B256::with_last_byte(7);
        let _submit = respond(&mut server, "eth_sendTransaction", result(json!(tx_hash)))
            .create_async()
            .await;
        let receipt = respond(
            &mut server,
            "eth_getTransactionReceipt",
            result(json!({ "transactionHash": tx_hash, "status": "0x0", "blockNumber": "0x2" })),
        )
        .expect(1)
        .create_async()
        .await;

        let err = backend(&server)
            .send_call(Address::with_last_byte(1), Bytes::new(), Address::with_last_byte(2))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains(&format!("Transaction {} reverted", tx_hash)));
        receipt.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_receipt_times_out() {
        let mut server = Server::new_async().await;
        let tx_hash = B256::with_last_byte(8);
        let _submit = respond(&mut server, "eth_sendTransaction", result(json!(tx_hash)))
            .create_async()
            .await;
        let receipt = respond(&mut server, "eth_getTransactionReceipt", result(Value::Null))
            .expect_at_least(2)
            .create_async()
            .await;

        let err = backend(&server)
            .deploy_contract(Bytes::from_static(&[0x60, 0x01]), Address::with_last_byte(2))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("Timed out"));
        receipt.assert_async().await;
    }

    #[tokio::test]
    async fn test_receipt_rpc_error_is_not_retried() {
        let mut server = Server::new_async().await;
        let tx_hash = B256::with_last_byte(9);
        let _submit = respond(&mut server, "eth_sendTransaction", result(json!(tx_hash)))
            .create_async()
            .await;
        let receipt = respond(
            &mut server,
            "eth_getTransactionReceipt",
            json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": -32000, "message": "header not found" } }),
        )
        .expect(1)
        .create_async()
        .await;

        let err = backend(&server)
            .send_call(Address::with_last_byte(1), Bytes::new(), Address::with_last_byte(2))
            .await
            .unwrap_err();

        let message = format!("{err:#}");
        assert!(message.contains("header not found"));
        assert!(!message.contains("Timed out"));
        receipt.assert_async().await;
    }
}
