//! Persisted deployment records.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{Address, B256},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One record per successfully deployed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    /// Contract artifact the record was deployed from.
    pub contract: String,
    /// The contract address, or the implementation address for proxied units.
    pub address: Address,
    /// Stable caller-facing address of a proxied unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<Address>,
    /// Admin contract of a transparent proxy, which upgrades go through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_admin: Option<Address>,
    /// Account owning the contract, for shared proxy admin contracts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Address>,
    /// Keccak-256 of the creation bytecode last deployed.
    pub bytecode_hash: B256,
    /// Interface used to encode calls against the unit.
    pub abi: JsonAbi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<B256>,
    /// Unix timestamp of the last deployment or upgrade.
    pub deployed_at: i64,
    /// Version of the tool that wrote the record.
    pub tool_version: String,
}

impl DeploymentRecord {
    pub fn new(contract: impl Into<String>, address: Address, bytecode_hash: B256, abi: JsonAbi) -> Self {
        Self {
            contract: contract.into(),
            address,
            proxy_address: None,
            proxy_admin: None,
            owner: None,
            bytecode_hash,
            abi,
            transaction_hash: None,
            deployed_at: chrono::Utc::now().timestamp(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_proxy(mut self, proxy: Address) -> Self {
        self.proxy_address = Some(proxy);
        self
    }

    pub fn with_proxy_admin(mut self, admin: Option<Address>) -> Self {
        self.proxy_admin = admin;
        self
    }

    pub fn with_owner(mut self, owner: Address) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_transaction(mut self, tx_hash: B256) -> Self {
        self.transaction_hash = Some(tx_hash);
        self
    }

    /// The address callers interact with: the proxy when there is one.
    pub fn caller_address(&self) -> Address {
        self.proxy_address.unwrap_or(self.address)
    }
}

/// Storage for deployment records keyed by unit name.
///
/// The scheduler is the only writer and runs units sequentially, so implementations do not
/// need to coordinate concurrent writers.
pub trait ArtifactStore {
    fn get(&self, name: &str) -> Result<Option<DeploymentRecord>>;

    /// Atomically replace the record stored under `name`.
    fn put(&mut self, name: &str, record: &DeploymentRecord) -> Result<()>;

    /// Remove a record. Returns whether one existed.
    ///
    /// The orchestrator never calls this; it backs the explicit operator command.
    fn remove(&mut self, name: &str) -> Result<bool>;

    /// All records, sorted by unit name.
    fn list(&self) -> Result<Vec<(String, DeploymentRecord)>>;
}

/// In-memory store, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: BTreeMap<String, DeploymentRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self.records.get(name).cloned())
    }

    fn put(&mut self, name: &str, record: &DeploymentRecord) -> Result<()> {
        self.records.insert(name.to_string(), record.clone());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<bool> {
        Ok(self.records.remove(name).is_some())
    }

    fn list(&self) -> Result<Vec<(String, DeploymentRecord)>> {
        Ok(self
            .records
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect())
    }
}

/// JSON store laid out as one `<unit>.json` file per record in a network directory.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create deployments directory {}", dir.display()))?;
        tracing::debug!(dir = %dir.display(), "Opened deployment store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            anyhow::bail!("Invalid unit name for the deployment store: '{}'", name);
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

impl ArtifactStore for JsonDirStore {
    fn get(&self, name: &str) -> Result<Option<DeploymentRecord>> {
        let path = self.record_path(name)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read deployment record {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse deployment record {}", path.display()))?;

        Ok(Some(record))
    }

    fn put(&mut self, name: &str, record: &DeploymentRecord) -> Result<()> {
        let path = self.record_path(name)?;
        let json = serde_json::to_string_pretty(record)
            .context("Failed to serialize deployment record")?;

        // Write next to the target and rename over it so readers never see a partial record.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .context("Failed to create temporary deployment record")?;
        tmp.write_all(json.as_bytes())
            .context("Failed to write temporary deployment record")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to flush temporary deployment record")?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to persist deployment record {}", path.display()))?;

        tracing::debug!(unit = %name, path = %path.display(), "Deployment record saved");
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<bool> {
        let path = self.record_path(name)?;
        if !path.exists() {
            return Ok(false);
        }

        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove deployment record {}", path.display()))?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<(String, DeploymentRecord)>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;

        let mut names = Vec::new();
        for entry in entries {
            let path = entry.context("Failed to read directory entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        names
            .into_iter()
            .filter_map(|name| match self.get(&name) {
                Ok(Some(record)) => Some(Ok((name, record))),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn record(last_byte: u8) -> DeploymentRecord {
        let abi = JsonAbi::parse(["function initialize(address owner)"]).unwrap();
        DeploymentRecord::new(
            "NFT2Vault",
            Address::with_last_byte(last_byte),
            B256::with_last_byte(last_byte),
            abi,
        )
    }

    #[test]
    fn test_caller_address_prefers_proxy() {
        let plain = record(1);
        assert_eq!(plain.caller_address(), Address::with_last_byte(1));

        let proxied = record(1).with_proxy(Address::with_last_byte(9));
        assert_eq!(proxied.caller_address(), Address::with_last_byte(9));
        assert_eq!(proxied.address, Address::with_last_byte(1));
    }

    #[test]
    fn test_json_store_roundtrip_survives_reopen() {
        let temp_dir = TempDir::new("mintwright-store").expect("Failed to create temp dir");
        let dir = temp_dir.path().join("localhost");

        let mut store = JsonDirStore::open(&dir).unwrap();
        assert_eq!(store.get("NFT2Vault").unwrap(), None);

        let saved = record(3).with_proxy(Address::with_last_byte(4));
        store.put("NFT2Vault", &saved).unwrap();

        let reopened = JsonDirStore::open(&dir).unwrap();
        assert_eq!(reopened.get("NFT2Vault").unwrap(), Some(saved));
    }

    #[test]
    fn test_json_store_put_overwrites() {
        let temp_dir = TempDir::new("mintwright-store").expect("Failed to create temp dir");
        let mut store = JsonDirStore::open(temp_dir.path()).unwrap();

        store.put("NFT2", &record(1)).unwrap();
        store.put("NFT2", &record(2)).unwrap();

        let loaded = store.get("NFT2").unwrap().unwrap();
        assert_eq!(loaded.address, Address::with_last_byte(2));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_json_store_list_skips_dot_files() {
        let temp_dir = TempDir::new("mintwright-store").expect("Failed to create temp dir");
        let mut store = JsonDirStore::open(temp_dir.path()).unwrap();

        store.put("NFT2Vault", &record(1)).unwrap();
        store.put("DerivativeNFT2", &record(2)).unwrap();
        std::fs::write(temp_dir.path().join(".AMM_ROUTER"), "0x01").unwrap();
        std::fs::write(temp_dir.path().join(".chainId"), "31337").unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["DerivativeNFT2", "NFT2Vault"]);
    }

    #[test]
    fn test_json_store_remove() {
        let temp_dir = TempDir::new("mintwright-store").expect("Failed to create temp dir");
        let mut store = JsonDirStore::open(temp_dir.path()).unwrap();

        store.put("NFT2", &record(1)).unwrap();
        assert!(store.remove("NFT2").unwrap());
        assert!(!store.remove("NFT2").unwrap());
        assert_eq!(store.get("NFT2").unwrap(), None);
    }

    #[test]
    fn test_json_store_rejects_path_like_names() {
        let temp_dir = TempDir::new("mintwright-store").expect("Failed to create temp dir");
        let mut store = JsonDirStore::open(temp_dir.path()).unwrap();

        assert!(store.put("../escape", &record(1)).is_err());
        assert!(store.get(".hidden").is_err());
    }

    #[test]
    fn test_json_store_corrupted_record_is_an_error() {
        let temp_dir = TempDir::new("mintwright-store").expect("Failed to create temp dir");
        let store = JsonDirStore::open(temp_dir.path()).unwrap();
        std::fs::write(temp_dir.path().join("NFT2.json"), "{ invalid json }").unwrap();

        assert!(store.get("NFT2").is_err());
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        store.put("B", &record(2)).unwrap();
        store.put("A", &record(1)).unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(store.remove("A").unwrap());
        assert_eq!(store.get("A").unwrap(), None);
    }
}
