//! Compiled contract artifacts (ABI + creation bytecode).

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{B256, Bytes, keccak256},
};
use anyhow::{Context, Result};
use serde::Deserialize;

/// ABI and creation bytecode of one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractArtifact {
    pub abi: JsonAbi,
    pub bytecode: Bytes,
}

impl ContractArtifact {
    pub fn new(abi: JsonAbi, bytecode: Bytes) -> Self {
        Self { abi, bytecode }
    }

    /// Hash identifying the bytecode, compared against stored records to detect changes.
    pub fn bytecode_hash(&self) -> B256 {
        keccak256(&self.bytecode)
    }

    /// Parse a compiler artifact.
    ///
    /// Accepts both the flat `{"abi": [...], "bytecode": "0x..."}` layout and the nested
    /// `{"abi": [...], "bytecode": {"object": "0x..."}}` layout.
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: RawArtifact =
            serde_json::from_str(content).context("Failed to parse contract artifact JSON")?;

        let bytecode = match raw.bytecode {
            RawBytecode::Flat(bytes) => bytes,
            RawBytecode::Nested { object } => object,
        };
        if bytecode.is_empty() {
            anyhow::bail!("Contract artifact has empty bytecode (abstract contract or interface?)");
        }

        Ok(Self {
            abi: raw.abi,
            bytecode,
        })
    }
}

#[derive(Deserialize)]
struct RawArtifact {
    abi: JsonAbi,
    bytecode: RawBytecode,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Flat(Bytes),
    Nested { object: Bytes },
}

/// Contract artifacts available to a run, keyed by contract name.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRegistry {
    contracts: BTreeMap<String, ContractArtifact>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `<dir>/<name>.json` for every requested contract.
    ///
    /// Fails on the first missing or malformed artifact, before any network interaction.
    pub fn load<'a>(dir: &Path, names: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut registry = Self::new();
        let names: BTreeSet<&str> = names.into_iter().collect();

        for name in names {
            let path = dir.join(format!("{name}.json"));
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read artifact for `{}` at {}", name, path.display()))?;
            let artifact = ContractArtifact::from_json(&content)
                .with_context(|| format!("Invalid artifact for `{}` at {}", name, path.display()))?;

            tracing::debug!(contract = %name, hash = %artifact.bytecode_hash(), "Loaded contract artifact");
            registry.insert(name, artifact);
        }

        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, artifact: ContractArtifact) {
        self.contracts.insert(name.into(), artifact);
    }

    pub fn get(&self, name: &str) -> Result<&ContractArtifact> {
        self.contracts
            .get(name)
            .with_context(|| format!("No artifact loaded for contract `{}`", name))
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}
