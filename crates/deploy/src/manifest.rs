//! The `Mintwright.toml` manifest.
//!
//! ```toml
//! network = "localhost"
//! rpc_url = "http://127.0.0.1:8545"
//! artifacts_dir = "artifacts"
//!
//! [roles.deployer]
//! default = 0
//!
//! [[units]]
//! name = "NFT2"
//! tags = ["NFT2"]
//! ```
//!
//! `MINTWRIGHT_NETWORK` and `MINTWRIGHT_RPC_URL` override the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    accounts::RoleTable, error::DeployError, external::ExternalRefLoader, graph::TaskGraph,
    store::JsonDirStore, unit::Unit,
};

/// The default name of the manifest file.
pub const MANIFEST_FILENAME: &str = "Mintwright.toml";

/// Prefix of environment variables overriding manifest keys.
pub const ENV_PREFIX: &str = "MINTWRIGHT_";

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_deployments_dir() -> PathBuf {
    PathBuf::from("deployments")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Name of the target network; selects role assignments and the record directory.
    pub network: String,
    /// JSON-RPC endpoint of the network.
    pub rpc_url: String,
    /// Directory holding `<Contract>.json` compiler artifacts.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    /// Root of the deployment records; records live in `<deployments_dir>/<network>/`.
    #[serde(default = "default_deployments_dir")]
    pub deployments_dir: PathBuf,
    /// Directory of external reference dot-files. Defaults to the network's record directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_dir: Option<PathBuf>,
    #[serde(default)]
    pub roles: RoleTable,
    #[serde(default)]
    pub units: Vec<Unit>,
}

impl Manifest {
    /// Load a manifest from a file, or from [`MANIFEST_FILENAME`] inside a directory.
    ///
    /// Relative directories in the manifest are resolved against the manifest's location.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Manifest file or directory not found: {}", path.display());
        }

        let manifest_path = if path.is_dir() {
            path.join(MANIFEST_FILENAME)
        } else {
            path.to_path_buf()
        };
        if !manifest_path.is_file() {
            anyhow::bail!("Manifest file not found: {}", manifest_path.display());
        }

        let mut manifest: Self = Figment::new()
            .merge(Toml::file(&manifest_path))
            .merge(Env::prefixed(ENV_PREFIX).only(&["network", "rpc_url"]))
            .extract()
            .with_context(|| format!("Failed to parse manifest {}", manifest_path.display()))?;

        let base = manifest_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        manifest.resolve_paths(base);
        manifest.validate()?;

        tracing::info!(
            path = %manifest_path.display(),
            network = %manifest.network,
            units = manifest.units.len(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        resolve(&mut self.artifacts_dir);
        resolve(&mut self.deployments_dir);
        if let Some(dir) = self.external_dir.as_mut() {
            resolve(dir);
        }
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, network: Option<String>, rpc_url: Option<String>) -> Result<Self> {
        if let Some(network) = network {
            self.network = network;
        }
        if let Some(rpc_url) = rpc_url {
            self.rpc_url = rpc_url;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.trim().is_empty() {
            anyhow::bail!("Manifest network name is empty");
        }
        if self.network.contains(['/', '\\']) || self.network.starts_with('.') {
            anyhow::bail!("Invalid network name '{}'", self.network);
        }
        Url::parse(&self.rpc_url).with_context(|| format!("Invalid RPC URL '{}'", self.rpc_url))?;
        Ok(())
    }

    /// Directory holding the records of the active network.
    pub fn network_dir(&self) -> PathBuf {
        self.deployments_dir.join(&self.network)
    }

    pub fn external_dir(&self) -> PathBuf {
        self.external_dir.clone().unwrap_or_else(|| self.network_dir())
    }

    pub fn graph(&self) -> Result<TaskGraph, DeployError> {
        TaskGraph::new(self.units.clone())
    }

    pub fn open_store(&self) -> Result<JsonDirStore> {
        JsonDirStore::open(self.network_dir())
    }

    pub fn external_loader(&self) -> ExternalRefLoader {
        ExternalRefLoader::new(self.external_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{accounts::RoleAssignment, unit::Strategy};
    use tempdir::TempDir;

    const MANIFEST: &str = r#"
        network = "localhost"
        rpc_url = "http://127.0.0.1:8545"

        [roles.deployer]
        default = 0

        [roles.universal]
        default = "0x5f1BcFf513a637c564B52643b3E2EC218C7b1F91"

        [[units]]
        name = "TokenTransferProxy"
        strategy = "proxied"
        tags = ["TokenTransferProxy"]
        init_args = [{ role = "deployer" }]

        [[units]]
        name = "NFT2Vault"
        strategy = "proxied"
        tags = ["NFT2Vault", "next"]
        dependencies = ["TokenTransferProxy"]
        init_args = [{ role = "deployer" }, { unit = "TokenTransferProxy" }]
    "#;

    #[test]
    fn test_load_resolves_paths_against_manifest_dir() {
        // Jailed so environment overrides set by other tests cannot leak in.
        figment::Jail::expect_with(|jail| {
            jail.create_file(MANIFEST_FILENAME, MANIFEST)?;
            let dir = jail.directory().to_path_buf();

            let manifest = Manifest::load(&dir).map_err(|e| e.to_string())?;

            assert_eq!(manifest.artifacts_dir, dir.join("artifacts"));
            assert_eq!(manifest.network_dir(), dir.join("deployments").join("localhost"));
            assert_eq!(manifest.external_dir(), manifest.network_dir());
            assert_eq!(manifest.units.len(), 2);
            assert_eq!(manifest.units[1].strategy, Strategy::Proxied);
            assert_eq!(manifest.roles["deployer"]["default"], RoleAssignment::Index(0));
            assert!(manifest.graph().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_missing_manifest() {
        let temp_dir = TempDir::new("mintwright-manifest").expect("Failed to create temp dir");
        assert!(Manifest::load(&temp_dir.path().join("nope.toml")).is_err());
        assert!(Manifest::load(temp_dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(MANIFEST_FILENAME, MANIFEST)?;
            jail.set_env("MINTWRIGHT_NETWORK", "bsc_testnet");
            jail.set_env("MINTWRIGHT_RPC_URL", "https://data-seed-prebsc-1-s1.binance.org:8545");

            let manifest = Manifest::load(Path::new(MANIFEST_FILENAME)).map_err(|e| e.to_string())?;
            assert_eq!(manifest.network, "bsc_testnet");
            assert_eq!(manifest.rpc_url, "https://data-seed-prebsc-1-s1.binance.org:8545");
            assert_eq!(manifest.network_dir(), Path::new("./deployments/bsc_testnet"));
            Ok(())
        });
    }

    #[test]
    fn test_overrides_are_validated() {
        let manifest: Manifest = toml::from_str(MANIFEST).unwrap();

        let overridden = manifest
            .clone()
            .with_overrides(Some("bsc_mainnet".into()), None)
            .unwrap();
        assert_eq!(overridden.network, "bsc_mainnet");

        assert!(manifest.clone().with_overrides(None, Some("not a url".into())).is_err());
        assert!(manifest.with_overrides(Some("../escape".into()), None).is_err());
    }

    #[test]
    fn test_external_dir_override() {
        let mut manifest: Manifest = toml::from_str(MANIFEST).unwrap();
        manifest.external_dir = Some(PathBuf::from("/srv/refs"));
        assert_eq!(manifest.external_dir(), PathBuf::from("/srv/refs"));
    }
}
