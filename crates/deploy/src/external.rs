//! Best-effort lookup of addresses recorded outside the unit graph.
//!
//! Values live in dot-files (one address per file, e.g. `.AMM_ROUTER`) written by unrelated
//! processes. They may legitimately be missing, e.g. on a fresh local network, so a failed
//! lookup degrades to [`Address::ZERO`] instead of failing the run.

use std::path::{Path, PathBuf};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};

/// Sentinel returned when an external reference cannot be read.
pub const SENTINEL_ADDRESS: Address = Address::ZERO;

/// Outcome of an external reference lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalLookup {
    Found(Address),
    /// The reference could not be read; `reason` says why.
    Unavailable { reason: String },
}

impl ExternalLookup {
    /// The address, or the sentinel when unavailable.
    pub fn address_or_sentinel(&self) -> Address {
        match self {
            Self::Found(address) => *address,
            Self::Unavailable { .. } => SENTINEL_ADDRESS,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Reads external references from a directory.
#[derive(Debug, Clone)]
pub struct ExternalRefLoader {
    dir: PathBuf,
}

impl ExternalRefLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up `key`, degrading to the sentinel address on any failure.
    pub fn lookup(&self, key: &str) -> Address {
        self.try_lookup(key).address_or_sentinel()
    }

    /// Look up `key`, reporting why it is unavailable instead of failing.
    pub fn try_lookup(&self, key: &str) -> ExternalLookup {
        match self.read(key) {
            Ok(address) => {
                tracing::debug!(key = %key, address = %address, "External reference loaded");
                ExternalLookup::Found(address)
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    dir = %self.dir.display(),
                    error = %format!("{e:#}"),
                    "External reference unavailable, using the zero address"
                );
                ExternalLookup::Unavailable {
                    reason: format!("{e:#}"),
                }
            }
        }
    }

    fn read(&self, key: &str) -> Result<Address> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            anyhow::bail!("Invalid external reference key: '{}'", key);
        }

        let path = self.dir.join(key);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        content
            .trim()
            .parse::<Address>()
            .with_context(|| format!("Malformed address in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    const ROUTER: &str = "0x10ED43C718714eb63d5aA57B78B54704E256024E";

    #[test]
    fn test_lookup_found() {
        let temp_dir = TempDir::new("mintwright-external").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join(".AMM_ROUTER"), format!("{ROUTER}\n")).unwrap();

        let loader = ExternalRefLoader::new(temp_dir.path());
        assert_eq!(loader.lookup(".AMM_ROUTER"), ROUTER.parse::<Address>().unwrap());
        assert!(loader.try_lookup(".AMM_ROUTER").is_found());
    }

    #[test]
    fn test_missing_key_degrades_to_sentinel() {
        let temp_dir = TempDir::new("mintwright-external").expect("Failed to create temp dir");
        let loader = ExternalRefLoader::new(temp_dir.path());

        assert_eq!(loader.lookup(".DARENFT_TOKEN"), SENTINEL_ADDRESS);
        assert!(matches!(
            loader.try_lookup(".DARENFT_TOKEN"),
            ExternalLookup::Unavailable { reason } if reason.contains(".DARENFT_TOKEN")
        ));
    }

    #[test]
    fn test_missing_directory_degrades_to_sentinel() {
        let loader = ExternalRefLoader::new("/nonexistent/mintwright/external");
        assert_eq!(loader.lookup(".AMM_ROUTER"), SENTINEL_ADDRESS);
    }

    #[test]
    fn test_malformed_content_degrades_to_sentinel() {
        let temp_dir = TempDir::new("mintwright-external").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join(".AMM_ROUTER"), "not an address").unwrap();

        let loader = ExternalRefLoader::new(temp_dir.path());
        assert_eq!(loader.lookup(".AMM_ROUTER"), SENTINEL_ADDRESS);
    }

    #[test]
    fn test_path_like_keys_are_rejected() {
        let temp_dir = TempDir::new("mintwright-external").expect("Failed to create temp dir");
        let loader = ExternalRefLoader::new(temp_dir.path().join("localhost"));

        assert!(!loader.try_lookup("../.AMM_ROUTER").is_found());
        assert!(!loader.try_lookup("..").is_found());
    }
}
