//! Static package registry loaded from a TOML manifest.
//!
//! The manifest enumerates every package in the ecosystem together with its
//! source location, release tier and validation flags. Entries must be listed
//! grouped by tier in ascending order, so registry order doubles as release
//! order.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default manifest file name, resolved relative to the repo root.
pub const MANIFEST_FILE: &str = "packages.toml";

/// One independently versioned, independently releasable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    /// Source checkout, relative to the repo root.
    pub path: PathBuf,
    /// Index into the registry's tier table.
    pub tier: u32,
    /// No runnable test suite; validation uses the reduced chain.
    pub skip_tests: bool,
    /// Tests need the exclusive shared slapd instance.
    pub sequential: bool,
}

impl Package {
    pub fn label(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("manifest declares no tiers")]
    NoTiers,
    #[error("duplicate package name: {0}")]
    DuplicateName(String),
    #[error("package {name} references unknown tier {tier}")]
    UnknownTier { name: String, tier: u32 },
    #[error("package {name} (tier {tier}) listed after tier {previous}; entries must be grouped by ascending tier")]
    TierOrder { name: String, tier: u32, previous: u32 },
}

#[derive(Debug, Deserialize)]
struct Manifest {
    tiers: Vec<String>,
    #[serde(default, rename = "package")]
    packages: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    /// Defaults to `sources/<name>`.
    path: Option<PathBuf>,
    tier: u32,
    #[serde(default)]
    skip_tests: bool,
    #[serde(default)]
    sequential: bool,
}

/// The full package enumeration. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Registry {
    tiers: Vec<String>,
    packages: Vec<Package>,
    index: BTreeMap<String, usize>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_manifest_str(&content)
    }

    pub fn from_manifest_str(content: &str) -> Result<Self, RegistryError> {
        let manifest: Manifest = toml::from_str(content)?;
        if manifest.tiers.is_empty() {
            return Err(RegistryError::NoTiers);
        }

        let tier_count = manifest.tiers.len() as u32;
        let mut packages = Vec::with_capacity(manifest.packages.len());
        let mut index = BTreeMap::new();
        let mut previous_tier = 0u32;

        for entry in manifest.packages {
            if entry.tier >= tier_count {
                return Err(RegistryError::UnknownTier {
                    name: entry.name,
                    tier: entry.tier,
                });
            }
            if entry.tier < previous_tier {
                return Err(RegistryError::TierOrder {
                    name: entry.name,
                    tier: entry.tier,
                    previous: previous_tier,
                });
            }
            previous_tier = entry.tier;

            let path = entry
                .path
                .unwrap_or_else(|| PathBuf::from("sources").join(&entry.name));
            let package = Package {
                name: entry.name,
                path,
                tier: entry.tier,
                skip_tests: entry.skip_tests,
                sequential: entry.sequential,
            };

            if index.insert(package.name.clone(), packages.len()).is_some() {
                return Err(RegistryError::DuplicateName(package.name));
            }
            packages.push(package);
        }

        Ok(Self {
            tiers: manifest.tiers,
            packages,
            index,
        })
    }

    /// All packages in registry order (grouped by ascending tier).
    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn get(&self, name: &str) -> Option<&Package> {
        self.index.get(name).map(|&i| &self.packages[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn tier_name(&self, tier: u32) -> Option<&str> {
        self.tiers.get(tier as usize).map(String::as_str)
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Split a package set into the parallel-eligible subset and the
    /// sequential-only subset, both in registry order.
    pub fn partition_sequential<'a>(
        &self,
        packages: impl IntoIterator<Item = &'a Package>,
    ) -> (Vec<&'a Package>, Vec<&'a Package>) {
        let mut parallel = Vec::new();
        let mut sequential = Vec::new();
        for p in packages {
            if p.sequential {
                sequential.push(p);
            } else {
                parallel.push(p);
            }
        }
        (parallel, sequential)
    }
}
