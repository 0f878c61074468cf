//! Configuration file support (`.dockhand.toml`).
//!
//! Project-specific settings live in a `.dockhand.toml` at the repo root.
//! Every section is optional; missing values fall back to the defaults the
//! validation scripts have always used.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::registry::{self, Package};
use crate::types::InstallSource;

/// Default config file name, resolved relative to the repo root.
pub const CONFIG_FILE: &str = ".dockhand.toml";

/// Marker variable set for every test invocation.
pub const TESTRUN_MARKER_VAR: &str = "TESTRUN_MARKER";

/// Environment variables consumed by LDAP-dependent test suites.
pub const LDAP_ADD_BIN_VAR: &str = "LDAP_ADD_BIN";
pub const LDAP_DELETE_BIN_VAR: &str = "LDAP_DELETE_BIN";
pub const SLAPD_BIN_VAR: &str = "SLAPD_BIN";
pub const SLAPD_URIS_VAR: &str = "SLAPD_URIS";

pub fn serialize_duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&humantime::format_duration(*d).to_string())
}

pub fn deserialize_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Directory layout section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    #[serde(default = "default_sources_dir")]
    pub sources_dir: PathBuf,
    #[serde(default = "default_dist_dir")]
    pub dist_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Validation pipeline section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateConfig {
    /// Interpreter used to create per-package environments.
    #[serde(default = "default_python")]
    pub python: String,
    /// Minimum acceptable pyroma quality score (out of 10).
    #[serde(default = "default_pyroma_threshold")]
    pub pyroma_threshold: u32,
    /// Deadline for a single phase; a hung tool is killed and surfaced as a
    /// timeout failure.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout: Duration,
    /// Upper bound on concurrently validated packages.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub install_from: InstallSource,
}

/// LDAP test fixture section. Paths are relative to the repo root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    #[serde(default = "default_ldap_add_bin")]
    pub add_bin: PathBuf,
    #[serde(default = "default_ldap_delete_bin")]
    pub delete_bin: PathBuf,
    #[serde(default = "default_slapd_bin")]
    pub slapd_bin: PathBuf,
    #[serde(default = "default_slapd_uris")]
    pub uris: String,
}

/// Release driver section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Continue with remaining packages after a release failure. Off by
    /// default: later tiers may depend on the version just being cut.
    #[serde(default)]
    pub keep_going: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub validate: ValidateConfig,
    #[serde(default)]
    pub ldap: LdapConfig,
    #[serde(default)]
    pub release: ReleaseConfig,
}

fn default_manifest() -> PathBuf {
    PathBuf::from(registry::MANIFEST_FILE)
}

fn default_sources_dir() -> PathBuf {
    PathBuf::from("sources")
}

fn default_dist_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".dockhand")
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_pyroma_threshold() -> u32 {
    8
}

fn default_phase_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_max_concurrent() -> usize {
    4
}

fn default_ldap_add_bin() -> PathBuf {
    PathBuf::from("openldap/bin/ldapadd")
}

fn default_ldap_delete_bin() -> PathBuf {
    PathBuf::from("openldap/bin/ldapdelete")
}

fn default_slapd_bin() -> PathBuf {
    PathBuf::from("openldap/libexec/slapd")
}

fn default_slapd_uris() -> String {
    "ldap://127.0.0.1:12345".to_string()
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            sources_dir: default_sources_dir(),
            dist_dir: default_dist_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            pyroma_threshold: default_pyroma_threshold(),
            phase_timeout: default_phase_timeout(),
            max_concurrent: default_max_concurrent(),
            install_from: InstallSource::default(),
        }
    }
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            add_bin: default_ldap_add_bin(),
            delete_bin: default_ldap_delete_bin(),
            slapd_bin: default_slapd_bin(),
            uris: default_slapd_uris(),
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self { keep_going: false }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout: LayoutConfig::default(),
            validate: ValidateConfig::default(),
            ldap: LdapConfig::default(),
            release: ReleaseConfig::default(),
        }
    }
}

impl Config {
    /// Load `.dockhand.toml` from the repo root, falling back to defaults
    /// when the file is absent.
    pub fn load(root: &Path) -> Result<Self> {
        Self::load_from(&root.join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

/// Resolved directory layout for one repo root.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    pub sources_dir: PathBuf,
    pub dist_dir: PathBuf,
    pub state_dir: PathBuf,
}

/// Per-package environment directory name inside the source checkout.
pub const VENV_DIR: &str = "venv";

impl Layout {
    pub fn new(root: &Path, config: &LayoutConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            sources_dir: root.join(&config.sources_dir),
            dist_dir: root.join(&config.dist_dir),
            state_dir: root.join(&config.state_dir),
        }
    }

    /// Source checkout of a package.
    pub fn package_dir(&self, package: &Package) -> PathBuf {
        self.root.join(&package.path)
    }

    /// Isolated per-package environment, exclusively owned by that
    /// package's phases.
    pub fn venv_dir(&self, package: &Package) -> PathBuf {
        self.package_dir(package).join(VENV_DIR)
    }

    pub fn venv_python(&self, package: &Package) -> PathBuf {
        self.venv_dir(package).join("bin").join("python")
    }

    /// Package-local build output, distinct from the shared dist dir.
    pub fn package_dist_dir(&self, package: &Package) -> PathBuf {
        self.package_dir(package).join("dist")
    }

    pub fn logs_dir(&self, batch_id: &str) -> PathBuf {
        self.state_dir.join("logs").join(batch_id)
    }

    pub fn phase_log_path(&self, batch_id: &str, package: &str, phase: &str) -> PathBuf {
        self.logs_dir(batch_id).join(format!("{package}.{phase}.log"))
    }
}

/// Environment variables injected into every test invocation, LDAP package
/// or not.
pub fn test_environment(layout: &Layout, ldap: &LdapConfig) -> Vec<(String, String)> {
    vec![
        (TESTRUN_MARKER_VAR.to_string(), "1".to_string()),
        (
            LDAP_ADD_BIN_VAR.to_string(),
            layout.root.join(&ldap.add_bin).display().to_string(),
        ),
        (
            LDAP_DELETE_BIN_VAR.to_string(),
            layout.root.join(&ldap.delete_bin).display().to_string(),
        ),
        (
            SLAPD_BIN_VAR.to_string(),
            layout.root.join(&ldap.slapd_bin).display().to_string(),
        ),
        (SLAPD_URIS_VAR.to_string(), ldap.uris.clone()),
    ]
}
