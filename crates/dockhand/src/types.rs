use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One discrete stage of validating a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Env,
    Build,
    Check,
    Test,
    Clean,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Env => "env",
            Phase::Build => "build",
            Phase::Check => "check",
            Phase::Test => "test",
            Phase::Clean => "clean",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which phases a `validate` invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Env,
    Build,
    Check,
    Test,
    TestSdist,
    Clean,
    All,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Env => "env",
            Mode::Build => "build",
            Mode::Check => "check",
            Mode::Test => "test",
            Mode::TestSdist => "test-sdist",
            Mode::Clean => "clean",
            Mode::All => "all",
        }
    }
}

/// Where the test phase installs the package from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallSource {
    #[default]
    Wheel,
    Sdist,
}

/// Built distribution kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Wheel,
    Sdist,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Wheel => f.write_str("wheel"),
            ArtifactKind::Sdist => f.write_str("sdist"),
        }
    }
}

/// What went wrong when a phase did not pass.
///
/// `Setup` means a prerequisite was missing (maps to exit code 2 for
/// single-package runs); `Tool` means the external tool ran and reported
/// failure; `Timeout` means the tool was killed at the phase deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Setup,
    Tool,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseStatus {
    Passed,
    Skipped { reason: String },
    Failed { kind: FailureKind, message: String },
}

impl PhaseStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, PhaseStatus::Failed { .. })
    }

    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Failed {
                kind: FailureKind::Setup,
                ..
            }
        )
    }
}

/// Result of running one phase for one package. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub package: String,
    pub phase: Phase,
    #[serde(flatten)]
    pub status: PhaseStatus,
    /// Captured combined output of the external tool invocations.
    pub log_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u128,
}

/// One package's trip through its phase chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRunReport {
    pub package: String,
    pub outcomes: Vec<PhaseOutcome>,
}

impl PackageRunReport {
    pub fn failed(&self) -> bool {
        self.outcomes.iter().any(|o| o.status.is_failure())
    }

    pub fn first_failure(&self) -> Option<&PhaseOutcome> {
        self.outcomes.iter().find(|o| o.status.is_failure())
    }

    pub fn outcome_for(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.outcomes.iter().find(|o| o.phase == phase)
    }
}

/// Aggregate of one parallel dispatch across a package set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub packages: Vec<PackageRunReport>,
    pub failed: BTreeSet<String>,
}

impl BatchReport {
    /// A batch is clean iff no package failed; any failure forces overall
    /// failure regardless of how many packages succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.packages.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// True if any failure in the batch was a setup failure.
    pub fn any_setup_failure(&self) -> bool {
        self.packages
            .iter()
            .flat_map(|p| p.outcomes.iter())
            .any(|o| o.status.is_setup_failure())
    }
}

/// Deterministic batch identifier over the mode and package set.
pub fn compute_batch_id(mode: Mode, packages: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mode.as_str().as_bytes());
    hasher.update(b"\n");
    for name in packages {
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// An entry reported by the artifact comparator: `path` was found only in
/// the `present_in` artifact of `package`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub package: String,
    pub path: String,
    pub present_in: ArtifactKind,
}

/// Structured event written to the append-only JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event_type: EventType,
    /// Package label, or "all" for batch-level events.
    pub package: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventType {
    BatchStarted {
        batch_id: String,
        mode: Mode,
        package_count: usize,
    },
    PhaseStarted {
        phase: Phase,
    },
    PhaseFinished {
        phase: Phase,
        passed: bool,
        message: Option<String>,
    },
    PackageFinished {
        failed: bool,
    },
    BatchFinished {
        total: usize,
        failed: usize,
    },
    ReleaseStarted {
        plan_id: String,
        package_count: usize,
    },
    PackageReleased {
        version: String,
    },
    PackageReleaseFailed {
        message: String,
    },
    ReleaseFinished {
        released: usize,
        failed: usize,
    },
}
