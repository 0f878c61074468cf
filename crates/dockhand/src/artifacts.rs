//! Wheel vs sdist content comparison.
//!
//! For every package with both artifacts in the shared dist dir, the
//! comparator lists the archive contents, strips per-format noise, and
//! reports paths present in only one of the two. Expected asymmetries
//! (metadata, docs, VCS ignore files, test-only files) are filtered before
//! anything is reported.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::types::{ArtifactKind, Discrepancy};

/// Wheel metadata directory suffix; its contents have no sdist counterpart.
const DIST_INFO_MARKER: &str = ".dist-info/";

/// Metadata files expected only in the sdist.
const SDIST_METADATA_FILES: &[&str] = &["PKG-INFO", "setup.cfg", "setup.py", "pyproject.toml"];

/// Documentation files excluded from the comparison on either side.
const DOC_PREFIXES: &[&str] = &["LICENSE", "README", "CHANGES", "HISTORY"];

/// Extensions that never ship in a wheel.
const NON_PACKAGE_SUFFIXES: &[&str] = &[".rst", ".md", ".txt", ".ini", ".cfg", ".toml"];

/// Per-package comparison result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageComparison {
    pub package: String,
    pub version: String,
    pub wheel_file_count: usize,
    pub sdist_file_count: usize,
    pub discrepancies: Vec<Discrepancy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub packages: Vec<PackageComparison>,
    /// Wheels with no matching sdist in the dist dir.
    pub unpaired: Vec<String>,
}

impl ComparisonReport {
    pub fn discrepancies(&self) -> impl Iterator<Item = &Discrepancy> {
        self.packages.iter().flat_map(|p| p.discrepancies.iter())
    }

    /// Clean means nothing survived the exclusion filter and every wheel
    /// had a matching sdist.
    pub fn is_clean(&self) -> bool {
        self.unpaired.is_empty() && self.discrepancies().next().is_none()
    }
}

/// List a wheel's contained file paths, skipping wheel metadata.
pub fn wheel_entries(path: &Path) -> Result<BTreeSet<String>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open wheel {}", path.display()))?;
    let archive = zip::ZipArchive::new(file)
        .with_context(|| format!("failed to read wheel archive {}", path.display()))?;

    let mut entries = BTreeSet::new();
    for name in archive.file_names() {
        if name.ends_with('/') || name.contains(DIST_INFO_MARKER) {
            continue;
        }
        entries.insert(name.to_string());
    }
    Ok(entries)
}

/// List an sdist's contained file paths with the top-level
/// `{name}-{version}/` directory stripped and sdist-only metadata skipped.
pub fn sdist_entries(path: &Path) -> Result<BTreeSet<String>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open sdist {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut entries = BTreeSet::new();
    for entry in archive
        .entries()
        .with_context(|| format!("failed to read sdist archive {}", path.display()))?
    {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry.path()?.to_string_lossy().to_string();
        let Some((_, inner)) = raw.split_once('/') else {
            continue;
        };
        if SDIST_METADATA_FILES.contains(&inner) {
            continue;
        }
        entries.insert(inner.to_string());
    }
    Ok(entries)
}

/// sdists of src-layout packages nest the importable tree under `src/`.
fn normalize_sdist_path(path: &str) -> &str {
    path.strip_prefix("src/").unwrap_or(path)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_vcs_ignore(path: &str) -> bool {
    file_name(path) == ".gitignore"
}

fn is_doc_file(path: &str) -> bool {
    let name = file_name(path);
    DOC_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn is_test_only(path: &str) -> bool {
    path.starts_with("tests/") || path.contains("/tests/")
}

/// True when an asymmetry in `path` is expected and must not be reported,
/// regardless of which artifact it appeared in.
fn is_excluded(path: &str) -> bool {
    is_vcs_ignore(path) || is_doc_file(path) || is_test_only(path)
}

/// Exclusions that only make sense for the sdist side: files packaging
/// intentionally leaves out of wheels.
fn is_sdist_only_noise(path: &str) -> bool {
    NON_PACKAGE_SUFFIXES.iter().any(|s| path.ends_with(s))
}

/// Compare one wheel/sdist pair. Output order is deterministic regardless
/// of archive listing order.
pub fn compare_pair(
    package: &str,
    version: &str,
    wheel_path: &Path,
    sdist_path: &Path,
) -> Result<PackageComparison> {
    let wheel_files = wheel_entries(wheel_path)?;
    let sdist_files = sdist_entries(sdist_path)?;

    let sdist_normalized: BTreeSet<String> = sdist_files
        .iter()
        .map(|p| normalize_sdist_path(p).to_string())
        .collect();

    let mut discrepancies = Vec::new();
    for path in wheel_files.iter() {
        if sdist_normalized.contains(path) || is_excluded(path) {
            continue;
        }
        discrepancies.push(Discrepancy {
            package: package.to_string(),
            path: path.clone(),
            present_in: ArtifactKind::Wheel,
        });
    }
    for path in sdist_normalized.iter() {
        if wheel_files.contains(path) || is_excluded(path) || is_sdist_only_noise(path) {
            continue;
        }
        discrepancies.push(Discrepancy {
            package: package.to_string(),
            path: path.clone(),
            present_in: ArtifactKind::Sdist,
        });
    }

    Ok(PackageComparison {
        package: package.to_string(),
        version: version.to_string(),
        wheel_file_count: wheel_files.len(),
        sdist_file_count: sdist_files.len(),
        discrepancies,
    })
}

/// Wheel filename: `{name}-{version}-{python}-{abi}-{platform}.whl`.
fn parse_wheel_name(file_name: &str) -> Option<(String, String)> {
    let stem = file_name.strip_suffix(".whl")?;
    let mut parts = stem.split('-');
    let name = parts.next()?.to_string();
    let version = parts.next()?.to_string();
    Some((name, version))
}

/// Compare every wheel in `dist_dir` against its sibling sdist.
pub fn compare_dist_dir(dist_dir: &Path) -> Result<ComparisonReport> {
    let mut wheels: Vec<(String, String, std::path::PathBuf)> = Vec::new();
    for entry in fs::read_dir(dist_dir)
        .with_context(|| format!("failed to read dist dir {}", dist_dir.display()))?
    {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        if let Some((name, version)) = parse_wheel_name(&file_name) {
            wheels.push((name, version, entry.path()));
        }
    }
    wheels.sort();

    let mut report = ComparisonReport::default();
    for (name, version, wheel_path) in wheels {
        let sdist_path = dist_dir.join(format!("{name}-{version}.tar.gz"));
        if !sdist_path.exists() {
            report.unpaired.push(format!("{name}-{version}"));
            continue;
        }
        report
            .packages
            .push(compare_pair(&name, &version, &wheel_path, &sdist_path)?);
    }
    Ok(report)
}
