//! Batch report persistence.
//!
//! Reports are advisory artifacts: the exit code is computed from the
//! in-memory report, and the JSON copy exists so CI and operators can
//! inspect a finished batch. Writes go through a temp file and rename so a
//! concurrent reader never sees a torn report.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::types::BatchReport;

pub const REPORT_FILE: &str = "report.json";

pub fn report_path(state_dir: &Path) -> PathBuf {
    state_dir.join(REPORT_FILE)
}

pub fn write_report(state_dir: &Path, report: &BatchReport) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
    atomic_write_json(&report_path(state_dir), report)
}

pub fn load_report(state_dir: &Path) -> Result<Option<BatchReport>> {
    let path = report_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read report {}", path.display()))?;
    let report: BatchReport = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse report JSON {}", path.display()))?;
    Ok(Some(report))
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &data)
        .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}
