//! Tier-ordered release driver.
//!
//! Walks a [`ReleasePlan`] and hands each eligible package to the external
//! release tool, which performs version bump, tag, build and upload as one
//! transaction in the package checkout. Unlike validation dispatch, this is
//! fail-fast: a half-finished release can break every dependent package, so
//! the batch halts on the first failure unless `keep_going` is set.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::changelog::ReleasePlan;
use crate::config::Layout;
use crate::dispatch::Reporter;
use crate::events::EventLog;
use crate::process::{self, CommandSpec};
use crate::registry::{Package, Registry};
use crate::types::{EventType, RunEvent};

/// Commands of the external release tool. `full` performs the whole
/// transaction including upload; the three-step sequence skips the publish.
const FULL_RELEASE: &str = "fullrelease";
const PRE_RELEASE: &str = "prerelease";
const TAG_RELEASE: &str = "release";
const POST_RELEASE: &str = "postrelease";

/// Abstraction over the per-package release transaction so the driver is
/// testable without shelling out.
pub trait ReleaseTool {
    fn release_package(&self, package: &Package, package_dir: &Path, no_upload: bool)
    -> Result<()>;
}

/// Shells out to the zest-style release commands in the package checkout.
#[derive(Debug, Clone)]
pub struct ExternalReleaseTool {
    pub timeout: Duration,
}

impl ExternalReleaseTool {
    fn run_step(&self, command: &str, package_dir: &Path) -> Result<()> {
        let spec = CommandSpec::new(command)
            .arg("--no-input")
            .cwd(package_dir)
            .timeout(self.timeout);
        let out = process::run(&spec)?;
        if !out.success() {
            bail!(
                "{} failed (exit {}): {}",
                command,
                out.exit_code,
                out.stderr.trim()
            );
        }
        Ok(())
    }
}

impl ReleaseTool for ExternalReleaseTool {
    fn release_package(
        &self,
        _package: &Package,
        package_dir: &Path,
        no_upload: bool,
    ) -> Result<()> {
        if !no_upload {
            return self.run_step(FULL_RELEASE, package_dir);
        }
        // Bump, tag and re-bump locally, but never publish.
        self.run_step(PRE_RELEASE, package_dir)?;
        self.run_step(TAG_RELEASE, package_dir)?;
        self.run_step(POST_RELEASE, package_dir)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReleaseOptions {
    pub dry_run: bool,
    pub no_upload: bool,
    /// Continue past a failed package. Off by default.
    pub keep_going: bool,
    /// Restrict to these packages (applied before iteration).
    pub only: Option<BTreeSet<String>>,
    /// Exclude these packages (applied before iteration).
    pub skip: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReleaseStatus {
    Released,
    DryRun,
    Skipped { reason: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub package: String,
    pub version: Option<String>,
    pub tier: u32,
    pub status: ReleaseStatus,
    pub finished_at: chrono::DateTime<Utc>,
}

impl ReleaseResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, ReleaseStatus::Released | ReleaseStatus::DryRun)
    }
}

/// Run the release plan in tier order.
///
/// Include/skip filters are applied to the plan before iteration starts, so
/// a filtered-out package never affects halt decisions.
pub fn run_release(
    plan: &ReleasePlan,
    registry: &Registry,
    layout: &Layout,
    tool: &dyn ReleaseTool,
    opts: &ReleaseOptions,
    reporter: &mut dyn Reporter,
    event_log: &mut EventLog,
    events_path: &Path,
) -> Result<Vec<ReleaseResult>> {
    let selected: Vec<(&crate::changelog::PlannedRelease, &Package)> = plan
        .packages()
        .filter(|p| {
            opts.only
                .as_ref()
                .map(|only| only.contains(&p.name))
                .unwrap_or(true)
                && !opts.skip.contains(&p.name)
        })
        .filter_map(|p| registry.get(&p.name).map(|pkg| (p, pkg)))
        .collect();

    event_log.record(RunEvent {
        timestamp: Utc::now(),
        event_type: EventType::ReleaseStarted {
            plan_id: plan.plan_id.clone(),
            package_count: selected.len(),
        },
        package: "all".to_string(),
    });
    let _ = event_log.write_to_file(events_path);
    event_log.clear();

    let mut results: Vec<ReleaseResult> = Vec::with_capacity(selected.len());
    let mut halted: Option<String> = None;

    for (planned, package) in selected {
        let version = planned.version.clone();

        if let Some(failed_package) = &halted {
            results.push(ReleaseResult {
                package: package.name.clone(),
                version,
                tier: package.tier,
                status: ReleaseStatus::Skipped {
                    reason: format!("halted after {failed_package} failed"),
                },
                finished_at: Utc::now(),
            });
            continue;
        }

        if opts.dry_run {
            reporter.info(&format!(
                "[dry-run] would release {} ({})",
                package.name,
                version.as_deref().unwrap_or("?")
            ));
            results.push(ReleaseResult {
                package: package.name.clone(),
                version,
                tier: package.tier,
                status: ReleaseStatus::DryRun,
                finished_at: Utc::now(),
            });
            continue;
        }

        reporter.info(&format!(
            "releasing {} ({})...",
            package.name,
            version.as_deref().unwrap_or("?")
        ));

        let package_dir = layout.package_dir(package);
        match tool.release_package(package, &package_dir, opts.no_upload) {
            Ok(()) => {
                reporter.info(&format!("{}: released", package.name));
                event_log.record(RunEvent {
                    timestamp: Utc::now(),
                    event_type: EventType::PackageReleased {
                        version: version.clone().unwrap_or_default(),
                    },
                    package: package.name.clone(),
                });
                results.push(ReleaseResult {
                    package: package.name.clone(),
                    version,
                    tier: package.tier,
                    status: ReleaseStatus::Released,
                    finished_at: Utc::now(),
                });
            }
            Err(e) => {
                let message = format!("{e:#}");
                reporter.error(&format!("{}: release FAILED: {message}", package.name));
                event_log.record(RunEvent {
                    timestamp: Utc::now(),
                    event_type: EventType::PackageReleaseFailed {
                        message: message.clone(),
                    },
                    package: package.name.clone(),
                });
                results.push(ReleaseResult {
                    package: package.name.clone(),
                    version,
                    tier: package.tier,
                    status: ReleaseStatus::Failed { message },
                    finished_at: Utc::now(),
                });
                if !opts.keep_going {
                    halted = Some(package.name.clone());
                }
            }
        }
        let _ = event_log.write_to_file(events_path);
        event_log.clear();
    }

    let released = results.iter().filter(|r| r.succeeded()).count();
    let failed = results
        .iter()
        .filter(|r| matches!(r.status, ReleaseStatus::Failed { .. }))
        .count();
    event_log.record(RunEvent {
        timestamp: Utc::now(),
        event_type: EventType::ReleaseFinished { released, failed },
        package: "all".to_string(),
    });
    let _ = event_log.write_to_file(events_path);
    event_log.clear();

    Ok(results)
}

/// Render the post-release summary.
pub fn summarize(results: &[ReleaseResult], reporter: &mut dyn Reporter) {
    let released = results.iter().filter(|r| r.succeeded()).count();
    let failed: Vec<&ReleaseResult> = results
        .iter()
        .filter(|r| matches!(r.status, ReleaseStatus::Failed { .. }))
        .collect();
    let skipped = results
        .iter()
        .filter(|r| matches!(r.status, ReleaseStatus::Skipped { .. }))
        .count();

    reporter.info(&format!(
        "release summary: {released} released, {} failed, {skipped} skipped",
        failed.len()
    ));
    for result in failed {
        reporter.error(&format!("  {} failed", result.package));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{Eligibility, build_plan};
    use crate::config::Config;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"
tiers = ["base", "node", "app"]

[[package]]
name = "odict"
tier = 0

[[package]]
name = "plumber"
tier = 0

[[package]]
name = "node"
tier = 1

[[package]]
name = "cone.app"
tier = 2
"#;

    #[derive(Default)]
    struct CollectingReporter {
        infos: Vec<String>,
        errors: Vec<String>,
    }

    impl Reporter for CollectingReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }
        fn warn(&mut self, _msg: &str) {}
        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    /// Records release order and fails on demand.
    #[derive(Default)]
    struct MockTool {
        fail: BTreeSet<String>,
        invoked: Mutex<Vec<String>>,
    }

    impl MockTool {
        fn failing(names: &[&str]) -> Self {
            Self {
                fail: names.iter().map(|s| s.to_string()).collect(),
                invoked: Mutex::new(Vec::new()),
            }
        }

        fn invocations(&self) -> Vec<String> {
            self.invoked.lock().expect("lock").clone()
        }
    }

    impl ReleaseTool for MockTool {
        fn release_package(
            &self,
            package: &Package,
            _package_dir: &Path,
            _no_upload: bool,
        ) -> Result<()> {
            self.invoked.lock().expect("lock").push(package.name.clone());
            if self.fail.contains(&package.name) {
                bail!("tag already exists");
            }
            Ok(())
        }
    }

    struct Fixture {
        registry: Registry,
        layout: Layout,
        plan: ReleasePlan,
        _td: tempfile::TempDir,
        events_path: std::path::PathBuf,
    }

    fn fixture(eligible: &[&str]) -> Fixture {
        let td = tempdir().expect("tempdir");
        let registry = Registry::from_manifest_str(MANIFEST).expect("registry");
        let config = Config::default();
        let layout = Layout::new(td.path(), &config.layout);

        let eligibilities: Vec<Eligibility> = registry
            .packages()
            .iter()
            .map(|p| Eligibility {
                package: p.name.clone(),
                eligible: eligible.contains(&p.name.as_str()),
                version: Some("1.0.0".to_string()),
                reason: String::new(),
            })
            .collect();
        let plan = build_plan(&registry, &eligibilities);
        let events_path = td.path().join("events.jsonl");

        Fixture {
            registry,
            layout,
            plan,
            _td: td,
            events_path,
        }
    }

    fn drive(fx: &Fixture, tool: &MockTool, opts: &ReleaseOptions) -> Vec<ReleaseResult> {
        let mut reporter = CollectingReporter::default();
        let mut event_log = EventLog::new();
        run_release(
            &fx.plan,
            &fx.registry,
            &fx.layout,
            tool,
            opts,
            &mut reporter,
            &mut event_log,
            &fx.events_path,
        )
        .expect("release")
    }

    #[test]
    fn releases_follow_tier_order() {
        let fx = fixture(&["cone.app", "odict", "node"]);
        let tool = MockTool::default();

        let results = drive(&fx, &tool, &ReleaseOptions::default());
        assert_eq!(tool.invocations(), vec!["odict", "node", "cone.app"]);

        // Lower tiers complete before higher tiers begin.
        let position = |name: &str| {
            results
                .iter()
                .position(|r| r.package == name)
                .expect("present")
        };
        assert!(position("odict") < position("node"));
        assert!(position("node") < position("cone.app"));
        for window in results.windows(2) {
            assert!(
                window[0].finished_at <= window[1].finished_at,
                "release timestamps out of order"
            );
        }
    }

    #[test]
    fn failure_halts_remaining_tiers_by_default() {
        let fx = fixture(&["odict", "node", "cone.app"]);
        let tool = MockTool::failing(&["node"]);

        let results = drive(&fx, &tool, &ReleaseOptions::default());
        assert_eq!(tool.invocations(), vec!["odict", "node"]);

        let by_name = |name: &str| {
            results
                .iter()
                .find(|r| r.package == name)
                .expect("present")
                .status
                .clone()
        };
        assert_eq!(by_name("odict"), ReleaseStatus::Released);
        assert!(matches!(by_name("node"), ReleaseStatus::Failed { .. }));
        assert!(matches!(
            by_name("cone.app"),
            ReleaseStatus::Skipped { reason } if reason.contains("node")
        ));
    }

    #[test]
    fn keep_going_continues_past_failures() {
        let fx = fixture(&["odict", "node", "cone.app"]);
        let tool = MockTool::failing(&["node"]);

        let opts = ReleaseOptions {
            keep_going: true,
            ..Default::default()
        };
        let results = drive(&fx, &tool, &opts);
        assert_eq!(tool.invocations(), vec!["odict", "node", "cone.app"]);
        assert!(results.iter().any(|r| r.package == "cone.app" && r.succeeded()));
    }

    #[test]
    fn only_and_skip_filters_apply_before_iteration() {
        let fx = fixture(&["odict", "plumber", "node"]);
        let tool = MockTool::default();

        let opts = ReleaseOptions {
            only: Some(BTreeSet::from(["odict".to_string(), "node".to_string()])),
            skip: BTreeSet::from(["node".to_string()]),
            ..Default::default()
        };
        let results = drive(&fx, &tool, &opts);
        assert_eq!(tool.invocations(), vec!["odict"]);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn dry_run_never_invokes_the_tool() {
        let fx = fixture(&["odict", "node"]);
        let tool = MockTool::default();

        let opts = ReleaseOptions {
            dry_run: true,
            ..Default::default()
        };
        let results = drive(&fx, &tool, &opts);
        assert!(tool.invocations().is_empty());
        assert!(results.iter().all(|r| r.status == ReleaseStatus::DryRun));
    }

    #[test]
    fn summary_counts_each_status() {
        let fx = fixture(&["odict", "node", "cone.app"]);
        let tool = MockTool::failing(&["node"]);
        let results = drive(&fx, &tool, &ReleaseOptions::default());

        let mut reporter = CollectingReporter::default();
        summarize(&results, &mut reporter);
        assert!(
            reporter
                .infos
                .iter()
                .any(|m| m.contains("1 released, 1 failed, 1 skipped")),
            "{:?}",
            reporter.infos
        );
    }
}
