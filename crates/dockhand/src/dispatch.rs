//! Fail-soft parallel fan-out across a package set.
//!
//! The dispatcher partitions the requested set into a parallel subset and a
//! sequential-only subset. Parallel packages run on independent threads
//! (each thread shells out to its own toolchain processes), bounded by
//! `max_concurrent`. The sequential subset runs afterwards, one at a time
//! in registry order, because a single slapd test instance cannot serve two
//! concurrent suites. One package's failure never cancels or blocks another
//! unit; the batch verdict is computed only after every unit finished.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Result, anyhow};
use chrono::Utc;

use crate::events::EventLog;
use crate::executor::PhaseRunner;
use crate::pipeline;
use crate::registry::Package;
use crate::types::{BatchReport, EventType, Mode, PackageRunReport, RunEvent, compute_batch_id};

/// Progress sink for operator-facing messages.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);

    /// Per-package completion marker, emitted in real time as units finish.
    /// The default rendering goes through `info`/`error`; interactive
    /// frontends override this to drive a progress display.
    fn package_finished(&mut self, package: &str, failure: Option<&crate::types::PhaseOutcome>) {
        match failure {
            None => self.info(&format!("{package}: ok")),
            Some(outcome) => self.error(&format!(
                "{package}: FAILED in {} phase (log: {})",
                outcome.phase,
                outcome
                    .log_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string()),
            )),
        }
    }
}

/// Reporter that swallows everything; used by tests and `--quiet` paths.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub mode: Mode,
    pub max_concurrent: usize,
}

fn run_unit(
    runner: &Arc<dyn PhaseRunner>,
    package: &Package,
    mode: Mode,
    reporter: &Arc<Mutex<dyn Reporter + Send>>,
    event_log: &Arc<Mutex<EventLog>>,
    events_path: &Path,
) -> PackageRunReport {
    let report = pipeline::run_package(runner.as_ref(), package, mode);

    // Real-time per-package marker as units complete.
    {
        let mut rep = reporter.lock().expect("reporter lock");
        rep.package_finished(&package.name, report.first_failure());
    }

    {
        let mut log = event_log.lock().expect("event log lock");
        for outcome in &report.outcomes {
            log.record(RunEvent {
                timestamp: outcome.finished_at,
                event_type: EventType::PhaseFinished {
                    phase: outcome.phase,
                    passed: !outcome.status.is_failure(),
                    message: match &outcome.status {
                        crate::types::PhaseStatus::Failed { message, .. } => {
                            Some(message.clone())
                        }
                        _ => None,
                    },
                },
                package: package.name.clone(),
            });
        }
        log.record(RunEvent {
            timestamp: Utc::now(),
            event_type: EventType::PackageFinished {
                failed: report.failed(),
            },
            package: package.name.clone(),
        });
        let _ = log.write_to_file(events_path);
        log.clear();
    }

    report
}

/// Fan a phase chain out across `packages`, collecting every unit's report.
///
/// Returns an error only for harness-level problems (a panicked worker);
/// per-package failures are data in the [`BatchReport`].
pub fn dispatch(
    packages: &[Package],
    runner: Arc<dyn PhaseRunner>,
    opts: &DispatchOptions,
    reporter: Arc<Mutex<dyn Reporter + Send>>,
    event_log: Arc<Mutex<EventLog>>,
    events_path: &Path,
) -> Result<BatchReport> {
    let started_at = Utc::now();
    let names: Vec<String> = packages.iter().map(|p| p.name.clone()).collect();
    let batch_id = compute_batch_id(opts.mode, &names);

    {
        let mut log = event_log.lock().expect("event log lock");
        log.record(RunEvent {
            timestamp: started_at,
            event_type: EventType::BatchStarted {
                batch_id: batch_id.clone(),
                mode: opts.mode,
                package_count: packages.len(),
            },
            package: "all".to_string(),
        });
        let _ = log.write_to_file(events_path);
        log.clear();
    }

    let (parallel, sequential): (Vec<&Package>, Vec<&Package>) =
        packages.iter().partition(|p| !p.sequential);

    reporter.lock().expect("reporter lock").info(&format!(
        "dispatching {} packages ({} parallel, {} sequential, max concurrent: {})",
        packages.len(),
        parallel.len(),
        sequential.len(),
        opts.max_concurrent.max(1),
    ));

    let mut reports: Vec<PackageRunReport> = Vec::with_capacity(packages.len());

    // Parallel subset: no ordering guarantee, chunked by max_concurrent.
    for chunk in parallel.chunks(opts.max_concurrent.max(1)) {
        let mut handles: Vec<thread::JoinHandle<PackageRunReport>> = Vec::new();
        for p in chunk {
            let package = (*p).clone();
            let runner = Arc::clone(&runner);
            let reporter = Arc::clone(&reporter);
            let event_log = Arc::clone(&event_log);
            let events_path = events_path.to_path_buf();
            let mode = opts.mode;

            handles.push(thread::spawn(move || {
                run_unit(&runner, &package, mode, &reporter, &event_log, &events_path)
            }));
        }
        // Wait for every unit; a failing unit only contributes its report.
        for handle in handles {
            let report = handle
                .join()
                .map_err(|_| anyhow!("validation worker panicked"))?;
            reports.push(report);
        }
    }

    // Sequential subset: strictly one at a time, in registry order.
    for p in sequential {
        reports.push(run_unit(
            &runner,
            p,
            opts.mode,
            &reporter,
            &event_log,
            events_path,
        ));
    }

    let failed = reports
        .iter()
        .filter(|r| r.failed())
        .map(|r| r.package.clone())
        .collect();

    let report = BatchReport {
        batch_id,
        mode: opts.mode,
        started_at,
        finished_at: Utc::now(),
        packages: reports,
        failed,
    };

    {
        let mut log = event_log.lock().expect("event log lock");
        log.record(RunEvent {
            timestamp: report.finished_at,
            event_type: EventType::BatchFinished {
                total: report.total(),
                failed: report.failed_count(),
            },
            package: "all".to_string(),
        });
        let _ = log.write_to_file(events_path);
        log.clear();
    }

    Ok(report)
}

/// Render the post-batch summary through the reporter.
pub fn summarize(report: &BatchReport, reporter: &mut dyn Reporter) {
    if report.is_clean() {
        reporter.info(&format!(
            "batch ok: {} packages validated",
            report.total()
        ));
        return;
    }
    reporter.error(&format!(
        "batch FAILED: {} of {} packages failed",
        report.failed_count(),
        report.total()
    ));
    for package in &report.failed {
        let log = report
            .packages
            .iter()
            .find(|p| &p.package == package)
            .and_then(|p| p.first_failure())
            .and_then(|o| o.log_path.as_ref())
            .map(|p| p.display().to_string());
        match log {
            Some(log) => reporter.error(&format!("  {package} (log: {log})")),
            None => reporter.error(&format!("  {package}")),
        }
    }
}
