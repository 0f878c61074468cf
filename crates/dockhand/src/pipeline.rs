//! Phase chain composition.
//!
//! A mode selects which phases run for a package. `all` walks the full
//! chain and stops at the first failure for that package only; packages
//! without a runnable test suite get the reduced chain. Single-phase modes
//! exist so one phase of one package can be re-run while debugging.

use crate::executor::PhaseRunner;
use crate::registry::Package;
use crate::types::{Mode, PackageRunReport, Phase};

/// Phases the given mode runs for the given package.
pub fn chain_for(package: &Package, mode: Mode) -> Vec<Phase> {
    match mode {
        Mode::All => {
            if package.skip_tests {
                vec![Phase::Env, Phase::Build, Phase::Check, Phase::Clean]
            } else {
                vec![Phase::Env, Phase::Build, Phase::Check, Phase::Test, Phase::Clean]
            }
        }
        Mode::Env => vec![Phase::Env],
        Mode::Build => vec![Phase::Build],
        Mode::Check => vec![Phase::Check],
        Mode::Test | Mode::TestSdist => {
            if package.skip_tests {
                vec![]
            } else {
                vec![Phase::Test]
            }
        }
        Mode::Clean => vec![Phase::Clean],
    }
}

/// Drive one package through its chain, short-circuiting the remaining
/// phases on the first failure. Other packages are unaffected; the caller
/// decides what to do with the report.
pub fn run_package(runner: &dyn PhaseRunner, package: &Package, mode: Mode) -> PackageRunReport {
    let mut outcomes = Vec::new();
    for phase in chain_for(package, mode) {
        let outcome = runner.run_phase(package, phase);
        let failed = outcome.status.is_failure();
        outcomes.push(outcome);
        if failed {
            break;
        }
    }
    PackageRunReport {
        package: package.name.clone(),
        outcomes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureKind, PhaseOutcome, PhaseStatus};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn package(name: &str, skip_tests: bool) -> Package {
        Package {
            name: name.to_string(),
            path: PathBuf::from("sources").join(name),
            tier: 0,
            skip_tests,
            sequential: false,
        }
    }

    /// Deterministic runner: fails the configured (package, phase) pairs
    /// and records every invocation.
    struct MockRunner {
        fail: BTreeSet<(String, Phase)>,
        invoked: Mutex<Vec<(String, Phase)>>,
    }

    impl MockRunner {
        fn new(fail: &[(&str, Phase)]) -> Self {
            Self {
                fail: fail
                    .iter()
                    .map(|(name, phase)| (name.to_string(), *phase))
                    .collect(),
                invoked: Mutex::new(Vec::new()),
            }
        }

        fn invocations(&self) -> Vec<(String, Phase)> {
            self.invoked.lock().expect("lock").clone()
        }
    }

    impl PhaseRunner for MockRunner {
        fn run_phase(&self, package: &Package, phase: Phase) -> PhaseOutcome {
            self.invoked
                .lock()
                .expect("lock")
                .push((package.name.clone(), phase));
            let key = (package.name.clone(), phase);
            let status = if self.fail.contains(&key) {
                PhaseStatus::Failed {
                    kind: FailureKind::Tool,
                    message: format!("{phase} failed"),
                }
            } else {
                PhaseStatus::Passed
            };
            PhaseOutcome {
                package: package.name.clone(),
                phase,
                status,
                log_path: None,
                started_at: Utc::now(),
                finished_at: Utc::now(),
                duration_ms: 0,
            }
        }
    }

    #[test]
    fn full_chain_covers_all_phases_in_order() {
        let pkg = package("node", false);
        assert_eq!(
            chain_for(&pkg, Mode::All),
            vec![Phase::Env, Phase::Build, Phase::Check, Phase::Test, Phase::Clean]
        );
    }

    #[test]
    fn skip_tests_packages_get_the_reduced_chain() {
        let pkg = package("treibstoff", true);
        let chain = chain_for(&pkg, Mode::All);
        assert!(!chain.contains(&Phase::Test));
        assert_eq!(
            chain,
            vec![Phase::Env, Phase::Build, Phase::Check, Phase::Clean]
        );
    }

    #[test]
    fn skip_tests_package_records_no_test_outcome() {
        let pkg = package("treibstoff", true);
        let runner = MockRunner::new(&[]);

        let report = run_package(&runner, &pkg, Mode::All);
        assert!(!report.failed());
        assert!(report.outcome_for(Phase::Test).is_none());
        assert!(
            !runner
                .invocations()
                .iter()
                .any(|(_, phase)| *phase == Phase::Test)
        );
    }

    #[test]
    fn single_phase_mode_runs_exactly_that_phase() {
        let pkg = package("node", false);
        let runner = MockRunner::new(&[]);

        let report = run_package(&runner, &pkg, Mode::Build);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].phase, Phase::Build);
    }

    #[test]
    fn first_failure_short_circuits_remaining_phases() {
        let pkg = package("node", false);
        let runner = MockRunner::new(&[("node", Phase::Build)]);

        let report = run_package(&runner, &pkg, Mode::All);
        assert!(report.failed());
        assert_eq!(report.first_failure().map(|o| o.phase), Some(Phase::Build));
        // env ran, build failed, nothing after.
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcome_for(Phase::Check).is_none());
        assert!(report.outcome_for(Phase::Clean).is_none());
    }

    #[test]
    fn each_phase_appears_at_most_once_per_run() {
        let pkg = package("node", false);
        let runner = MockRunner::new(&[]);

        let report = run_package(&runner, &pkg, Mode::All);
        let mut seen = BTreeSet::new();
        for outcome in &report.outcomes {
            assert!(seen.insert(outcome.phase), "duplicate {}", outcome.phase);
        }
    }
}
