//! Single-phase execution for one package.
//!
//! Each phase shells out to the packaging toolchain inside the package's
//! isolated environment and reports a [`PhaseOutcome`]. Phases never mutate
//! the source checkout; everything they produce lands in the venv, the
//! package-local dist dir, the shared artifact store, or a log file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use regex::Regex;

use crate::config::Layout;
use crate::process::{self, CommandOutput, CommandSpec};
use crate::registry::Package;
use crate::store::ArtifactStore;
use crate::types::{ArtifactKind, FailureKind, InstallSource, Phase, PhaseOutcome, PhaseStatus};

/// Tools installed into every validation environment.
const ENV_TOOLS: &[&str] = &["build", "pyroma", "twine"];

/// Runs one phase for one package. Implemented by [`Executor`] for real
/// runs and by mocks in pipeline/dispatch tests.
pub trait PhaseRunner: Send + Sync {
    fn run_phase(&self, package: &Package, phase: Phase) -> PhaseOutcome;
}

/// Runtime knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Interpreter used to create environments.
    pub python: String,
    pub pyroma_threshold: u32,
    /// Deadline applied to each external tool invocation within a phase.
    pub phase_timeout: Duration,
    pub install_from: InstallSource,
    /// Recreate the environment even if it already exists.
    pub force_env: bool,
    pub keep_env: bool,
    pub keep_dist: bool,
    /// Label for the per-batch log directory.
    pub batch_id: String,
    /// Variables injected into every test invocation.
    pub test_env: Vec<(String, String)>,
}

pub struct Executor {
    layout: Layout,
    store: Arc<dyn ArtifactStore>,
    opts: ExecutorOptions,
}

impl Executor {
    pub fn new(layout: Layout, store: Arc<dyn ArtifactStore>, opts: ExecutorOptions) -> Self {
        Self {
            layout,
            store,
            opts,
        }
    }

    fn log_path(&self, package: &Package, phase: Phase) -> PathBuf {
        self.layout
            .phase_log_path(&self.opts.batch_id, &package.name, phase.as_str())
    }

    /// Run a command, mirroring its output into the phase log.
    fn run_logged(&self, spec: CommandSpec, log: &Path) -> Result<CommandOutput> {
        let spec = spec.timeout(self.opts.phase_timeout);
        let output = process::run(&spec)?;
        let _ = process::append_log(log, &spec, &output);
        Ok(output)
    }

    fn failure_for(output: &CommandOutput, message: String) -> PhaseStatus {
        let kind = if output.timed_out {
            FailureKind::Timeout
        } else {
            FailureKind::Tool
        };
        PhaseStatus::Failed {
            kind,
            message,
        }
    }

    fn setup_failure(message: impl Into<String>) -> PhaseStatus {
        PhaseStatus::Failed {
            kind: FailureKind::Setup,
            message: message.into(),
        }
    }

    fn phase_env(&self, package: &Package, log: &Path) -> PhaseStatus {
        let package_dir = self.layout.package_dir(package);
        if !package_dir.exists() {
            return Self::setup_failure(format!(
                "package directory not found: {}",
                package_dir.display()
            ));
        }
        if !package_dir.join("pyproject.toml").exists() {
            return Self::setup_failure(format!(
                "pyproject.toml not found in {}",
                package_dir.display()
            ));
        }

        let venv = self.layout.venv_dir(package);
        if venv.exists() {
            if !self.opts.force_env {
                note(log, "environment already present; nothing to do");
                return PhaseStatus::Passed;
            }
            if let Err(e) = fs::remove_dir_all(&venv) {
                return Self::setup_failure(format!(
                    "failed to remove existing environment {}: {e}",
                    venv.display()
                ));
            }
        }

        let create = CommandSpec::new(&self.opts.python)
            .arg("-m")
            .arg("venv")
            .arg(venv.display().to_string());
        match self.run_logged(create, log) {
            Ok(out) if out.success() => {}
            Ok(out) => return Self::failure_for(&out, "failed to create environment".into()),
            Err(e) => return Self::setup_failure(format!("{e:#}")),
        }

        let venv_python = self.layout.venv_python(package);
        if !venv_python.exists() {
            return Self::setup_failure(format!(
                "environment python not found: {}",
                venv_python.display()
            ));
        }

        let upgrade = CommandSpec::new(venv_python.display().to_string())
            .args(["-m", "pip", "install", "--upgrade", "pip"]);
        match self.run_logged(upgrade, log) {
            Ok(out) if out.success() => {}
            Ok(out) => return Self::failure_for(&out, "failed to upgrade pip".into()),
            Err(e) => return Self::setup_failure(format!("{e:#}")),
        }

        let install = CommandSpec::new(venv_python.display().to_string())
            .args(["-m", "pip", "install"])
            .args(ENV_TOOLS.iter().copied());
        match self.run_logged(install, log) {
            Ok(out) if out.success() => PhaseStatus::Passed,
            Ok(out) => Self::failure_for(&out, "failed to install validation tools".into()),
            Err(e) => Self::setup_failure(format!("{e:#}")),
        }
    }

    fn phase_build(&self, package: &Package, log: &Path) -> PhaseStatus {
        let venv_python = self.layout.venv_python(package);
        if !venv_python.exists() {
            return Self::setup_failure("environment not found; run the env phase first");
        }

        let package_dir = self.layout.package_dir(package);
        let dist_dir = self.layout.package_dist_dir(package);
        if dist_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dist_dir) {
                return Self::setup_failure(format!(
                    "failed to clear previous dist {}: {e}",
                    dist_dir.display()
                ));
            }
        }

        let build = CommandSpec::new(venv_python.display().to_string())
            .args(["-m", "build"])
            .arg(package_dir.display().to_string());
        match self.run_logged(build, log) {
            Ok(out) if out.success() => {}
            Ok(out) => return Self::failure_for(&out, "build failed".into()),
            Err(e) => return Self::setup_failure(format!("{e:#}")),
        }

        let wheel = match find_artifact(&dist_dir, ".whl") {
            Some(path) => path,
            None => {
                return PhaseStatus::Failed {
                    kind: FailureKind::Tool,
                    message: "build succeeded but no wheel found".into(),
                };
            }
        };
        let sdist = match find_artifact(&dist_dir, ".tar.gz") {
            Some(path) => path,
            None => {
                return PhaseStatus::Failed {
                    kind: FailureKind::Tool,
                    message: "build succeeded but no sdist found".into(),
                };
            }
        };

        for (kind, path) in [(ArtifactKind::Wheel, &wheel), (ArtifactKind::Sdist, &sdist)] {
            if let Err(e) = self.store.put(&package.name, kind, path) {
                return PhaseStatus::Failed {
                    kind: FailureKind::Tool,
                    message: format!("failed to publish {kind} to artifact store: {e:#}"),
                };
            }
        }
        note(
            log,
            &format!(
                "published {} and {} to {}",
                wheel.file_name().unwrap_or_default().to_string_lossy(),
                sdist.file_name().unwrap_or_default().to_string_lossy(),
                self.store.index_dir().display()
            ),
        );
        PhaseStatus::Passed
    }

    fn phase_check(&self, package: &Package, log: &Path) -> PhaseStatus {
        let venv_python = self.layout.venv_python(package);
        if !venv_python.exists() {
            return Self::setup_failure("environment not found; run the env phase first");
        }
        let package_dir = self.layout.package_dir(package);
        let dist_dir = self.layout.package_dist_dir(package);
        if !dist_dir.exists() {
            return Self::setup_failure("dist directory not found; run the build phase first");
        }

        let mut artifacts: Vec<String> = Vec::new();
        if let Ok(entries) = fs::read_dir(&dist_dir) {
            for entry in entries.flatten() {
                artifacts.push(entry.path().display().to_string());
            }
        }
        artifacts.sort();
        if artifacts.is_empty() {
            return Self::setup_failure("dist directory is empty; run the build phase first");
        }

        let twine = CommandSpec::new(venv_python.display().to_string())
            .args(["-m", "twine", "check"])
            .args(artifacts)
            .cwd(&package_dir);
        match self.run_logged(twine, log) {
            Ok(out) if out.success() => {}
            Ok(out) => return Self::failure_for(&out, "metadata check failed (twine)".into()),
            Err(e) => return Self::setup_failure(format!("{e:#}")),
        }

        let pyroma = CommandSpec::new(venv_python.display().to_string())
            .args(["-m", "pyroma", "."])
            .cwd(&package_dir);
        let out = match self.run_logged(pyroma, log) {
            Ok(out) => out,
            Err(e) => return Self::setup_failure(format!("{e:#}")),
        };

        match parse_pyroma_score(&out.combined()) {
            Some(score) if score < self.opts.pyroma_threshold => PhaseStatus::Failed {
                kind: FailureKind::Tool,
                message: format!(
                    "pyroma score {score} below threshold {}",
                    self.opts.pyroma_threshold
                ),
            },
            Some(_) => PhaseStatus::Passed,
            None if !out.success() => Self::failure_for(&out, "quality check failed (pyroma)".into()),
            None => {
                note(log, "pyroma score not parsed; accepting");
                PhaseStatus::Passed
            }
        }
    }

    fn phase_test(&self, package: &Package, log: &Path) -> PhaseStatus {
        let venv_python = self.layout.venv_python(package);
        if !venv_python.exists() {
            return Self::setup_failure("environment not found; run the env phase first");
        }

        let kind = match self.opts.install_from {
            InstallSource::Wheel => ArtifactKind::Wheel,
            InstallSource::Sdist => ArtifactKind::Sdist,
        };
        match self.store.get(&package.name, kind) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Self::setup_failure(format!(
                    "no {kind} for {} in artifact store; run the build phase first",
                    package.name
                ));
            }
            Err(e) => return Self::setup_failure(format!("{e:#}")),
        }

        // Install the released artifact, never the source checkout.
        let mut install = CommandSpec::new(venv_python.display().to_string())
            .args(["-m", "pip", "install"])
            .arg("--find-links")
            .arg(self.store.index_dir().display().to_string())
            .args(["--pre", "--upgrade"]);
        if self.opts.install_from == InstallSource::Sdist {
            install = install.arg("--no-binary").arg(&package.name);
        }
        install = install.arg(format!("{}[test]", package.name));
        match self.run_logged(install, log) {
            Ok(out) if out.success() => {}
            Ok(out) => return Self::failure_for(&out, "failed to install package from artifact".into()),
            Err(e) => return Self::setup_failure(format!("{e:#}")),
        }

        // Test discovery stays rooted at the source checkout so test code
        // need not be packaged.
        let package_dir = self.layout.package_dir(package);
        let pytest = CommandSpec::new(venv_python.display().to_string())
            .args(["-m", "pytest", "-v"])
            .cwd(&package_dir)
            .envs(&self.opts.test_env);
        match self.run_logged(pytest, log) {
            Ok(out) if out.success() => PhaseStatus::Passed,
            Ok(out) => Self::failure_for(&out, "tests failed".into()),
            Err(e) => Self::setup_failure(format!("{e:#}")),
        }
    }

    fn phase_clean(&self, package: &Package, log: &Path) -> PhaseStatus {
        let mut cleaned: Vec<&str> = Vec::new();

        if !self.opts.keep_env {
            let venv = self.layout.venv_dir(package);
            if venv.exists() && fs::remove_dir_all(&venv).is_ok() {
                cleaned.push("venv");
            }
        }
        if !self.opts.keep_dist {
            let dist = self.layout.package_dist_dir(package);
            if dist.exists() && fs::remove_dir_all(&dist).is_ok() {
                cleaned.push("dist");
            }
        }

        if cleaned.is_empty() {
            note(log, "nothing to clean");
        } else {
            note(log, &format!("cleaned: {}", cleaned.join(", ")));
        }
        PhaseStatus::Passed
    }
}

impl PhaseRunner for Executor {
    fn run_phase(&self, package: &Package, phase: Phase) -> PhaseOutcome {
        let log = self.log_path(package, phase);
        let started_at = Utc::now();
        let start = std::time::Instant::now();

        let status = match phase {
            Phase::Env => self.phase_env(package, &log),
            Phase::Build => self.phase_build(package, &log),
            Phase::Check => self.phase_check(package, &log),
            Phase::Test => self.phase_test(package, &log),
            Phase::Clean => self.phase_clean(package, &log),
        };

        if let PhaseStatus::Failed { message, .. } = &status {
            note(&log, &format!("phase {phase} failed: {message}"));
        }

        PhaseOutcome {
            package: package.name.clone(),
            phase,
            status,
            log_path: Some(log),
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis(),
        }
    }
}

/// Append a free-form line to the phase log, best-effort.
fn note(log: &Path, message: &str) {
    use std::io::Write;

    if let Some(parent) = log.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(log) {
        let _ = writeln!(file, "{message}");
    }
}

fn find_artifact(dist_dir: &Path, suffix: &str) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = fs::read_dir(dist_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect();
    matches.sort();
    matches.pop()
}

static SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rating:\s*(\d+)\s*/\s*10").expect("score regex"));

/// Extract the `rating: N/10` score from pyroma output.
pub fn parse_pyroma_score(output: &str) -> Option<u32> {
    SCORE.captures(output)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Layout};
    use crate::store::DirArtifactStore;
    use tempfile::{TempDir, tempdir};

    #[test]
    fn pyroma_score_parses_common_formats() {
        assert_eq!(parse_pyroma_score("Final rating: 8/10"), Some(8));
        assert_eq!(parse_pyroma_score("rating: 10 / 10\ncheers"), Some(10));
        assert_eq!(parse_pyroma_score("no score here"), None);
    }

    // The remaining tests drive the executor against a fake interpreter, a
    // shell script that emulates venv/build/twine/pyroma/pip/pytest and
    // records every invocation.
    #[cfg(unix)]
    mod with_fake_python {
        use super::*;

        struct Fixture {
            _root: TempDir,
            layout: Layout,
            store: Arc<DirArtifactStore>,
            package: Package,
            fake_dir: PathBuf,
        }

        fn write_fake_python(dir: &Path) -> PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let script_path = dir.join("python3");
            let calls = dir.join("calls.log");
            let score_file = dir.join("pyroma_score");
            let fail_file = dir.join("fail_module");
            let script = format!(
                r#"#!/bin/sh
CALLS="{calls}"
echo "python $*" >> "$CALLS"
if [ -f "{fail}" ] && [ "$2" = "$(cat "{fail}")" ]; then
    echo "forced failure in $2" >&2
    exit 1
fi
case "$2" in
  venv)
    mkdir -p "$3/bin"
    cp "$0" "$3/bin/python"
    chmod +x "$3/bin/python"
    ;;
  build)
    b=$(basename "$3")
    mkdir -p "$3/dist"
    echo wheel > "$3/dist/$b-0.1.0-py3-none-any.whl"
    echo sdist > "$3/dist/$b-0.1.0.tar.gz"
    ;;
  pyroma)
    if [ -f "{score}" ]; then
        echo "Final rating: $(cat "{score}")/10"
    else
        echo "Final rating: 9/10"
    fi
    ;;
  pytest)
    echo "TESTRUN=$TESTRUN_MARKER SLAPD=$SLAPD_URIS" >> "$CALLS"
    ;;
esac
exit 0
"#,
                calls = calls.display(),
                fail = fail_file.display(),
                score = score_file.display(),
            );
            fs::write(&script_path, script).expect("write fake python");
            let mut perms = fs::metadata(&script_path).expect("stat").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).expect("chmod");
            script_path
        }

        fn fixture() -> Fixture {
            let root = tempdir().expect("tempdir");
            let fake_dir = root.path().join("fake");
            fs::create_dir_all(&fake_dir).expect("mkdir");
            write_fake_python(&fake_dir);

            let package = Package {
                name: "demo".to_string(),
                path: PathBuf::from("sources/demo"),
                tier: 0,
                skip_tests: false,
                sequential: false,
            };
            let package_dir = root.path().join("sources/demo");
            fs::create_dir_all(&package_dir).expect("mkdir package");
            fs::write(package_dir.join("pyproject.toml"), "[project]\nname = \"demo\"\n")
                .expect("write pyproject");

            let config = Config::default();
            let layout = Layout::new(root.path(), &config.layout);
            let store = Arc::new(DirArtifactStore::new(layout.dist_dir.clone()));

            Fixture {
                _root: root,
                layout,
                store,
                package,
                fake_dir,
            }
        }

        fn executor(fx: &Fixture) -> Executor {
            executor_with(fx, |_| {})
        }

        fn executor_with(fx: &Fixture, tweak: impl FnOnce(&mut ExecutorOptions)) -> Executor {
            let mut opts = ExecutorOptions {
                python: fx.fake_dir.join("python3").display().to_string(),
                pyroma_threshold: 8,
                phase_timeout: Duration::from_secs(30),
                install_from: InstallSource::Wheel,
                force_env: false,
                keep_env: false,
                keep_dist: false,
                batch_id: "test-batch".to_string(),
                test_env: vec![
                    ("TESTRUN_MARKER".to_string(), "1".to_string()),
                    ("SLAPD_URIS".to_string(), "ldap://127.0.0.1:12345".to_string()),
                ],
            };
            tweak(&mut opts);
            Executor::new(fx.layout.clone(), fx.store.clone(), opts)
        }

        fn calls(fx: &Fixture) -> String {
            fs::read_to_string(fx.fake_dir.join("calls.log")).unwrap_or_default()
        }

        #[test]
        fn env_phase_creates_environment_and_is_idempotent() {
            let fx = fixture();
            let exec = executor(&fx);

            let outcome = exec.run_phase(&fx.package, Phase::Env);
            assert_eq!(outcome.status, PhaseStatus::Passed, "{outcome:?}");
            assert!(fx.layout.venv_python(&fx.package).exists());
            assert!(calls(&fx).contains("-m venv"));

            // Second run is a no-op success: no new venv invocation.
            let before = calls(&fx).matches("-m venv").count();
            let outcome = exec.run_phase(&fx.package, Phase::Env);
            assert_eq!(outcome.status, PhaseStatus::Passed);
            assert_eq!(calls(&fx).matches("-m venv").count(), before);
        }

        #[test]
        fn env_phase_missing_package_dir_is_setup_failure() {
            let fx = fixture();
            let exec = executor(&fx);
            let ghost = Package {
                name: "ghost".to_string(),
                path: PathBuf::from("sources/ghost"),
                tier: 0,
                skip_tests: false,
                sequential: false,
            };

            let outcome = exec.run_phase(&ghost, Phase::Env);
            assert!(outcome.status.is_setup_failure(), "{outcome:?}");
        }

        #[test]
        fn build_without_env_is_setup_failure() {
            let fx = fixture();
            let exec = executor(&fx);
            let outcome = exec.run_phase(&fx.package, Phase::Build);
            assert!(outcome.status.is_setup_failure(), "{outcome:?}");
        }

        #[test]
        fn full_chain_passes_and_publishes_artifacts() {
            let fx = fixture();
            let exec = executor(&fx);

            for phase in [Phase::Env, Phase::Build, Phase::Check, Phase::Test] {
                let outcome = exec.run_phase(&fx.package, phase);
                assert_eq!(outcome.status, PhaseStatus::Passed, "{phase}: {outcome:?}");
            }

            // Build published both artifacts to the shared store.
            assert!(
                fx.store
                    .get("demo", ArtifactKind::Wheel)
                    .expect("get")
                    .is_some()
            );
            assert!(
                fx.store
                    .get("demo", ArtifactKind::Sdist)
                    .expect("get")
                    .is_some()
            );

            // Test phase installed from the store and saw the fixture env.
            let log = calls(&fx);
            assert!(log.contains("--find-links"));
            assert!(log.contains("demo[test]"));
            assert!(log.contains("TESTRUN=1 SLAPD=ldap://127.0.0.1:12345"));

            // Phase logs were captured per package and phase.
            assert!(
                fx.layout
                    .phase_log_path("test-batch", "demo", "build")
                    .exists()
            );
        }

        #[test]
        fn build_failure_is_tool_failure() {
            let fx = fixture();
            let exec = executor(&fx);
            assert_eq!(exec.run_phase(&fx.package, Phase::Env).status, PhaseStatus::Passed);

            fs::write(fx.fake_dir.join("fail_module"), "build").expect("arm failure");
            let outcome = exec.run_phase(&fx.package, Phase::Build);
            assert!(
                matches!(
                    &outcome.status,
                    PhaseStatus::Failed { kind: FailureKind::Tool, .. }
                ),
                "{outcome:?}"
            );
        }

        #[test]
        fn check_fails_below_pyroma_threshold() {
            let fx = fixture();
            let exec = executor(&fx);
            assert_eq!(exec.run_phase(&fx.package, Phase::Env).status, PhaseStatus::Passed);
            assert_eq!(exec.run_phase(&fx.package, Phase::Build).status, PhaseStatus::Passed);

            fs::write(fx.fake_dir.join("pyroma_score"), "6").expect("write score");
            let outcome = exec.run_phase(&fx.package, Phase::Check);
            match &outcome.status {
                PhaseStatus::Failed { kind, message } => {
                    assert_eq!(*kind, FailureKind::Tool);
                    assert!(message.contains("below threshold"), "{message}");
                }
                other => panic!("expected failure, got {other:?}"),
            }
        }

        #[test]
        fn sdist_install_passes_no_binary() {
            let fx = fixture();
            let exec = executor_with(&fx, |opts| opts.install_from = InstallSource::Sdist);
            assert_eq!(exec.run_phase(&fx.package, Phase::Env).status, PhaseStatus::Passed);
            assert_eq!(exec.run_phase(&fx.package, Phase::Build).status, PhaseStatus::Passed);

            let outcome = exec.run_phase(&fx.package, Phase::Test);
            assert_eq!(outcome.status, PhaseStatus::Passed, "{outcome:?}");
            assert!(calls(&fx).contains("--no-binary demo"));
        }

        #[test]
        fn clean_removes_everything_and_always_passes() {
            let fx = fixture();
            let exec = executor(&fx);
            assert_eq!(exec.run_phase(&fx.package, Phase::Env).status, PhaseStatus::Passed);
            assert_eq!(exec.run_phase(&fx.package, Phase::Build).status, PhaseStatus::Passed);

            let outcome = exec.run_phase(&fx.package, Phase::Clean);
            assert_eq!(outcome.status, PhaseStatus::Passed);
            assert!(!fx.layout.venv_dir(&fx.package).exists());
            assert!(!fx.layout.package_dist_dir(&fx.package).exists());

            // Idempotent: nothing left to remove still succeeds.
            let outcome = exec.run_phase(&fx.package, Phase::Clean);
            assert_eq!(outcome.status, PhaseStatus::Passed);
        }

        #[test]
        fn keep_flags_preserve_env_and_dist() {
            let fx = fixture();
            let exec = executor_with(&fx, |opts| {
                opts.keep_env = true;
                opts.keep_dist = true;
            });
            assert_eq!(exec.run_phase(&fx.package, Phase::Env).status, PhaseStatus::Passed);
            assert_eq!(exec.run_phase(&fx.package, Phase::Build).status, PhaseStatus::Passed);

            assert_eq!(exec.run_phase(&fx.package, Phase::Clean).status, PhaseStatus::Passed);
            assert!(fx.layout.venv_dir(&fx.package).exists());
            assert!(fx.layout.package_dist_dir(&fx.package).exists());
        }
    }
}
