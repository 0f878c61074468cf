use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};

use dockhand::artifacts;
use dockhand::changelog;
use dockhand::config::{Config, Layout, test_environment};
use dockhand::dispatch::{self, DispatchOptions, Reporter};
use dockhand::events::{self, EventLog};
use dockhand::executor::{Executor, ExecutorOptions, PhaseRunner};
use dockhand::process;
use dockhand::registry::{Package, Registry};
use dockhand::release::{self, ExternalReleaseTool, ReleaseOptions, ReleaseStatus};
use dockhand::state;
use dockhand::store::DirArtifactStore;
use dockhand::types::{ArtifactKind, InstallSource, Mode};

mod progress;

/// A phase failed: the tool ran and said no.
const EXIT_FAILURE: i32 = 1;
/// A prerequisite was missing before any tool could run.
const EXIT_SETUP: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "dockhand", version)]
#[command(about = "Validate and release monorepo packages in dependency order")]
struct Cli {
    /// Monorepo root directory.
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Registry manifest path (default: <root>/packages.toml).
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Show per-step detail.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run validation phases for a single package.
    Validate {
        /// Package name from the registry.
        package: String,

        #[command(flatten)]
        phases: PhaseSelection,

        /// Which built artifact the test phase installs.
        #[arg(long, value_enum, default_value = "wheel")]
        install_from: InstallFromArg,

        /// Minimum pyroma quality score.
        #[arg(long)]
        pyroma_threshold: Option<u32>,

        /// Per-phase tool deadline (e.g. 10m, 90s).
        #[arg(long)]
        phase_timeout: Option<String>,

        /// Recreate the environment even if it exists.
        #[arg(long)]
        force_env: bool,

        /// Keep the package environment after clean.
        #[arg(long)]
        keep_env: bool,

        /// Keep the package-local dist dir after clean.
        #[arg(long)]
        keep_dist: bool,
    },

    /// Validate every registry package, in parallel where allowed.
    ValidateAll {
        /// Upper bound on concurrently validated packages.
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Run the reduced chain (no test phase) for every package.
        #[arg(long)]
        skip_tests_only: bool,

        /// Exclude a package (repeatable).
        #[arg(long = "skip")]
        skip: Vec<String>,
    },

    /// Compare wheel and sdist contents for every built package.
    CompareArtifacts {
        /// Directory holding the built artifacts (default: <root>/dist).
        dist_dir: Option<PathBuf>,

        /// Fail on any unfiltered discrepancy (CI gating).
        #[arg(long)]
        strict: bool,
    },

    /// Cut releases for packages with unreleased changes, in tier order.
    Release {
        /// Compute and print the plan without releasing.
        #[arg(long)]
        dry_run: bool,

        /// List packages needing release and exit.
        #[arg(long)]
        list: bool,

        /// Release only this package (repeatable).
        #[arg(long = "package")]
        packages: Vec<String>,

        /// Skip this package (repeatable).
        #[arg(long = "skip")]
        skip: Vec<String>,

        /// Bump, tag and build locally but never publish.
        #[arg(long)]
        no_upload: bool,

        /// Continue past a failed package release.
        #[arg(long)]
        keep_going: bool,
    },

    /// Print the tiered release plan.
    Plan,

    /// Print environment and tool diagnostics.
    Doctor,
}

/// Mutually exclusive phase selection; defaults to the full chain.
#[derive(Args, Debug)]
#[group(multiple = false)]
struct PhaseSelection {
    /// Provision the package environment.
    #[arg(long)]
    env: bool,
    /// Build wheel and sdist, publish them to the shared dist dir.
    #[arg(long)]
    build: bool,
    /// Run metadata and quality checks against the artifacts.
    #[arg(long)]
    check: bool,
    /// Install from the built wheel and run the test suite.
    #[arg(long)]
    test: bool,
    /// Install from the built sdist and run the test suite.
    #[arg(long)]
    test_sdist: bool,
    /// Remove the package environment and local dist dir.
    #[arg(long)]
    clean: bool,
    /// Run the full chain: env, build, check, test, clean.
    #[arg(long)]
    all: bool,
}

impl PhaseSelection {
    fn mode(&self) -> Mode {
        if self.env {
            Mode::Env
        } else if self.build {
            Mode::Build
        } else if self.check {
            Mode::Check
        } else if self.test {
            Mode::Test
        } else if self.test_sdist {
            Mode::TestSdist
        } else if self.clean {
            Mode::Clean
        } else {
            Mode::All
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum InstallFromArg {
    Wheel,
    Sdist,
}

impl From<InstallFromArg> for InstallSource {
    fn from(value: InstallFromArg) -> Self {
        match value {
            InstallFromArg::Wheel => InstallSource::Wheel,
            InstallFromArg::Sdist => InstallSource::Sdist,
        }
    }
}

struct CliReporter {
    verbose: bool,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }

    fn package_finished(&mut self, package: &str, failure: Option<&dockhand::types::PhaseOutcome>) {
        match failure {
            None => eprintln!("✓ {package}"),
            Some(outcome) => {
                let log = outcome
                    .log_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                eprintln!("✗ {package} ({} phase, log: {log})", outcome.phase);
                if self.verbose {
                    if let dockhand::types::PhaseStatus::Failed { message, .. } = &outcome.status {
                        eprintln!("    {message}");
                    }
                }
            }
        }
    }
}

/// Everything a subcommand needs about the repo.
struct Workspace {
    config: Config,
    registry: Registry,
    layout: Layout,
}

fn load_workspace(cli: &Cli) -> Result<Workspace> {
    let config = Config::load(&cli.root)?;
    let layout = Layout::new(&cli.root, &config.layout);
    let manifest = cli
        .manifest
        .clone()
        .unwrap_or_else(|| cli.root.join(&config.layout.manifest));
    let registry = Registry::load(&manifest)
        .with_context(|| format!("failed to load registry {}", manifest.display()))?;
    Ok(Workspace {
        config,
        registry,
        layout,
    })
}

fn batch_label() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn build_executor(
    ws: &Workspace,
    install_from: InstallSource,
    pyroma_threshold: Option<u32>,
    phase_timeout: Option<&str>,
    force_env: bool,
    keep_env: bool,
    keep_dist: bool,
) -> Result<Executor> {
    let phase_timeout = match phase_timeout {
        Some(raw) => humantime::parse_duration(raw)
            .with_context(|| format!("invalid duration: {raw}"))?,
        None => ws.config.validate.phase_timeout,
    };
    let opts = ExecutorOptions {
        python: ws.config.validate.python.clone(),
        pyroma_threshold: pyroma_threshold.unwrap_or(ws.config.validate.pyroma_threshold),
        phase_timeout,
        install_from,
        force_env,
        keep_env,
        keep_dist,
        batch_id: batch_label(),
        test_env: test_environment(&ws.layout, &ws.config.ldap),
    };
    let store = Arc::new(DirArtifactStore::new(ws.layout.dist_dir.clone()));
    Ok(Executor::new(ws.layout.clone(), store, opts))
}

fn run_batch(
    ws: &Workspace,
    packages: Vec<Package>,
    executor: Executor,
    mode: Mode,
    max_concurrent: usize,
    reporter: Arc<Mutex<dyn Reporter + Send>>,
) -> Result<dockhand::types::BatchReport> {
    let events_path = events::events_path(&ws.layout.state_dir);
    let runner: Arc<dyn PhaseRunner> = Arc::new(executor);
    let report = dispatch::dispatch(
        &packages,
        runner,
        &DispatchOptions {
            mode,
            max_concurrent,
        },
        reporter,
        Arc::new(Mutex::new(EventLog::new())),
        &events_path,
    )?;
    state::write_report(&ws.layout.state_dir, &report)?;
    Ok(report)
}

fn cmd_validate(
    cli: &Cli,
    package: &str,
    phases: &PhaseSelection,
    install_from: InstallFromArg,
    pyroma_threshold: Option<u32>,
    phase_timeout: Option<&str>,
    force_env: bool,
    keep_env: bool,
    keep_dist: bool,
) -> Result<i32> {
    let ws = load_workspace(cli)?;
    let Some(pkg) = ws.registry.get(package) else {
        bail!("package not in registry: {package}");
    };

    let mode = phases.mode();
    let install_from = if mode == Mode::TestSdist {
        InstallSource::Sdist
    } else {
        install_from.into()
    };
    let executor = build_executor(
        &ws,
        install_from,
        pyroma_threshold,
        phase_timeout,
        force_env,
        keep_env,
        keep_dist,
    )?;

    let reporter: Arc<Mutex<dyn Reporter + Send>> = Arc::new(Mutex::new(CliReporter {
        verbose: cli.verbose,
    }));
    let report = run_batch(&ws, vec![pkg.clone()], executor, mode, 1, Arc::clone(&reporter))?;

    let mut rep = CliReporter {
        verbose: cli.verbose,
    };
    dispatch::summarize(&report, &mut rep);

    if report.is_clean() {
        Ok(0)
    } else if report.any_setup_failure() {
        Ok(EXIT_SETUP)
    } else {
        Ok(EXIT_FAILURE)
    }
}

fn cmd_validate_all(
    cli: &Cli,
    max_concurrent: Option<usize>,
    skip_tests_only: bool,
    skip: &[String],
) -> Result<i32> {
    let ws = load_workspace(cli)?;
    let skip: BTreeSet<&str> = skip.iter().map(String::as_str).collect();

    let packages: Vec<Package> = ws
        .registry
        .packages()
        .iter()
        .filter(|p| !skip.contains(p.name.as_str()))
        .map(|p| {
            let mut p = p.clone();
            if skip_tests_only {
                p.skip_tests = true;
            }
            p
        })
        .collect();
    if packages.is_empty() {
        bail!("no packages selected");
    }

    let executor = build_executor(
        &ws,
        ws.config.validate.install_from,
        None,
        None,
        false,
        false,
        false,
    )?;
    let max_concurrent = max_concurrent.unwrap_or(ws.config.validate.max_concurrent);

    let progress = Arc::new(Mutex::new(progress::ProgressReporter::new(
        packages.len(),
        cli.verbose,
    )));
    let reporter: Arc<Mutex<dyn Reporter + Send>> = progress.clone();
    let report = run_batch(&ws, packages, executor, Mode::All, max_concurrent, reporter)?;
    progress.lock().expect("progress lock").finish();

    let mut rep = CliReporter {
        verbose: cli.verbose,
    };
    dispatch::summarize(&report, &mut rep);
    Ok(if report.is_clean() { 0 } else { EXIT_FAILURE })
}

fn cmd_compare_artifacts(cli: &Cli, dist_dir: Option<PathBuf>, strict: bool) -> Result<i32> {
    let ws = load_workspace(cli)?;
    let dist_dir = dist_dir.unwrap_or_else(|| ws.layout.dist_dir.clone());
    if !dist_dir.exists() {
        bail!("dist directory not found: {}", dist_dir.display());
    }

    let report = artifacts::compare_dist_dir(&dist_dir)?;

    for pkg in &report.packages {
        if pkg.discrepancies.is_empty() {
            if cli.verbose {
                println!("{}: wheel and sdist match", pkg.package);
            }
            continue;
        }
        println!(
            "{} ({}): {} discrepancies (wheel: {} files, sdist: {} files)",
            pkg.package,
            pkg.version,
            pkg.discrepancies.len(),
            pkg.wheel_file_count,
            pkg.sdist_file_count,
        );
        for d in &pkg.discrepancies {
            let marker = match d.present_in {
                ArtifactKind::Wheel => '+',
                ArtifactKind::Sdist => '-',
            };
            println!("  {marker} {}", d.path);
        }
    }
    for unpaired in &report.unpaired {
        println!("{unpaired}: no matching sdist found");
    }
    if report.is_clean() {
        println!(
            "all {} packages: wheel and sdist contents match",
            report.packages.len()
        );
    }

    Ok(if strict && !report.is_clean() {
        EXIT_FAILURE
    } else {
        0
    })
}

fn cmd_release(
    cli: &Cli,
    dry_run: bool,
    list: bool,
    packages: &[String],
    skip: &[String],
    no_upload: bool,
    keep_going: bool,
) -> Result<i32> {
    let ws = load_workspace(cli)?;

    let eligibilities = changelog::scan(&ws.registry, &ws.layout)?;
    if cli.verbose || list {
        for e in &eligibilities {
            if e.eligible {
                println!(
                    "  {} ({}): {}",
                    e.package,
                    e.version.as_deref().unwrap_or("?"),
                    e.reason
                );
            } else if cli.verbose {
                println!("  {}: skip - {}", e.package, e.reason);
            }
        }
    }

    let eligible_count = eligibilities.iter().filter(|e| e.eligible).count();
    println!("packages to release: {eligible_count}");
    if list {
        return Ok(0);
    }
    if eligible_count == 0 {
        println!("no packages need release");
        return Ok(0);
    }

    let plan = changelog::build_plan(&ws.registry, &eligibilities);
    let opts = ReleaseOptions {
        dry_run,
        no_upload,
        keep_going: keep_going || ws.config.release.keep_going,
        only: if packages.is_empty() {
            None
        } else {
            Some(packages.iter().cloned().collect())
        },
        skip: skip.iter().cloned().collect(),
    };

    let tool = ExternalReleaseTool {
        timeout: ws.config.validate.phase_timeout,
    };
    let mut reporter = CliReporter {
        verbose: cli.verbose,
    };
    let mut event_log = EventLog::new();
    let events_path = events::events_path(&ws.layout.state_dir);

    let results = release::run_release(
        &plan,
        &ws.registry,
        &ws.layout,
        &tool,
        &opts,
        &mut reporter,
        &mut event_log,
        &events_path,
    )?;

    release::summarize(&results, &mut reporter);
    let any_failed = results
        .iter()
        .any(|r| matches!(r.status, ReleaseStatus::Failed { .. }));
    Ok(if any_failed { EXIT_FAILURE } else { 0 })
}

fn cmd_plan(cli: &Cli) -> Result<i32> {
    let ws = load_workspace(cli)?;
    let eligibilities = changelog::scan(&ws.registry, &ws.layout)?;
    let plan = changelog::build_plan(&ws.registry, &eligibilities);

    println!("plan_id: {}", plan.plan_id);
    println!("packages: {}", plan.package_count());
    for tier in &plan.tiers {
        println!();
        println!("tier {} ({}):", tier.tier, tier.name);
        for p in &tier.packages {
            println!("  {} ({})", p.name, p.version.as_deref().unwrap_or("?"));
        }
    }
    Ok(0)
}

fn cmd_doctor(cli: &Cli) -> Result<i32> {
    let ws = load_workspace(cli)?;

    println!("root: {}", ws.layout.root.display());
    println!("packages: {}", ws.registry.len());
    println!("tiers: {}", ws.registry.tier_count());
    println!("dist_dir: {}", ws.layout.dist_dir.display());
    println!("state_dir: {}", ws.layout.state_dir.display());
    println!();

    match process::resolve_tool(&ws.config.validate.python) {
        Some(path) => println!("{}: {}", ws.config.validate.python, path.display()),
        None => println!("{}: NOT FOUND", ws.config.validate.python),
    }
    match process::resolve_tool("fullrelease") {
        Some(path) => println!("fullrelease: {}", path.display()),
        None => println!("fullrelease: NOT FOUND (releases will fail)"),
    }

    let slapd = ws.layout.root.join(&ws.config.ldap.slapd_bin);
    println!(
        "slapd: {} ({})",
        slapd.display(),
        if slapd.exists() { "present" } else { "missing" }
    );
    Ok(0)
}

fn run(cli: Cli) -> Result<i32> {
    match &cli.cmd {
        Commands::Validate {
            package,
            phases,
            install_from,
            pyroma_threshold,
            phase_timeout,
            force_env,
            keep_env,
            keep_dist,
        } => cmd_validate(
            &cli,
            package,
            phases,
            *install_from,
            *pyroma_threshold,
            phase_timeout.as_deref(),
            *force_env,
            *keep_env,
            *keep_dist,
        ),
        Commands::ValidateAll {
            max_concurrent,
            skip_tests_only,
            skip,
        } => cmd_validate_all(&cli, *max_concurrent, *skip_tests_only, skip),
        Commands::CompareArtifacts { dist_dir, strict } => {
            cmd_compare_artifacts(&cli, dist_dir.clone(), *strict)
        }
        Commands::Release {
            dry_run,
            list,
            packages,
            skip,
            no_upload,
            keep_going,
        } => cmd_release(&cli, *dry_run, *list, packages, skip, *no_upload, *keep_going),
        Commands::Plan => cmd_plan(&cli),
        Commands::Doctor => cmd_doctor(&cli),
    }
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("[error] {e:#}");
            std::process::exit(EXIT_SETUP);
        }
    }
}
