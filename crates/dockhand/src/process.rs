//! External tool invocation with deadline enforcement.
//!
//! Every phase shells out to separate toolchains (interpreter, build
//! backend, linters, test runner, release tool). A hung tool must never
//! block the whole batch, so commands are polled against a deadline and
//! killed when it passes.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// A single external command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.envs.extend(vars.iter().cloned());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Rendered command line for logs and error messages.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout and stderr merged for log capture.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Locate an external tool on PATH.
pub fn resolve_tool(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Run a command to completion, honoring the configured deadline.
///
/// A spawn failure (missing binary, bad cwd) is an error; a non-zero exit
/// or a timeout is reported through [`CommandOutput`] so the caller can
/// classify it.
pub fn run(spec: &CommandSpec) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.envs {
        command.env(key, value);
    }

    match spec.timeout {
        Some(timeout) => run_with_deadline(&mut command, spec, timeout, start),
        None => {
            let output = command
                .output()
                .with_context(|| format!("failed to execute {}", spec.display()))?;
            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
                duration: start.elapsed(),
            })
        }
    }
}

fn run_with_deadline(
    command: &mut Command,
    spec: &CommandSpec,
    timeout: Duration,
    start: Instant,
) -> Result<CommandOutput> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.display()))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait().context("failed to poll command")? {
            Some(status) => {
                let (stdout, stderr) = drain_pipes(&mut child);
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let (stdout, mut stderr) = drain_pipes(&mut child);
                    stderr.push_str(&format!(
                        "\ncommand timed out after {}",
                        humantime::format_duration(timeout)
                    ));
                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout,
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn drain_pipes(child: &mut std::process::Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

/// Append one command's rendering and captured output to a phase log file.
pub fn append_log(path: &Path, spec: &CommandSpec, output: &CommandOutput) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log dir {}", parent.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    writeln!(file, "$ {}", spec.display())?;
    let combined = output.combined();
    if !combined.is_empty() {
        writeln!(file, "{}", combined.trim_end())?;
    }
    writeln!(file, "[exit {}{}]", output.exit_code, if output.timed_out { ", timed out" } else { "" })?;
    Ok(())
}
