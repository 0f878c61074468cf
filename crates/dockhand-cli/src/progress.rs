//! Progress reporting with TTY detection.
//!
//! Batch runs show an indicatif progress bar when stdout is a TTY and fall
//! back to plain line output otherwise (CI logs).

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

use dockhand::dispatch::Reporter;
use dockhand::types::PhaseOutcome;

pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Reporter that drives a progress bar across a batch dispatch.
pub struct ProgressReporter {
    bar: Option<ProgressBar>,
    verbose: bool,
}

impl ProgressReporter {
    pub fn new(total_packages: usize, verbose: bool) -> Self {
        let bar = if is_tty() {
            let pb = ProgressBar::new(total_packages as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{pos}/{len}] {bar:30} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };
        Self { bar, verbose }
    }

    fn line(&self, msg: &str) {
        match &self.bar {
            Some(pb) => pb.println(msg),
            None => eprintln!("{msg}"),
        }
    }

    pub fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }
}

impl Reporter for ProgressReporter {
    fn info(&mut self, msg: &str) {
        if self.verbose {
            self.line(msg);
        }
    }

    fn warn(&mut self, msg: &str) {
        self.line(&format!("[warn] {msg}"));
    }

    fn error(&mut self, msg: &str) {
        self.line(&format!("[error] {msg}"));
    }

    fn package_finished(&mut self, package: &str, failure: Option<&PhaseOutcome>) {
        let marker = match failure {
            None => format!("✓ {package}"),
            Some(outcome) => format!("✗ {package} ({} phase)", outcome.phase),
        };
        self.line(&marker);
        if let Some(pb) = &self.bar {
            pb.set_message(package.to_string());
            pb.inc(1);
        }
    }
}
