//! Append-only JSONL event log.
//!
//! The event log is a durable artifact for audit and debugging, not a
//! coordination mechanism: dispatch outcomes travel through in-memory
//! collections, and the log is flushed from whoever holds it at the time.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::types::RunEvent;

/// Default events file name inside the state dir.
pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// In-memory buffer of run events, flushed to a JSONL file.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RunEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    /// Append all buffered events to `path` in JSONL format.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read line from {}", path.display()))?;
            let event: RunEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event line: {line}"))?;
            events.push(event);
        }
        Ok(Self { events })
    }

    pub fn events_for_package(&self, package: &str) -> Vec<&RunEvent> {
        self.events.iter().filter(|e| e.package == package).collect()
    }

    pub fn all_events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, Mode, Phase};
    use chrono::Utc;
    use tempfile::tempdir;

    fn phase_event(package: &str, phase: Phase) -> RunEvent {
        RunEvent {
            timestamp: Utc::now(),
            event_type: EventType::PhaseStarted { phase },
            package: package.to_string(),
        }
    }

    #[test]
    fn new_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn write_then_read_roundtrips_all_events() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());

        let mut log = EventLog::new();
        log.record(RunEvent {
            timestamp: Utc::now(),
            event_type: EventType::BatchStarted {
                batch_id: "b1".into(),
                mode: Mode::All,
                package_count: 2,
            },
            package: "all".into(),
        });
        log.record(phase_event("odict", Phase::Build));
        log.write_to_file(&path).expect("write");

        let loaded = EventLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.events_for_package("odict").len(), 1);
    }

    #[test]
    fn write_appends_across_flushes() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());

        let mut log = EventLog::new();
        log.record(phase_event("odict", Phase::Env));
        log.write_to_file(&path).expect("first flush");
        log.clear();
        log.record(phase_event("node", Phase::Env));
        log.write_to_file(&path).expect("second flush");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn reading_missing_file_yields_empty_log() {
        let td = tempdir().expect("tempdir");
        let loaded = EventLog::read_from_file(&td.path().join("nope.jsonl")).expect("read");
        assert!(loaded.is_empty());
    }
}
