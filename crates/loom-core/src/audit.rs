//! Append-only, size-rotated security audit log.
//!
//! Each entry is one JSON object per line. Entries are also emitted through
//! `tracing` so they show up in the process log when no file is configured.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AuditConfig;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    EntryPointRegistered,
    EntryPointUnregistered,
    RuntimeStarted,
    RuntimeStopped,
    TriggerAccepted,
    ExecutionCompleted,
    ExecutionTimedOut,
    SecurityViolation,
    LimitExceeded,
}

/// Audit severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// RFC3339 timestamp.
    pub timestamp: String,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, severity: AuditSeverity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            severity,
            entry_point: None,
            execution_id: None,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

struct Sink {
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

/// Audit logger. File output is optional; tracing output is always on.
pub struct AuditLog {
    enabled: bool,
    max_bytes: u64,
    max_files: usize,
    sink: Option<Mutex<Sink>>,
}

impl AuditLog {
    /// Build from config, writing to `path` when given.
    pub fn new(config: &AuditConfig, path: Option<PathBuf>) -> Self {
        Self {
            enabled: config.enabled,
            max_bytes: config.max_bytes.max(1),
            max_files: config.max_files,
            sink: path.map(|path| {
                Mutex::new(Sink {
                    path,
                    file: None,
                    written: 0,
                })
            }),
        }
    }

    /// Tracing-only audit log.
    pub fn tracing_only() -> Self {
        Self::new(&AuditConfig::default(), None)
    }

    pub fn disabled() -> Self {
        Self::new(
            &AuditConfig {
                enabled: false,
                ..Default::default()
            },
            None,
        )
    }

    pub fn record(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }

        match event.severity {
            AuditSeverity::Info => info!(
                audit = true,
                event_type = ?event.event_type,
                entry_point = event.entry_point.as_deref().unwrap_or(""),
                execution_id = event.execution_id.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
            AuditSeverity::Warning | AuditSeverity::Critical => warn!(
                audit = true,
                event_type = ?event.event_type,
                severity = ?event.severity,
                entry_point = event.entry_point.as_deref().unwrap_or(""),
                execution_id = event.execution_id.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
        }

        let Some(sink) = &self.sink else {
            return;
        };
        let line = match serde_json::to_string(&event) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit event");
                return;
            }
        };

        let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.append(&mut sink, line.as_bytes()) {
            warn!(error = %e, path = %sink.path.display(), "Failed to write audit log");
        }
    }

    fn append(&self, sink: &mut Sink, bytes: &[u8]) -> std::io::Result<()> {
        if sink.file.is_none() {
            if let Some(parent) = sink.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(&sink.path)?;
            sink.written = file.metadata()?.len();
            sink.file = Some(file);
        }

        if sink.written > 0 && sink.written + bytes.len() as u64 > self.max_bytes {
            sink.file = None;
            rotate(&sink.path, self.max_files)?;
            sink.file = Some(OpenOptions::new().create(true).append(true).open(&sink.path)?);
            sink.written = 0;
        }

        if let Some(file) = sink.file.as_mut() {
            file.write_all(bytes)?;
            file.flush()?;
            sink.written += bytes.len() as u64;
        }
        Ok(())
    }
}

/// Shift `log.N-1` -> `log.N` ... `log` -> `log.1`, dropping the oldest.
fn rotate(path: &Path, max_files: usize) -> std::io::Result<()> {
    if max_files == 0 {
        return std::fs::remove_file(path).or_else(ignore_missing);
    }

    let numbered = |n: usize| {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    };

    std::fs::remove_file(numbered(max_files)).or_else(ignore_missing)?;
    for n in (1..max_files).rev() {
        let from = numbered(n);
        if from.exists() {
            std::fs::rename(&from, numbered(n + 1))?;
        }
    }
    std::fs::rename(path, numbered(1))
}

fn ignore_missing(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == std::io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<AuditEvent> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn writes_jsonl_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("audit.log");
        let log = AuditLog::new(&AuditConfig::default(), Some(path.clone()));

        log.record(
            AuditEvent::new(AuditEventType::TriggerAccepted, AuditSeverity::Info, "accepted")
                .with_entry_point("main")
                .with_execution("exec-1"),
        );
        log.record(AuditEvent::new(
            AuditEventType::SecurityViolation,
            AuditSeverity::Critical,
            "reserved key",
        ));

        let entries = read_lines(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, AuditEventType::TriggerAccepted);
        assert_eq!(entries[0].entry_point.as_deref(), Some("main"));
        assert_eq!(entries[1].severity, AuditSeverity::Critical);
    }

    #[test]
    fn rotates_when_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let config = AuditConfig {
            max_bytes: 200,
            max_files: 2,
            ..Default::default()
        };
        let log = AuditLog::new(&config, Some(path.clone()));

        for i in 0..12 {
            log.record(AuditEvent::new(
                AuditEventType::TriggerAccepted,
                AuditSeverity::Info,
                format!("trigger number {}", i),
            ));
        }

        assert!(path.exists());
        assert!(dir.path().join("audit.log.1").exists());
        assert!(dir.path().join("audit.log.2").exists());
        assert!(!dir.path().join("audit.log.3").exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 200);
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let config = AuditConfig {
            enabled: false,
            ..Default::default()
        };
        let log = AuditLog::new(&config, Some(path.clone()));
        log.record(AuditEvent::new(
            AuditEventType::RuntimeStarted,
            AuditSeverity::Info,
            "started",
        ));
        assert!(!path.exists());
    }
}
