//! Append-only event log for test sessions
//!
//! The worker thread appends, the control surface reads snapshots or
//! subscribes to a channel of new entries.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// `[HH:MM:SS] message`
    #[default]
    Text,
    /// JSON lines
    JsonLines,
}

impl LogFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Text => "txt",
            LogFormat::JsonLines => "jsonl",
        }
    }
}

/// Severity tag of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Progress message
    Info,
    /// A step completed
    Success,
    /// Something went wrong but the test goes on
    Warning,
    /// The test cannot pass
    Error,
    /// Handshake token seen
    Detection,
}

impl Severity {
    /// Short tag for text output
    pub fn tag(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Success => "OK",
            Severity::Warning => "WARN",
            Severity::Error => "ERROR",
            Severity::Detection => "DETECT",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Local time the entry was appended
    pub timestamp: DateTime<Local>,
    /// Severity tag
    pub severity: Severity,
    /// Message text, without timestamp or tag
    pub message: String,
}

impl LogEntry {
    /// Create new entry stamped now
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            severity,
            message: message.into(),
        }
    }

    /// Format as text
    pub fn to_text(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }

    /// Format as text including the severity tag
    pub fn to_tagged_text(&self) -> String {
        format!(
            "[{}] {:<6} {}",
            self.timestamp.format("%H:%M:%S"),
            self.severity.tag(),
            self.message
        )
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Format according to `format`
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Text => self.to_text(),
            LogFormat::JsonLines => self.to_json(),
        }
    }
}

/// Append-only, timestamped event log shared between the worker and
/// whoever displays it. Cloning shares the same log.
#[derive(Clone, Default)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Default)]
struct EventLogInner {
    entries: RwLock<Vec<LogEntry>>,
    subscribers: Mutex<Vec<Sender<LogEntry>>>,
    file: Mutex<Option<FileSink>>,
}

struct FileSink {
    writer: BufWriter<File>,
    format: LogFormat,
    path: PathBuf,
}

impl EventLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, notify subscribers and mirror to tracing
    pub fn push(&self, severity: Severity, message: impl Into<String>) {
        let entry = LogEntry::new(severity, message);

        match severity {
            Severity::Error => tracing::error!(target: "cabletest::events", "{}", entry.message),
            Severity::Warning => tracing::warn!(target: "cabletest::events", "{}", entry.message),
            _ => tracing::info!(target: "cabletest::events", severity = severity.tag(), "{}", entry.message),
        }

        if let Some(sink) = self.inner.file.lock().as_mut() {
            let _ = writeln!(sink.writer, "{}", entry.format(sink.format));
            let _ = sink.writer.flush();
        }

        // Subscribers whose receiver is gone are dropped
        self.inner
            .subscribers
            .lock()
            .retain(|tx| tx.send(entry.clone()).is_ok());

        self.inner.entries.write().push(entry);
    }

    /// Log info message
    pub fn info(&self, message: impl Into<String>) {
        self.push(Severity::Info, message);
    }

    /// Log success message
    pub fn success(&self, message: impl Into<String>) {
        self.push(Severity::Success, message);
    }

    /// Log warning message
    pub fn warning(&self, message: impl Into<String>) {
        self.push(Severity::Warning, message);
    }

    /// Log error message
    pub fn error(&self, message: impl Into<String>) {
        self.push(Severity::Error, message);
    }

    /// Log detection message
    pub fn detection(&self, message: impl Into<String>) {
        self.push(Severity::Detection, message);
    }

    /// Receive every entry appended from now on
    pub fn subscribe(&self) -> Receiver<LogEntry> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Snapshot of all entries so far
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.entries.read().clone()
    }

    /// Entries with the given severity
    pub fn with_severity(&self, severity: Severity) -> Vec<LogEntry> {
        self.inner
            .entries
            .read()
            .iter()
            .filter(|e| e.severity == severity)
            .cloned()
            .collect()
    }

    /// Whether any entry contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.inner.entries.read().iter().any(|e| e.message.contains(needle))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Is empty
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Clear buffer
    pub fn clear(&self) {
        self.inner.entries.write().clear();
    }

    /// Also append every entry to a file
    pub fn start_file(&self, path: PathBuf, format: LogFormat) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        *self.inner.file.lock() = Some(FileSink {
            writer: BufWriter::new(file),
            format,
            path,
        });
        Ok(())
    }

    /// Stop writing to the log file
    pub fn stop_file(&self) -> Option<PathBuf> {
        self.inner.file.lock().take().map(|mut sink| {
            let _ = sink.writer.flush();
            sink.path
        })
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("entries", &self.len()).finish()
    }
}

/// Generate log filename with timestamp
pub fn generate_log_filename(prefix: &str, format: LogFormat) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", prefix, timestamp, format.extension())
}
