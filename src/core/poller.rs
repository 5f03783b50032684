//! Incremental tailing of the two remote output streams
//!
//! Each stream keeps a byte offset of what has already been read. Every
//! cycle fetches only the bytes past that offset, advances the cursor by
//! exactly the number of bytes returned and hands the non-empty lines to
//! the detection engine.

use super::detection::DetectionEngine;
use super::transport::{RemoteError, RemoteShell};
use crate::config::RemoteLayout;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// Which remote stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamSource {
    /// Decoded serial bytes written by the capture program
    Capture,
    /// Output of the link-establishment program
    LinkLog,
}

impl StreamSource {
    /// Prefix used when echoing lines to the event log
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Capture => "SERIAL",
            Self::LinkLog => "LINK",
        }
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Read position within one remote file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    source: StreamSource,
    path: String,
    offset: u64,
}

impl StreamCursor {
    /// Cursor at the start of `path`
    pub fn new(source: StreamSource, path: &str) -> Self {
        Self {
            source,
            path: path.to_string(),
            offset: 0,
        }
    }

    /// Stream tag
    pub fn source(&self) -> StreamSource {
        self.source
    }

    /// Remote file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn advance(&mut self, bytes: usize) {
        self.offset = self.offset.saturating_add(bytes as u64);
    }
}

/// Split a payload into trimmed, non-empty lines
pub fn payload_lines(payload: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(payload)
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// What one poll cycle produced
#[derive(Debug, Default)]
pub struct PollCycle {
    /// Cycle number, starting at 1
    pub cycle: u64,
    /// New lines in delivery order, per stream in file order
    pub lines: Vec<(StreamSource, String)>,
    /// Bytes read per stream this cycle
    pub bytes_read: Vec<(StreamSource, u64)>,
    /// Streams whose read failed this cycle (treated as no new data)
    pub skipped: Vec<(StreamSource, String)>,
    /// Whether detection latched during this cycle
    pub detected: bool,
}

/// Tails the capture file and the link log
#[derive(Debug, Clone)]
pub struct DualStreamPoller {
    cursors: [StreamCursor; 2],
    cycles: u64,
}

impl DualStreamPoller {
    /// Poller over the remote files named in `layout`
    pub fn new(layout: &RemoteLayout) -> Self {
        Self::with_paths(&layout.capture_file, &layout.link_log)
    }

    /// Poller over explicit paths
    pub fn with_paths(capture_file: &str, link_log: &str) -> Self {
        Self {
            cursors: [
                StreamCursor::new(StreamSource::Capture, capture_file),
                StreamCursor::new(StreamSource::LinkLog, link_log),
            ],
            cycles: 0,
        }
    }

    /// Current cursors, capture first
    pub fn cursors(&self) -> &[StreamCursor] {
        &self.cursors
    }

    /// Offset of one stream
    pub fn offset(&self, source: StreamSource) -> u64 {
        self.cursors
            .iter()
            .find(|c| c.source == source)
            .map_or(0, StreamCursor::offset)
    }

    /// Completed cycles
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Read both streams once, feeding new lines to `engine`.
    ///
    /// Only connection-level failures are returned; a failed read of a
    /// single stream is recorded in [`PollCycle::skipped`] and the cursor
    /// stays where it was.
    pub fn poll(
        &mut self,
        shell: &mut dyn RemoteShell,
        engine: &mut DetectionEngine,
    ) -> Result<PollCycle, RemoteError> {
        self.cycles += 1;
        let mut result = PollCycle {
            cycle: self.cycles,
            ..PollCycle::default()
        };

        for cursor in &mut self.cursors {
            let payload = match shell.fetch_new_data(&cursor.path, cursor.offset) {
                Ok(payload) => payload,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    trace!(stream = %cursor.source, error = %e, "No new data this cycle");
                    result.skipped.push((cursor.source, e.to_string()));
                    continue;
                }
            };

            if payload.is_empty() {
                continue;
            }

            cursor.advance(payload.len());
            result.bytes_read.push((cursor.source, payload.len() as u64));
            debug!(
                stream = %cursor.source,
                bytes = payload.len(),
                offset = cursor.offset,
                "Read new stream data"
            );

            for line in payload_lines(&payload) {
                if engine.scan(&line, cursor.source, result.cycle) {
                    result.detected = true;
                }
                result.lines.push((cursor.source, line));
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::MockRemoteShell;
    use mockall::predicate::eq;

    #[test]
    fn test_payload_lines() {
        assert_eq!(
            payload_lines(b"  one\r\n\n two  \nthree"),
            vec!["one", "two", "three"]
        );
        assert!(payload_lines(b"\n\n  \n").is_empty());
    }

    #[test]
    fn test_offsets_advance_by_bytes() {
        let mut shell = MockRemoteShell::new();
        // "é" is two bytes, the arrow three
        shell
            .expect_fetch_new_data()
            .with(eq("/tmp/cap"), eq(0))
            .times(1)
            .returning(|_, _| Ok("café →\n".as_bytes().to_vec()));
        shell
            .expect_fetch_new_data()
            .with(eq("/tmp/link"), eq(0))
            .times(1)
            .returning(|_, _| Ok(Vec::new()));
        shell
            .expect_fetch_new_data()
            .with(eq("/tmp/cap"), eq(10))
            .times(1)
            .returning(|_, _| Ok(b"more\n".to_vec()));
        shell
            .expect_fetch_new_data()
            .with(eq("/tmp/link"), eq(0))
            .times(1)
            .returning(|_, _| Ok(b"hello\n".to_vec()));

        let mut poller = DualStreamPoller::with_paths("/tmp/cap", "/tmp/link");
        let mut engine = DetectionEngine::new();

        let first = poller.poll(&mut shell, &mut engine).unwrap();
        assert_eq!(first.cycle, 1);
        assert_eq!(poller.offset(StreamSource::Capture), 10);
        assert_eq!(poller.offset(StreamSource::LinkLog), 0);
        assert_eq!(first.lines, vec![(StreamSource::Capture, "café →".to_string())]);

        let second = poller.poll(&mut shell, &mut engine).unwrap();
        assert_eq!(poller.offset(StreamSource::Capture), 15);
        assert_eq!(poller.offset(StreamSource::LinkLog), 6);
        assert_eq!(second.bytes_read.len(), 2);
        assert!(!second.detected);
    }

    #[test]
    fn test_failed_read_is_transient() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_fetch_new_data()
            .with(eq("/tmp/cap"), eq(0))
            .returning(|path, _| Err(RemoteError::command(path, "No such file or directory")));
        shell
            .expect_fetch_new_data()
            .with(eq("/tmp/link"), eq(0))
            .returning(|_, _| Ok(b"Connection established\n".to_vec()));

        let mut poller = DualStreamPoller::with_paths("/tmp/cap", "/tmp/link");
        let mut engine = DetectionEngine::new();
        let cycle = poller.poll(&mut shell, &mut engine).unwrap();

        assert_eq!(cycle.skipped.len(), 1);
        assert_eq!(cycle.skipped[0].0, StreamSource::Capture);
        assert_eq!(poller.offset(StreamSource::Capture), 0);
        assert!(cycle.detected);
        assert_eq!(engine.event().unwrap().source, StreamSource::LinkLog);
    }

    #[test]
    fn test_lost_session_is_returned() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_fetch_new_data()
            .returning(|_, _| Err(RemoteError::Disconnected));

        let mut poller = DualStreamPoller::with_paths("/tmp/cap", "/tmp/link");
        let mut engine = DetectionEngine::new();
        let err = poller.poll(&mut shell, &mut engine).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(poller.offset(StreamSource::Capture), 0);
    }

    #[test]
    fn test_lines_reach_engine_in_file_order() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_fetch_new_data()
            .with(eq("/tmp/cap"), eq(0))
            .returning(|_, _| Ok(b"noise\nSCIXB START\nVOOT\n".to_vec()));
        shell
            .expect_fetch_new_data()
            .with(eq("/tmp/link"), eq(0))
            .returning(|_, _| Ok(Vec::new()));

        let mut poller = DualStreamPoller::with_paths("/tmp/cap", "/tmp/link");
        let mut engine = DetectionEngine::new();
        let cycle = poller.poll(&mut shell, &mut engine).unwrap();

        assert_eq!(cycle.lines.len(), 3);
        assert_eq!(engine.event().unwrap().line, "SCIXB START");
        assert_eq!(engine.lines_scanned(), 2);
    }
}
