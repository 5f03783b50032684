//! Handshake token detection
//!
//! Lines from either remote stream are checked for a small fixed set of
//! literal tokens. The first match latches and later input is ignored.

use super::poller::StreamSource;
use serde::{Deserialize, Serialize};

/// Start-of-session marker written by the console
pub const START_MARKER: &str = "SCIXB START";
/// Named link protocol
pub const PROTOCOL_TOKEN: &str = "SCIXB";
/// Alternate protocol name seen in link program output
pub const ALT_PROTOCOL_TOKEN: &str = "VOOT";
/// Link program's own success message
pub const ESTABLISHED_PHRASE: &str = "Connection established";

/// Tokens checked, in order, against every line (case-sensitive)
pub const HANDSHAKE_TOKENS: [&str; 4] = [
    START_MARKER,
    PROTOCOL_TOKEN,
    ALT_PROTOCOL_TOKEN,
    ESTABLISHED_PHRASE,
];

/// The first line that matched a handshake token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// The triggering line, trimmed
    pub line: String,
    /// Stream the line came from
    pub source: StreamSource,
    /// Token found in the line
    pub token: String,
    /// Poll cycle (1-based) during which the line was read
    pub cycle: u64,
}

/// Scans lines for handshake tokens and latches on the first match
#[derive(Debug, Clone)]
pub struct DetectionEngine {
    tokens: Vec<String>,
    event: Option<DetectionEvent>,
    lines_scanned: u64,
}

impl Default for DetectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionEngine {
    /// Engine with the standard handshake tokens
    pub fn new() -> Self {
        Self::with_tokens(HANDSHAKE_TOKENS.iter().copied())
    }

    /// Engine with a custom token set
    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
            event: None,
            lines_scanned: 0,
        }
    }

    /// First token contained in `line`, if any
    pub fn matching_token(&self, line: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|token| line.contains(token.as_str()))
            .map(String::as_str)
    }

    /// Check one line. Returns `true` only when this line latched the event.
    pub fn scan(&mut self, line: &str, source: StreamSource, cycle: u64) -> bool {
        if self.event.is_some() {
            return false;
        }
        self.lines_scanned += 1;

        let Some(token) = self.matching_token(line).map(str::to_string) else {
            return false;
        };

        tracing::debug!(%source, %token, cycle, "Handshake token matched");
        self.event = Some(DetectionEvent {
            line: line.to_string(),
            source,
            token,
            cycle,
        });
        true
    }

    /// Has a token been seen
    pub fn is_detected(&self) -> bool {
        self.event.is_some()
    }

    /// The latched event
    pub fn event(&self) -> Option<&DetectionEvent> {
        self.event.as_ref()
    }

    /// Lines checked before the latch
    pub fn lines_scanned(&self) -> u64 {
        self.lines_scanned
    }

    /// Tokens in use
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Clear the latch for a new session
    pub fn reset(&mut self) {
        self.event = None;
        self.lines_scanned = 0;
    }
}
