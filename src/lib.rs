//! # Cabletest Core Library
//!
//! Remote tester for a Dreamcast serial link cable attached to a relay
//! device (typically a Raspberry Pi running the link program):
//! - Connects to the relay over SSH-2 (libssh2)
//! - Provisions a serial capture program and the link program
//! - Tails both outputs and reports the first handshake token
//!
//! ## Example
//!
//! ```rust,no_run
//! use cabletest_core::{TestConfiguration, TestOutcome, TestSession};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = TestConfiguration::new("192.168.1.50").credential("raspberry");
//!     let mut session = TestSession::ssh();
//!     let events = session.log().subscribe();
//!
//!     session.start(config)?;
//!     std::thread::spawn(move || {
//!         for entry in events {
//!             println!("{}", entry.to_text());
//!         }
//!     });
//!
//!     match session.wait() {
//!         Some(TestOutcome::Detected(event)) => println!("Cable works: {}", event.line),
//!         other => println!("No link: {:?}", other),
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{AppConfig, RemoteLayout, TestConfiguration, Timing};
pub use crate::core::capture::{CaptureConfig, CaptureStats};
pub use crate::core::detection::{DetectionEngine, DetectionEvent};
pub use crate::core::logger::{EventLog, LogEntry, LogFormat, Severity};
pub use crate::core::poller::{DualStreamPoller, StreamSource};
pub use crate::core::session::{CancellationToken, FailureKind, TestOutcome, TestSession};
pub use crate::core::state_machine::SessionState;
pub use crate::core::transport::{
    CommandOutput, ConnectionError, Connector, RemoteError, RemoteShell, SshConnector,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
