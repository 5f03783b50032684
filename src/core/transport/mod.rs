//! Remote session layer
//!
//! A [`Connector`] opens a [`RemoteShell`] on the relay device. The shell
//! runs commands, uploads text files and reads file tails by byte offset.
//! The SSH-2 implementation lives in [`ssh`].

mod ssh;

pub use ssh::{SshConnection, SshConnector};

use crate::config::TestConfiguration;
use std::time::Duration;
use thiserror::Error;

/// Failures opening a session. All of them are fatal for a test run.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Credential rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Host unreachable, connection refused, handshake broken
    #[error("Network error: {0}")]
    Network(String),

    /// No response within the connect timeout
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// Configuration cannot be used to connect
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Failures of operations on an open session
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Session-level failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Session already closed or lost
    #[error("Not connected")]
    Disconnected,

    /// The remote command could not be run or its output not retrieved
    #[error("Command `{command}` failed: {message}")]
    Command {
        /// Command line
        command: String,
        /// What went wrong
        message: String,
    },

    /// I/O error on the channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Connection-level failures abort the session; everything else is
    /// absorbed by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Disconnected)
    }

    /// Convenience constructor for command failures
    pub fn command(command: &str, message: impl ToString) -> Self {
        Self::Command {
            command: command.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
    /// Exit status reported by the remote shell
    pub exit_status: i32,
}

impl CommandOutput {
    /// Output of a command that exited with status 0
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_status: 0,
        }
    }

    /// Exit status 0
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An open remote session.
///
/// All calls block the calling thread until the remote side answers or the
/// session times out.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteShell: Send {
    /// Run a command through the remote POSIX shell
    fn execute(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Write `content` to the remote file `path`, replacing it.
    ///
    /// Returns once the remote writer has seen end of input and exited.
    fn upload(&mut self, path: &str, content: &str) -> Result<(), RemoteError>;

    /// Bytes of `path` from byte `offset` to its current end.
    ///
    /// A missing or unreadable file is a `RemoteError::Command`.
    fn fetch_new_data(&mut self, path: &str, offset: u64) -> Result<Vec<u8>, RemoteError>;

    /// Close the session. Closing an already-closed session is a no-op.
    fn close(&mut self);
}

/// Opens remote sessions
pub trait Connector: Send + Sync {
    /// Open a session to the relay described by `config`
    fn open(
        &self,
        config: &TestConfiguration,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, ConnectionError>;
}

/// Shell-quote a single argument for the remote POSIX shell
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:+,@".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// `tail` invocation reading `path` from byte `offset` (0-based)
pub fn tail_from_offset_command(path: &str, offset: u64) -> String {
    format!("tail -c +{} {}", offset + 1, shell_quote(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/dev/ttyUSB0"), "/dev/ttyUSB0");
        assert_eq!(shell_quote("com=/dev/ttyUSB0"), "com=/dev/ttyUSB0");
        assert_eq!(shell_quote("my file"), "'my file'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_tail_command_is_one_based() {
        assert_eq!(
            tail_from_offset_command("/tmp/serial_data.txt", 0),
            "tail -c +1 /tmp/serial_data.txt"
        );
        assert_eq!(
            tail_from_offset_command("/tmp/link_output.log", 41),
            "tail -c +42 /tmp/link_output.log"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RemoteError::Disconnected.is_fatal());
        assert!(RemoteError::from(ConnectionError::Network("reset".into())).is_fatal());
        assert!(!RemoteError::command("tail", "No such file").is_fatal());
        assert!(!RemoteError::Io(std::io::Error::other("x")).is_fatal());
    }
}
