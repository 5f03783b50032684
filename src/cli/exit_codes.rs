//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::capture::CaptureError;
use crate::core::session::{FailureKind, StartError, TestOutcome};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success (handshake detected)
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed or lost
    pub const CONNECTION_FAILED: u8 = 3;

    /// Connection timeout
    pub const TIMEOUT: u8 = 4;

    /// Authentication failed
    pub const AUTH_FAILED: u8 = 5;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Monitoring window elapsed without a handshake
    pub const PATTERN_NOT_FOUND: u8 = 16;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Success without message
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Configuration problem
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<&TestOutcome> for CliResult {
    fn from(outcome: &TestOutcome) -> Self {
        match outcome {
            TestOutcome::Detected(event) => Self::success_with_message(format!(
                "Cable works: [{}] {}",
                event.source, event.line
            )),
            TestOutcome::TimedOut { elapsed } => Self::Error(
                ExitCodes::PATTERN_NOT_FOUND,
                format!("No data detected after {:.0}s", elapsed.as_secs_f32()),
            ),
            TestOutcome::Stopped => Self::Error(ExitCodes::CANCELLED, "Test stopped".to_string()),
            TestOutcome::Failed { kind, message } => {
                let code = match kind {
                    FailureKind::Authentication => ExitCodes::AUTH_FAILED,
                    FailureKind::Network | FailureKind::ConnectionLost => {
                        ExitCodes::CONNECTION_FAILED
                    }
                    FailureKind::Timeout => ExitCodes::TIMEOUT,
                    FailureKind::InvalidConfiguration => ExitCodes::CONFIG_ERROR,
                    FailureKind::Internal => ExitCodes::INTERNAL_ERROR,
                };
                Self::Error(code, message.clone())
            }
        }
    }
}

impl From<StartError> for CliResult {
    fn from(err: StartError) -> Self {
        let code = match &err {
            StartError::AlreadyRunning => ExitCodes::ERROR,
            StartError::InvalidConfiguration(_) => ExitCodes::CONFIG_ERROR,
            StartError::Spawn(_) => ExitCodes::INTERNAL_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::config_error(err.to_string())
    }
}

impl From<CaptureError> for CliResult {
    fn from(err: CaptureError) -> Self {
        let code = match &err {
            CaptureError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            CaptureError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            _ => ExitCodes::ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::ConnectionRefused => ExitCodes::CONNECTION_FAILED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Handshake detected, cable works",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Connection timeout",
        5 => "Authentication failed",
        7 => "Permission denied",
        8 => "Configuration error",
        11 => "Test stopped",
        14 => "Port not found",
        16 => "No data detected",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 5, 7, 8, 11, 14, 16, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
