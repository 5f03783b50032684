//! CLI Module
//!
//! Exit codes for automation, derived from how a cable test ended.

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
