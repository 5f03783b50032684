//! Core module containing the cable test machinery
//!
//! This module provides:
//! - Remote shell abstraction and the SSH implementation
//! - Relay provisioning (cleanup, capture program, link program)
//! - Incremental polling of the two remote streams
//! - Handshake token detection
//! - Session controller with state machine
//! - Event log with live subscribers
//! - Native serial capture

pub mod capture;
pub mod detection;
pub mod logger;
pub mod poller;
pub mod provision;
pub mod session;
pub mod state_machine;
pub mod transport;
