//! Test Agent relay.
//!
//! Launches a host running the Test Agent app, hands it a list of tests over a
//! WebSocket and reduces the reporter events it streams back into a report
//! and an exit status.

pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod server;
pub mod session;

pub use registry::RunStatus;
pub use server::RelayServer;
pub use session::{Report, SessionOutcome};
