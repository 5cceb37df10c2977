//! Connection-scoped session state machine.
//!
//! A [`SessionController`] is created fresh for each accepted connection. It
//! never touches the socket itself: the server feeds it frames and acts on the
//! [`SessionOutcome`] it returns.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::protocol::{self, EVENT_SET_TEST_ENVS, EVENT_TEST_DATA};
use crate::registry::{EnvironmentRegistry, RouteOutcome, RunStatus};
use crate::report::ReportFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Running,
    Completing,
    Closed,
}

/// Buffered output of one environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSection {
    pub env_id: String,
    pub lines: Vec<String>,
}

/// Final per-environment report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub sections: Vec<ReportSection>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            writeln!(f)?;
            writeln!(f, "test report: ({})", section.env_id)?;
            writeln!(f, "{}", section.lines.join("\n"))?;
        }
        Ok(())
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every declared environment ended
    Completed { status: RunStatus, report: Report },
    /// The transport went away first
    Aborted { reason: String },
}

impl SessionOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { status, .. } => *status,
            Self::Aborted { .. } => RunStatus::Aborted,
        }
    }
}

pub struct SessionController {
    tests: Vec<String>,
    state: SessionState,
    registry: EnvironmentRegistry,
}

impl SessionController {
    pub fn new(tests: Vec<String>, format: Arc<dyn ReportFormat>) -> Self {
        Self {
            tests,
            state: SessionState::Connecting,
            registry: EnvironmentRegistry::new(format),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    /// Connection is open: move to `Running` and return the `run tests` frame.
    pub fn open(&mut self) -> Option<String> {
        if self.state != SessionState::Connecting {
            warn!("Session already opened (state={:?})", self.state);
            return None;
        }

        self.state = SessionState::Running;
        info!("Requesting {} test(s)", self.tests.len());
        Some(protocol::run_tests_command(&self.tests))
    }

    /// Process one inbound text frame.
    ///
    /// Returns the outcome when this frame completed the run.
    pub fn handle_message(&mut self, text: &str) -> Option<SessionOutcome> {
        if self.state != SessionState::Running {
            debug!("Ignoring message in state {:?}", self.state);
            return None;
        }

        let message = match protocol::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping message: {e}");
                return None;
            }
        };

        match message.event.as_str() {
            EVENT_SET_TEST_ENVS => {
                match protocol::decode_env_ids(&message.data) {
                    Ok(ids) => self.registry.declare_pending(ids),
                    Err(e) => warn!("Dropping message: {e}"),
                }
                None
            }
            EVENT_TEST_DATA => {
                let nested = match protocol::decode_nested(&message.data) {
                    Ok(nested) => nested,
                    Err(e) => {
                        warn!("Dropping message: {e}");
                        return None;
                    }
                };

                match self.registry.route(&nested) {
                    RouteOutcome::AllComplete => Some(self.complete()),
                    RouteOutcome::Routed | RouteOutcome::Dropped => None,
                }
            }
            other => {
                debug!("Ignoring event: {other}");
                None
            }
        }
    }

    /// The transport closed. Aborts the run unless it already completed.
    pub fn transport_closed(&mut self) -> Option<SessionOutcome> {
        let previous = self.state;
        self.state = SessionState::Closed;

        match previous {
            SessionState::Connecting | SessionState::Running => {
                warn!(
                    "Connection closed with {} environment(s) still pending",
                    self.registry.pending().len()
                );
                Some(SessionOutcome::Aborted {
                    reason: "connection closed before all environments finished".to_string(),
                })
            }
            SessionState::Completing | SessionState::Closed => None,
        }
    }

    /// The server has closed the transport after completion.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Build the outcome and move to `Completing`.
    ///
    /// The session stays `Completing` until the server has closed the socket
    /// and calls [`close`](Self::close).
    fn complete(&mut self) -> SessionOutcome {
        self.state = SessionState::Completing;

        let sections = self
            .registry
            .environments()
            .filter(|acc| !acc.output().is_empty())
            .map(|acc| ReportSection {
                env_id: acc.env_id().to_string(),
                lines: acc.output().to_vec(),
            })
            .collect();

        let status = self.registry.run_status();
        info!("All environments finished ({:?})", status);

        SessionOutcome::Completed {
            status,
            report: Report { sections },
        }
    }
}
