//! Per-environment result accumulation and report formats.

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use tracing::{debug, info};

use crate::protocol::{
    NestedEvent, NESTED_END, NESTED_FAIL, NESTED_PASS, NESTED_SUITE, NESTED_SUITE_END,
};

/// Renders reporter events as report lines.
pub trait ReportFormat: Send + Sync {
    fn name(&self) -> &'static str;

    fn pass_line(&self, full_title: &str) -> String;

    fn fail_line(&self, full_title: &str, error: Option<&str>) -> String;

    fn suite_start_line(&self, title: &str) -> String;

    fn suite_end_line(&self, title: &str) -> String;

    /// Closing lines for a finished environment. Must mention both counts.
    fn summary_lines(&self, passes: u64, failures: u64) -> Vec<String>;
}

/// TBPL-style lines, as read by tinderbox log parsers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tbpl;

impl ReportFormat for Tbpl {
    fn name(&self) -> &'static str {
        "tbpl"
    }

    fn pass_line(&self, full_title: &str) -> String {
        format!("TEST-PASS | {full_title}")
    }

    fn fail_line(&self, full_title: &str, error: Option<&str>) -> String {
        match error {
            Some(message) => format!("TEST-UNEXPECTED-FAIL | {full_title} | {message}"),
            None => format!("TEST-UNEXPECTED-FAIL | {full_title}"),
        }
    }

    fn suite_start_line(&self, title: &str) -> String {
        format!("TEST-START | {title}")
    }

    fn suite_end_line(&self, title: &str) -> String {
        format!("TEST-END | {title}")
    }

    fn summary_lines(&self, passes: u64, failures: u64) -> Vec<String> {
        vec![
            format!("Passed: {passes}"),
            format!("Failed: {failures}"),
            "Todo: 0".to_string(),
        ]
    }
}

/// Terse `ok` / `not ok` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain;

impl ReportFormat for Plain {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn pass_line(&self, full_title: &str) -> String {
        format!("ok {full_title}")
    }

    fn fail_line(&self, full_title: &str, error: Option<&str>) -> String {
        match error {
            Some(message) => format!("not ok {full_title} ({message})"),
            None => format!("not ok {full_title}"),
        }
    }

    fn suite_start_line(&self, title: &str) -> String {
        format!("# {title}")
    }

    fn suite_end_line(&self, title: &str) -> String {
        format!("# end {title}")
    }

    fn summary_lines(&self, passes: u64, failures: u64) -> Vec<String> {
        vec![format!("{passes} passed, {failures} failed")]
    }
}

/// Report format selectable from the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportStyle {
    #[default]
    Tbpl,
    Plain,
}

impl ReportStyle {
    pub fn format(self) -> Arc<dyn ReportFormat> {
        match self {
            Self::Tbpl => Arc::new(Tbpl),
            Self::Plain => Arc::new(Plain),
        }
    }
}

/// Pass/fail counters and buffered output for one environment.
pub struct ResultAccumulator {
    env_id: String,
    passes: u64,
    failures: u64,
    output: Vec<String>,
    format: Arc<dyn ReportFormat>,
}

impl fmt::Debug for ResultAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultAccumulator")
            .field("env_id", &self.env_id)
            .field("passes", &self.passes)
            .field("failures", &self.failures)
            .field("output", &self.output)
            .field("format", &self.format.name())
            .finish()
    }
}

impl ResultAccumulator {
    pub fn new(env_id: impl Into<String>, format: Arc<dyn ReportFormat>) -> Self {
        Self {
            env_id: env_id.into(),
            passes: 0,
            failures: 0,
            output: Vec::new(),
            format,
        }
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Fold one reporter event. Unknown events are ignored.
    pub fn fold(&mut self, event: &NestedEvent) {
        match event.event.as_str() {
            NESTED_SUITE => self.on_suite_start(event.title()),
            NESTED_SUITE_END => self.on_suite_end(event.title()),
            NESTED_PASS => self.on_pass(event.full_title()),
            NESTED_FAIL => self.on_fail(event.full_title(), event.error_message()),
            NESTED_END => self.on_end(),
            other => debug!(env = %self.env_id, event = other, "Ignoring reporter event"),
        }
    }

    pub fn on_suite_start(&mut self, title: &str) {
        info!(env = %self.env_id, "{}", self.format.suite_start_line(title));
    }

    pub fn on_suite_end(&mut self, title: &str) {
        info!(env = %self.env_id, "{}", self.format.suite_end_line(title));
    }

    pub fn on_pass(&mut self, full_title: &str) {
        self.passes += 1;
        self.output.push(self.format.pass_line(full_title));
    }

    pub fn on_fail(&mut self, full_title: &str, error: Option<&str>) {
        self.failures += 1;
        self.output.push(self.format.fail_line(full_title, error));
    }

    pub fn on_end(&mut self) {
        let summary = self.format.summary_lines(self.passes, self.failures);
        self.output.extend(summary);
    }

    /// Buffered output joined into one block.
    pub fn render(&self) -> String {
        self.output.join("\n")
    }
}
