use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::host::HostConfig;
use crate::report::ReportStyle;

/// Test Agent relay - runs tests inside a host app and reports the verdict
#[derive(Parser, Debug)]
#[command(name = "test-agent-relay")]
pub struct Args {
    /// Test files or directories to run
    #[arg(required = true, value_name = "TEST_FILE_OR_DIR")]
    pub tests: Vec<String>,

    /// Path to the host binary (or set TEST_AGENT_BINARY)
    #[arg(long, env = "TEST_AGENT_BINARY")]
    pub binary: Option<PathBuf>,

    /// Path to the profile directory (or set TEST_AGENT_PROFILE)
    #[arg(long, env = "TEST_AGENT_PROFILE")]
    pub profile: Option<PathBuf>,

    /// Bind address the Test Agent connects back to
    #[arg(long, env = "TEST_AGENT_LISTEN", default_value = "127.0.0.1:8789")]
    pub listen: String,

    /// App launched inside the host
    #[arg(long, default_value = "Test Agent")]
    pub runapp: String,

    /// Seconds to wait for the host to start before accepting connections
    #[arg(long, env = "TEST_AGENT_STARTUP_DELAY", default_value_t = 15)]
    pub startup_delay: u64,

    /// Seconds to wait for the Test Agent to connect
    #[arg(long, env = "TEST_AGENT_CONNECT_TIMEOUT", default_value_t = 120)]
    pub connect_timeout: u64,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportStyle::Tbpl)]
    pub reporter: ReportStyle,

    /// Do not launch a host; wait for an externally started one
    #[arg(long)]
    pub no_launch: bool,
}

/// Validated relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub tests: Vec<String>,
    pub listen: SocketAddr,
    pub connect_timeout: Duration,
    pub report_style: ReportStyle,
    /// None when the host is managed externally
    pub host: Option<HostConfig>,
}

impl Args {
    pub fn into_config(self) -> Result<RelayConfig, ConfigError> {
        if self.tests.is_empty() {
            return Err(ConfigError::missing_field("tests"));
        }

        let listen: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| ConfigError::invalid_value("listen", format!("{e}")))?;

        if self.connect_timeout == 0 {
            return Err(ConfigError::invalid_value(
                "connect_timeout",
                "must be greater than zero",
            ));
        }

        let host = if self.no_launch {
            None
        } else {
            let binary = self.binary.ok_or_else(|| ConfigError::missing_field("binary"))?;
            let profile = self
                .profile
                .ok_or_else(|| ConfigError::missing_field("profile"))?;
            Some(HostConfig {
                binary,
                profile,
                app_name: self.runapp,
                startup_delay: Duration::from_secs(self.startup_delay),
            })
        };

        Ok(RelayConfig {
            tests: self.tests,
            listen,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            report_style: self.reporter,
            host,
        })
    }
}
