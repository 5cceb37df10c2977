use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use test_agent_relay::config::Args;
use test_agent_relay::host::{self, DesktopLauncher, HostHandle, HostProcess};
use test_agent_relay::{RelayServer, RunStatus, SessionOutcome};

/// Exit code when the run could not be set up at all
const EXIT_SETUP_FAILURE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr, the report to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(status) => ExitCode::from(status.exit_code() as u8),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<RunStatus> {
    let config = args.into_config().context("Invalid configuration")?;

    // Bind first so a busy port fails before the host is started
    let server = RelayServer::bind(
        config.listen,
        config.tests.clone(),
        config.report_style.format(),
        config.connect_timeout,
    )
    .await
    .context("Failed to start server")?;

    let mut host: Option<Box<dyn HostHandle>> = match &config.host {
        Some(host_config) => {
            let mut handle = DesktopLauncher
                .launch(host_config)
                .context("Failed to launch host")?;
            host::wait_ready(handle.as_mut(), host_config.startup_delay)
                .await
                .context("Host did not become ready")?;
            Some(handle)
        }
        None => {
            warn!("Not launching a host (--no-launch); waiting for an external Test Agent");
            None
        }
    };

    let outcome = tokio::select! {
        outcome = server.run() => outcome.context("Server failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            SessionOutcome::Aborted { reason: "interrupted".to_string() }
        }
    };

    match &outcome {
        SessionOutcome::Completed { report, .. } => print!("{report}"),
        SessionOutcome::Aborted { reason } => error!("Run aborted: {reason}"),
    }

    if let Some(host) = host.as_mut() {
        host.teardown();
    }

    let status = outcome.status();
    info!("Finished with {:?} (exit code {})", status, status.exit_code());
    Ok(status)
}
