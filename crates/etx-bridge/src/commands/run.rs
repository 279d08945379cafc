//! `run`: start the bridge and hold it until a signal or a fatal error.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{info, warn};

use etx_bridge_core::{BridgeController, BridgeState, MemoryTransport};

use crate::cli::{GlobalOpts, OutputFormat, RunArgs};
use crate::config;
use crate::error::CliError;
use crate::output;

/// Why the run loop returned.
enum Exit {
    Signal,
    Elapsed,
    Failed(String),
}

pub async fn handle(args: &RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let bridge_config = config::build_bridge_config(global)?;

    let controller = if args.dry_run {
        info!("dry run: publishing to an in-process transport");
        BridgeController::with_transport(bridge_config, Arc::new(MemoryTransport::new()))
    } else {
        BridgeController::new(bridge_config)
    };

    controller.start().await?;

    let exit = wait_for_exit(&controller, args.duration.map(Duration::from_secs)).await;
    match exit {
        Exit::Signal => info!("shutdown requested"),
        Exit::Elapsed => info!("run duration elapsed"),
        Exit::Failed(ref reason) => warn!(reason = %reason, "bridge failed, shutting down"),
    }

    controller.stop().await;
    output::print_output(
        &output::render_json(OutputFormat::JsonCompact, &controller.state())?,
        global.quiet,
    );

    match exit {
        Exit::Failed(message) => Err(CliError::Runtime { message }),
        Exit::Signal | Exit::Elapsed => Ok(()),
    }
}

async fn wait_for_exit(controller: &BridgeController, limit: Option<Duration>) -> Exit {
    let mut states = controller.state_stream();
    let failed = async {
        match states
            .wait_for(|s| matches!(s, BridgeState::Error(_)))
            .await
        {
            Some(BridgeState::Error(reason)) => reason,
            _ => "state channel closed".to_owned(),
        }
    };
    let elapsed = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = shutdown_signal() => Exit::Signal,
        () = elapsed => Exit::Elapsed,
        reason = failed => Exit::Failed(reason),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C (non-fatal)");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM (non-fatal)");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
