// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! policy-replicator - replicate parent tenant policy to child tenants
//!
//! Runs the replication daemon until Ctrl-C (or SIGTERM on unix), or a
//! single cycle with `--once`. Exits non-zero on configuration errors and on
//! fatal engine errors.

use clap::Parser;
use policy_replication::{ReplicationConfig, ReplicationEngine, ShutdownHandle};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Replicate firewall policy from the PARENT tenant to every SUB* tenant
#[derive(Parser, Debug)]
#[command(name = "policy-replicator")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the tenant configuration file
    #[arg(short, long, env = "POLICY_REPLICATOR_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Run one cycle and exit
    #[arg(long)]
    once: bool,

    /// Log filter, used when RUST_LOG is unset
    #[arg(long, default_value = "policy_replication=info,policy_replicator=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match ReplicationConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut engine = ReplicationEngine::new(config);

    if args.once {
        return match engine.run_once().await {
            Ok(report) => {
                info!(
                    outcome = report.outcome(),
                    children = report.children.len(),
                    children_failed = report.children_failed(),
                    "Replication cycle finished"
                );
                if report.children_failed() > 0 {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(_) => ExitCode::FAILURE,
        };
    }

    tokio::spawn(wait_for_signal(engine.shutdown_handle()));

    match engine.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

async fn wait_for_signal(shutdown: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested, finishing current cycle");
    shutdown.shutdown();
}
