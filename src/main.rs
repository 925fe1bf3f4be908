use std::{env, path::PathBuf, process::ExitCode};

use clap::Parser;
use geodns::{Config, Server};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about, version)]
struct Args {
    /// Path to the configuration file.
    config: Option<PathBuf>,
}

fn config_file(arg: Option<PathBuf>) -> PathBuf {
    if let Some(path) = arg {
        path
    } else if let Ok(value) = env::var("GEODNS_CONFIG") {
        PathBuf::from(value)
    } else {
        PathBuf::from("geodns.yaml")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config_file = config_file(args.config);

    let config = match Config::from_file(&config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to read configuration from {}: {e}", config_file.display());
            return ExitCode::FAILURE;
        }
    };

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
    tracing::info!("Read configuration from {}", config_file.display());

    let mut server = match Server::with_config(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start server");
            return ExitCode::FAILURE;
        }
    };

    let (mut sigterm, mut sighup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(sigterm), Ok(sighup)) => (sigterm, sighup),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to register signal handler");
            return ExitCode::FAILURE;
        }
    };

    loop {
        select! {
            _ = sigterm.recv() => {
                tracing::trace!("Saw SIGTERM");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to wait for interrupt");
                }
                break;
            }
            _ = sighup.recv() => {
                if let Err(e) = server.reopen_geodb() {
                    tracing::error!(error = %e, "Failed to reopen GeoIP database");
                }
            }
        }
    }

    server.shutdown().await;

    ExitCode::SUCCESS
}
