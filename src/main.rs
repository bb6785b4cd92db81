//! Thin binary shell: argument parsing, config load, logging setup

use airplay_multiroom::{Config, MultiroomServer, ServerError};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "airplay-multiroom", version, about = "Multi-room AirPlay audio server")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let server = match MultiroomServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{e}");
            return exit_code(&e);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "signal handler failed");
    }
    server.shutdown().await;
    ExitCode::SUCCESS
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, ServerError> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ServerError::Config(airplay_multiroom::ConfigError::Load(format!(
            "{}: {e}",
            path.display()
        )))
    })?;
    Config::from_yaml(&raw).map_err(ServerError::Config)
}

fn exit_code(error: &ServerError) -> ExitCode {
    u8::try_from(error.exit_code()).map_or(ExitCode::FAILURE, ExitCode::from)
}
