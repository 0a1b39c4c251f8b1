//! modelgate - multi-tenant AI model gateway

#![allow(missing_docs)]

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gateway", about = "OpenAI-compatible AI model gateway")]
struct Args {
    /// Path to the gateway configuration file
    #[arg(
        short,
        long,
        env = "GATEWAY_CONFIG",
        default_value = "config/gateway.yaml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let args = Args::parse();

    let config = match modelgate::Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config {}: {}", args.config, e);
            return ExitCode::FAILURE;
        }
    };

    match modelgate::server::run_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Display (not Debug) to preserve newlines
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
