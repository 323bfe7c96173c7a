//! Protocol Showcase - identity protocol execution engine

use std::io;
use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tracing::{error, info};

use protocol_showcase::{
    Showcase,
    cli::{Cli, Command, OutputFormat},
    config::Config,
    idp::{generate_pkce, presets},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Presets { format }) => report(print_presets(format)),
        Some(Command::Pkce) => report(print_pkce()),
        Some(Command::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "protocol-showcase", &mut io::stdout());
            ExitCode::SUCCESS
        }
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

fn report(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Print demo users and clients
fn print_presets(format: OutputFormat) -> anyhow::Result<()> {
    let presets = presets::presets();
    let out = match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(&presets).context("serializing presets to JSON")?
        }
        OutputFormat::Yaml => {
            serde_yaml::to_string(&presets).context("serializing presets to YAML")?
        }
    };
    println!("{out}");
    Ok(())
}

/// Print a fresh PKCE pair
fn print_pkce() -> anyhow::Result<()> {
    let pair = generate_pkce();
    println!(
        "{}",
        serde_json::to_string_pretty(&pair).context("serializing PKCE pair")?
    );
    Ok(())
}

async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        issuer = %config.idp.issuer,
        "Starting protocol showcase"
    );

    let showcase = match Showcase::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to assemble showcase: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = showcase.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
