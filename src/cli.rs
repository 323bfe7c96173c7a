//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

/// Identity protocol showcase - OAuth 2.0, OIDC, SAML and SPIFFE against a mock IdP
#[derive(Parser, Debug)]
#[command(name = "protocol-showcase")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SHOWCASE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "SHOWCASE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SHOWCASE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SHOWCASE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SHOWCASE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the showcase server (default)
    Serve,

    /// Print the demo users and clients
    Presets {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },

    /// Generate a PKCE verifier and S256 challenge
    Pkce,

    /// Generate shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Structured output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// YAML
    Yaml,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_is_default() {
        let cli = Cli::try_parse_from(["protocol-showcase", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn presets_format_parses() {
        let cli = Cli::try_parse_from(["protocol-showcase", "presets", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Presets {
                format: OutputFormat::Json
            })
        ));
    }
}
