//! PhishGuard CLI
//!
//! Explain analysis results and maintain the explanation cache.
//!
//! # Commands
//!
//! - `explain-url`: Explain a URL analysis result
//! - `explain-email`: Interpret an email header analysis
//! - `reconcile`: Collapse duplicate records and rebuild the index
//! - `evict`: Apply count, size and age bounds now
//! - `list`: Show cached records
//! - `stats`: Show cache counters after startup reconciliation
//!
//! Exit code 1 on any error. Logs go to stderr, results to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

/// PhishGuard - explanations for phishing analysis results
#[derive(Parser)]
#[command(name = "phishguard")]
#[command(version)]
#[command(about = "Generate and cache explanations for phishing analysis results")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (.yaml, .yml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explain a URL analysis result
    ExplainUrl {
        /// URL that was analyzed
        url: String,

        /// Analysis result as JSON
        #[arg(short, long, default_value = "{}")]
        analysis: String,
    },

    /// Interpret an email header analysis
    ExplainEmail {
        /// File holding the raw headers (stdin when omitted)
        #[arg(long)]
        headers: Option<PathBuf>,

        /// Analysis result as JSON
        #[arg(short, long, default_value = "{}")]
        analysis: String,
    },

    /// Collapse duplicate records and rebuild the index
    Reconcile,

    /// Apply count, size and age bounds now
    Evict,

    /// Show cached records, newest first
    List {
        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show cache counters
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::ExplainUrl { url, analysis } => {
            commands::explain_url(cli.config.as_deref(), &url, &analysis).await
        }
        Commands::ExplainEmail { headers, analysis } => {
            commands::explain_email(cli.config.as_deref(), headers.as_deref(), &analysis).await
        }
        Commands::Reconcile => commands::reconcile(cli.config.as_deref()).await,
        Commands::Evict => commands::evict(cli.config.as_deref()).await,
        Commands::List { json } => commands::list(cli.config.as_deref(), json).await,
        Commands::Stats => commands::stats(cli.config.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_explain_url() {
        let cli = Cli::try_parse_from([
            "phishguard",
            "-vv",
            "explain-url",
            "https://bank-example.com/login",
            "--analysis",
            r#"{"risk_score": 91}"#,
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::ExplainUrl { url, analysis } => {
                assert_eq!(url, "https://bank-example.com/login");
                assert!(analysis.contains("risk_score"));
            }
            _ => panic!("expected explain-url"),
        }
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["phishguard", "list", "--json", "--config", "cache.yaml"])
            .unwrap();
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("cache.yaml")));
        assert!(matches!(cli.command, Commands::List { json: true }));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
