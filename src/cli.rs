//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ogpass - sgID identity broker for an OIDC authorization server
#[derive(Parser, Debug)]
#[command(name = "ogpass")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OGPASS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "OGPASS_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "OGPASS_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OGPASS_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OGPASS_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the HTTP server (default)
    Serve,

    /// Load and validate configuration, then print it with secrets redacted
    CheckConfig,
}
