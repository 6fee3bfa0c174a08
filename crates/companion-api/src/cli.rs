//! Command-line interface definitions.

use clap::{Parser, Subcommand};

/// Companion -- conversational agent server.
#[derive(Parser)]
#[command(name = "companion", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "COMPANION_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on.
        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },
}

impl Cli {
    /// Default log directives for the chosen verbosity.
    pub fn log_directives(&self) -> &'static str {
        match self.verbose {
            0 => "warn,companion=info",
            1 => "info,companion=debug",
            _ => "trace",
        }
    }
}
