//! udstool - ISO-TP / UDS request-response tester
//!
//! Sends diagnostic requests through an ISO-TP channel to a simulated ECU
//! and prints the responses together with the protocol trace.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{parse_can_id, Config, Overrides};

#[derive(Parser)]
#[command(name = "udstool")]
#[command(author, version, about = "ISO-TP / UDS request-response tester")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "UDSTOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Request CAN ID (tester -> ECU), e.g. 0x7E0
    #[arg(long, value_parser = parse_can_id)]
    request_id: Option<u32>,

    /// Response CAN ID (ECU -> tester), e.g. 0x7E8
    #[arg(long, value_parser = parse_can_id)]
    response_id: Option<u32>,

    /// Exchange timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Use 64-byte CAN-FD frames
    #[arg(long)]
    fd: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one or more requests and print the responses
    Send {
        /// Request payloads as hex, e.g. "22 F1 90" or 3E00
        #[arg(required = true)]
        requests: Vec<String>,

        /// Print the frame-level protocol trace
        #[arg(long)]
        trace: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("udstool=debug,udstool_isotp=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load config file, then let flags win
    let config = Config::load(cli.config.as_deref())?.merge_with_args(&Overrides {
        request_id: cli.request_id,
        response_id: cli.response_id,
        timeout_ms: cli.timeout_ms,
        fd: cli.fd,
    })?;
    tracing::debug!(?config, "Configuration loaded");

    match &cli.command {
        Commands::Send { requests, trace } => {
            commands::send(&config, requests, *trace).await?;
        }

        Commands::Config => {
            commands::show_config(&config)?;
        }
    }

    Ok(())
}
