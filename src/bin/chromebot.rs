//! Chromebot server CLI.
//!
//! Starts the HTTP control surface backed by a real Chrome/Chromium
//! session.
//!
//! Usage examples:
//!   Launch a fresh browser:
//!     $ chromebot serve
//!   Attach to an already-running Chrome with an open debug port:
//!     $ chromebot serve --attach http://localhost:9222
//!   Headless on a custom port:
//!     $ CHROMEBOT_CHROME_BIN=/usr/bin/chromium chromebot serve --headless --port 9001

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use chromebot::config::{ChromebotConfig, Verbosity};
use chromebot::runtime::CdpDriver;
use chromebot::server;

#[derive(Parser)]
#[command(name = "chromebot", author, version, about = "Chromebot server utilities")]
struct Cli {
    /// Increase log verbosity (pass multiple times for DEBUG).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server in front of a persistent browser session.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Listen port (overrides CHROMEBOT_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Run the browser headless.
    #[arg(long)]
    headless: bool,

    /// Attach to an existing browser via its debug endpoint instead of
    /// launching a new one.
    #[arg(long, value_name = "ENDPOINT")]
    attach: Option<String>,

    /// Maximum number of concurrently open pages.
    #[arg(long, value_name = "N")]
    max_pages: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ChromebotConfig::from_env().context("failed to load configuration")?;
    config.verbose = match cli.verbose {
        0 => config.verbose,
        1 => Verbosity::Medium,
        _ => Verbosity::Detailed,
    };

    match cli.command {
        Command::Serve(args) => {
            if let Some(port) = args.port {
                config = config.with_port(port);
            }
            if args.headless {
                config = config.with_headless(true);
            }
            if let Some(endpoint) = args.attach {
                config = config.with_attach(endpoint);
            }
            if let Some(max_pages) = args.max_pages {
                config.max_concurrent_pages = max_pages;
            }

            server::serve(config, CdpDriver::new())
                .await
                .context("server exited with an error")?;
        }
    }

    Ok(())
}
