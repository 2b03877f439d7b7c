use clap::Parser;
use tracing_subscriber::EnvFilter;

mod apis;
mod cli;
mod config;
mod documents;
mod knowledge;
mod search;
mod server;

use cli::{Cli, Commands};
use config::Config;

/// `--debug` wins; otherwise RUST_LOG, falling back to `info` for the server
/// and `warn` for one-shot commands.
fn log_filter(cli: &Cli) -> EnvFilter {
    if cli.debug {
        return EnvFilter::new("debug");
    }
    let default = if cli.is_serve() { "info" } else { "warn" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the MCP protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&cli))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = Config::from_env();
    let command = cli.command.unwrap_or(Commands::Serve);
    if let Err(e) = cli::run(command, config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
