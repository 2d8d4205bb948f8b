//! Entrypoint of the largo server binary.

use clap::Parser;
use observability_deps::tracing::error;
use std::path::PathBuf;

mod commands {
    pub mod run;
}
mod config;
mod http;
mod wiring;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid http bind address {addr}")]
    BadBindAddress { addr: String },

    #[error("cannot prepare data dir {path}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("object store setup failed: {source}")]
    ObjectStore {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("wal replay failed: {0}")]
    Replay(#[source] ingester::Error),

    #[error("http server error: {source}")]
    Serve { source: hyper::Error },
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "largo",
    about = "A multi-tenant distributed tracing backend on object storage",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run server components.
    Run(commands::run::Config),
}

fn init_logging() {
    // RUST_LOG-driven; defaults to info
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(config) => commands::run::command(config).await,
    };
    if let Err(e) = result {
        error!(error=%e, "largo exited with error");
        std::process::exit(1);
    }
}
