use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wsrpc::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so results on stdout stay pipeable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cli::run(cli).await
}
