mod config;
mod server;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "cairn media server control plane")]
struct Args {
    /// Config file; defaults to $XDG_CONFIG_HOME/cairn/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "cairn=info,libcairn=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = config::ServerConfig::load(args.config.as_deref())?;
    server::run(config).await
}
