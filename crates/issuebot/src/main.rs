mod shutdown_signals;
mod startup;

use anyhow::Result;
use clap::Parser;
use issuebot_cli::Cli;
use tracing_subscriber::EnvFilter;

use crate::startup::run_bot;

/// `info` for issuebot, quieter HTTP and websocket internals; `RUST_LOG` wins when set.
const DEFAULT_LOG_DIRECTIVES: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,tungstenite=warn,tokio_tungstenite=warn";

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_bot(cli).await
}
