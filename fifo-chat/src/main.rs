use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use fifo_chat::{
    broker::{Broker, BrokerConfig},
    cli::{Cli, Command},
    client,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => {
            let broker = Broker::open(&args.inbox, BrokerConfig::from(&args))?;
            info!("broker ready on {}", args.inbox.display());
            if let Err(err) = broker.run_until_signal().await {
                warn!("broker exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
