use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::broker::BrokerConfig;

pub const DEFAULT_SHARED_INBOX: &str = "/tmp/server_fifo";
pub const DEFAULT_FIFO_DIR: &str = "/tmp";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat broker, reading frames from the shared FIFO.
    Broker(BrokerArgs),
    /// Join the chat through the broker's shared FIFO.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Path of the shared FIFO every client writes to. Created if missing.
    #[arg(long, default_value = DEFAULT_SHARED_INBOX)]
    pub inbox: PathBuf,

    /// Forget a client after this many consecutive failed deliveries.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub evict_after: Option<u32>,
}

impl From<&BrokerArgs> for BrokerConfig {
    fn from(args: &BrokerArgs) -> Self {
        BrokerConfig {
            evict_after: args.evict_after,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Path of the broker's shared FIFO.
    #[arg(long, default_value = DEFAULT_SHARED_INBOX)]
    pub inbox: PathBuf,

    /// Directory where this client's private FIFO is created.
    #[arg(long, default_value = DEFAULT_FIFO_DIR)]
    pub fifo_dir: PathBuf,
}
