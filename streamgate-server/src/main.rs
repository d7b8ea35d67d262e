//! Entry point for the streamgate edge instance.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;

use streamgate_shared::config::Config;

/// CLI for the streamgate edge server.
#[derive(Parser)]
#[command(name = "streamgate-server")]
#[command(about = "Stateless streaming chat edge instance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the edge instance.
    Serve {
        /// Override SERVER_PORT from the environment.
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let mut config = Config::from_env()?;
            if let Some(port) = port {
                config.server.port = port;
            }
            streamgate_server::server::run(config).await
        }
    }
}
