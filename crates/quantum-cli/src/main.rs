//! quantum-merge: speculative CI scheduling for stacked pull requests.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "quantum-merge")]
#[command(about = "Speculative merge queue scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and its HTTP API
    Serve {
        /// Path to the configuration file
        #[arg(short, long, env = "QUANTUM_MERGE_CONFIG")]
        config: Option<PathBuf>,
        /// Address to listen on, overriding the configuration
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Number of workers, overriding the configuration
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file; searched for when omitted
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            workers,
        } => {
            commands::serve::run(commands::serve::ServeArgs {
                config,
                listen,
                workers,
            })
            .await?;
        }
        Commands::Validate { path } => {
            commands::validate(path.as_deref())?;
        }
    }

    Ok(())
}
