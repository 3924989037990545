use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chainwatch_common::error::{ReportExt, Result};
use chainwatch_node::service::{self, WatchCmd};

#[derive(Parser, Debug)]
#[command(author, version, about = "content-addressed blockchain watcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    subcommand: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync, serve, and backfill chain data against a content-addressed
    /// store and relational index.
    Watch(WatchCmd),
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Cli::parse();
    run_with_args(args).await.to_exit_code()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_with_args(args: Cli) -> Result<()> {
    match args.subcommand {
        Command::Watch(args) => service::run(args).await,
    }
}
