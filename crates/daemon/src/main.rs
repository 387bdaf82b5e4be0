use anyhow::Context;
use clap::Parser;

use ledgersync_daemon::cli::{Args, Command};
use ledgersync_infra::config::SyncConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();
    ledgersync_observability::init();

    let args = Args::parse();
    match args.command {
        Command::Routes => ledgersync_daemon::print_routes(),
        Command::Poller => {
            let config = SyncConfig::from_env().context("invalid configuration")?;
            ledgersync_daemon::run_poller(config).await
        }
        Command::Worker { concurrency } => {
            let config = SyncConfig::from_env().context("invalid configuration")?;
            ledgersync_daemon::run_worker(config, concurrency.map(usize::from)).await
        }
    }
}
