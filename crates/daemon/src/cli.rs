use clap::{Parser, Subcommand};

/// Change-propagation and reconciliation daemon for the ledger.
#[derive(Parser, Debug)]
#[command(name = "ledgersync-daemon", version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Poll the audit log and enqueue a job per routed row.
    Poller,

    /// Run the job workers.
    Worker {
        /// Number of concurrent workers (overrides WORKER_CONCURRENCY).
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        concurrency: Option<u16>,
    },

    /// Print the validated routing table and exit.
    Routes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_concurrency_is_optional() {
        let args = Args::try_parse_from(["ledgersync-daemon", "worker"]).unwrap();
        assert_eq!(args.command, Command::Worker { concurrency: None });

        let args =
            Args::try_parse_from(["ledgersync-daemon", "worker", "--concurrency", "8"]).unwrap();
        assert_eq!(args.command, Command::Worker { concurrency: Some(8) });
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(Args::try_parse_from(["ledgersync-daemon", "worker", "--concurrency", "0"]).is_err());
    }

    #[test]
    fn a_subcommand_is_required() {
        assert!(Args::try_parse_from(["ledgersync-daemon"]).is_err());
    }
}
