use std::{path::PathBuf, process::exit, time::Duration};

use clap::Parser;
use rusqlite::Connection;

use fintrack_rs::{AppState, Config, setup_logging, shutdown_signal};

/// The background service for fintrack_rs.
///
/// Opens the database, starts the occurrence and reminder pollers and runs
/// until it receives ctrl+c or the terminate signal.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File path to the application SQLite database.
    #[arg(long)]
    db_path: PathBuf,

    /// Poll every minute instead of every hour.
    #[arg(long, env = "DEV")]
    dev: bool,

    /// Also write debug logs to this file.
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Override the deadline, in seconds, for a single operation.
    #[arg(long)]
    request_deadline_secs: Option<u64>,

    /// Override the deadline, in seconds, shared by all units of one scan.
    #[arg(long)]
    batch_deadline_secs: Option<u64>,

    /// Override the time, in seconds, between two scans.
    #[arg(long)]
    poll_period_secs: Option<u64>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = if self.dev {
            Config::dev()
        } else {
            Config::default()
        };

        if let Some(seconds) = self.request_deadline_secs {
            config.request_deadline = Duration::from_secs(seconds);
        }

        if let Some(seconds) = self.batch_deadline_secs {
            config.batch_deadline = Duration::from_secs(seconds);
        }

        if let Some(seconds) = self.poll_period_secs {
            config.poll_period = Duration::from_secs(seconds);
        }

        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(error) = setup_logging(args.log_path.as_deref()) {
        eprintln!("Could not set up logging: {error}");
        exit(1);
    }

    let config = args.config();

    if config.poll_period.is_zero() {
        tracing::error!("The poll period must be greater than zero.");
        exit(1);
    }

    let connection = match Connection::open(&args.db_path) {
        Ok(connection) => connection,
        Err(error) => {
            tracing::error!("Could not open the database at {:?}: {error}", args.db_path);
            exit(1);
        }
    };

    let state = match AppState::new(connection, config) {
        Ok(state) => state,
        Err(error) => {
            tracing::error!("Could not initialize the database: {error}");
            exit(1);
        }
    };

    tracing::info!("Starting with {config:?}");
    let pollers = state.start_pollers();

    shutdown_signal().await;

    tracing::info!("Shutting down...");
    pollers.stop().await;
}
