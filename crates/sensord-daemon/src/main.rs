//! sensord entry point.
//!
//! Starts the API socket server and registers the configured sensors.

use std::path::PathBuf;

use clap::Parser;
use sensord_daemon::logging::{LogFileLevel, setup_logging};
use sensord_daemon::{ConfigSource, DaemonError, ServiceOptions};
use tracing::{error, info};

/// sensord - presence sensor daemon
#[derive(Parser, Debug)]
#[command(name = "sensord")]
#[command(version, about, long_about = None)]
struct Args {
    /// Socket directory (defaults to `$XDG_RUNTIME_DIR/sensord`)
    #[arg(long, value_name = "PATH")]
    socket_dir: Option<PathBuf>,

    /// Only read configuration files from this directory
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// Level of the log file
    #[arg(long, value_enum, default_value_t = LogFileLevel::Info)]
    log_file_level: LogFileLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let guard = setup_logging(args.log_file_level);

    let mut options = ServiceOptions::default();
    if let Some(dir) = args.socket_dir {
        options.socket_dir = dir;
    }
    if let Some(dir) = args.config_dir {
        options.config = ConfigSource::with_dir(dir);
    }

    info!("Starting sensord...");

    match sensord_daemon::run(options).await {
        Ok(()) => {
            info!("sensord stopped");
            Ok(())
        }
        Err(DaemonError::ServiceAlreadyRunning(paths)) => {
            error!("Service already running: {:?}", paths);
            drop(guard);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
