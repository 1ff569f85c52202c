use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::pw::config::{load_config, parse_duration_ms};
use crate::pw::logger::{LogLevel, SupervisorLogger};
use crate::pw::logrouter::spawn_rolling_writer;
use crate::pw::manager::Manager;
use crate::pw::server;

/// Exit code when shutdown did not complete within the stop timeout.
pub const EXIT_SHUTDOWN_TIMEOUT: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "procwatch", version, about = "A process execution monitor")]
pub struct Args {
    /// Configuration file to load
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Level of log output verbosity (debug, info, warning, error); defaults
    /// to the configured loglevel
    #[arg(short = 'L', long = "log-level")]
    pub log_level: Option<String>,

    /// Maximum time to wait for programs to stop gracefully when stopping
    /// the manager before killing them (e.g. 120s, 2m)
    #[arg(long = "max-stop-timeout", default_value = "120s")]
    pub max_stop_timeout: String,

    /// Show a CLI dashboard
    #[arg(short = 'D', long = "dashboard")]
    pub dashboard: bool,
}

pub fn default_config_path() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        PathBuf::from("/etc/procwatch/procwatch.ini")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config/procwatch/procwatch.ini")
    } else {
        PathBuf::from("procwatch.ini")
    }
}

/// Run the supervisor until SIGINT/SIGTERM, then drive the two-phase
/// shutdown: graceful stop first, force stop once the timeout expires.
/// Returns the process exit code.
pub async fn run(args: Args) -> anyhow::Result<i32> {
    anyhow::ensure!(
        !args.dashboard,
        "the terminal dashboard is not part of this build"
    );
    let max_stop_timeout = Duration::from_millis(
        parse_duration_ms(&args.max_stop_timeout)
            .map_err(|e| anyhow::anyhow!("--max-stop-timeout: {e}"))?,
    );

    let config_path = args.config.unwrap_or_else(default_config_path);
    let cfg = load_config(&config_path)?;

    let level = match &args.log_level {
        Some(s) => LogLevel::parse(s)?,
        None => cfg.loglevel,
    };

    // The supervisor log file writer reports its own failures to stderr.
    let boot_logger = SupervisorLogger::stderr_only(level);
    let file_tx = spawn_rolling_writer(
        cfg.logfile.clone(),
        cfg.logfile_maxbytes,
        cfg.logfile_backups,
        boot_logger,
    );
    let logger = SupervisorLogger::new(level, Some(file_tx));
    logger.info(
        "boot",
        None,
        format!("loaded configuration file: {}", config_path.display()),
    );

    let manager = Arc::new(Manager::new(cfg, logger.clone(), Vec::new()));
    server::start_server(Arc::clone(&manager));

    let tick_manager = Arc::clone(&manager);
    tokio::spawn(async move { tick_manager.run().await });

    let mut term = unix_signal(SignalKind::terminate())?;
    let mut int = unix_signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    logger.info("shutdown", None, "received signal, stopping all programs");

    let graceful_manager = Arc::clone(&manager);
    let graceful = tokio::spawn(async move { graceful_manager.stop(false).await });
    if tokio::time::timeout(max_stop_timeout, graceful).await.is_ok() {
        manager.wait().await;
        logger.info("shutdown", None, "clean shutdown complete");
        return Ok(0);
    }

    logger.warning(
        "shutdown",
        None,
        "timed out waiting for programs to stop, force killing them",
    );
    let force_manager = Arc::clone(&manager);
    let forced = tokio::spawn(async move { force_manager.stop(true).await });
    if tokio::time::timeout(max_stop_timeout, forced).await.is_err() {
        logger.error("shutdown", None, "failed to stop all programs; still managing:");
        for p in manager.programs() {
            logger.error(
                "shutdown",
                None,
                format!("program name={} state={} pid={}", p.name, p.state, p.process_id),
            );
        }
    }
    Ok(EXIT_SHUTDOWN_TIMEOUT)
}
