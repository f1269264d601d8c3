mod cli;

use std::path::{Path, PathBuf};

use clap::Parser;
use cli::Opts;
use hoard_server::{Engine, EngineConfig, InitError};
use hoard_util_error::FmtCompact as _;
use snafu::{FromString as _, ResultExt, Snafu, Whatever};
use tracing::{info, warn};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const PROJECT_NAME: &str = "hoard";
pub const LOG_TARGET: &str = "hoard::cli";

/// Clean exit; another instance is running and was left alone.
const EXIT_ALREADY_RUNNING: i32 = 2;

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Initialization error: {source}"))]
    Init { source: InitError },
    #[snafu(display("Io error: {source}"))]
    Io { source: std::io::Error },
    #[snafu(display("Miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging().context(WhateverSnafu)?;

    let opts = Opts::parse();
    let db_dir = opts.global.db_dir.clone();

    match opts.cmd {
        cli::OptsCmd::Start => {
            if instance_is_running(&db_dir).await {
                warn!(
                    target: LOG_TARGET,
                    "Another instance appears to be running; refusing to start"
                );
                std::process::exit(EXIT_ALREADY_RUNNING);
            }
            serve(db_dir).await
        }
        cli::OptsCmd::Stop => {
            request_shutdown(&db_dir).await.context(IoSnafu)?;
            Ok(())
        }
        cli::OptsCmd::Restart => {
            if instance_is_running(&db_dir).await {
                request_shutdown(&db_dir).await.context(IoSnafu)?;
                wait_for_exit(&db_dir).await;
            }
            serve(db_dir).await
        }
    }
}

async fn serve(db_dir: PathBuf) -> CliResult<()> {
    let engine = Engine::start(EngineConfig::new(&db_dir))
        .await
        .context(InitSnafu)?;

    if let Some(bootstrap) = engine.bootstrap_admin() {
        // shown exactly once; the server never stores the raw key
        println!("first-boot admin credentials (write these down, they will not be shown again):");
        println!("  service key: {}", bootstrap.service_key);
        println!("  access key:  {}", bootstrap.access_key);
    }

    write_pid_file(&db_dir).await.context(IoSnafu)?;
    info!(target: LOG_TARGET, db_dir = %db_dir.display(), "Server running");

    let shutdown_flag = db_dir.join("shutdown.request");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target: LOG_TARGET, "Interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                if tokio::fs::try_exists(&shutdown_flag).await.unwrap_or(false) {
                    info!(target: LOG_TARGET, "Shutdown requested");
                    let _ = tokio::fs::remove_file(&shutdown_flag).await;
                    break;
                }
            }
        }
    }

    engine.shutdown().await;
    let _ = tokio::fs::remove_file(pid_path(&db_dir)).await;
    Ok(())
}

fn pid_path(db_dir: &Path) -> PathBuf {
    db_dir.join("server.pid")
}

async fn write_pid_file(db_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(db_dir).await?;
    tokio::fs::write(pid_path(db_dir), std::process::id().to_string()).await
}

/// Probe the pid file; a stale file (dead pid) does not count as running.
async fn instance_is_running(db_dir: &Path) -> bool {
    let Ok(contents) = tokio::fs::read_to_string(pid_path(db_dir)).await else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    pid_is_alive(pid)
}

fn pid_is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        // no cheap portable probe; assume alive and let the operator decide
        true
    }
}

/// Signal a running instance via the shutdown flag file it polls.
async fn request_shutdown(db_dir: &Path) -> std::io::Result<()> {
    tokio::fs::write(db_dir.join("shutdown.request"), b"").await?;
    info!(target: LOG_TARGET, "Requested shutdown");
    Ok(())
}

async fn wait_for_exit(db_dir: &Path) {
    for _ in 0..60 {
        if !instance_is_running(db_dir).await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    warn!(target: LOG_TARGET, "Timed out waiting for the old instance to exit");
}

fn init_logging() -> hoard_util_error::WhateverResult<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .map_err(|err| {
            Whatever::without_source(format!("Invalid log filter: {}", err.fmt_compact()))
        })?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
