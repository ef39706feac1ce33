use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use cloudprint::config;
use cloudprint::daemon::{CommandJobSource, Daemon, DaemonSettings};
use cloudprint::xmpp::TlsDialer;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (build ", env!("GIT_HASH"), ")");

/// Keep a cloud print queue's push channel open and run the job hook on
/// every notification.
#[derive(Debug, Parser)]
#[command(name = "cloudprint", version = VERSION, about)]
struct Cli {
    /// Configuration file (default: <config dir>/cloudprint/cloudprint.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Poll for jobs every `fast_poll_secs` instead of `poll_secs`
    #[arg(long)]
    fastpoll: bool,

    /// Log to stderr; `--verbose=xmpp` adds raw push-channel traffic
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "default",
        value_parser = ["default", "xmpp"]
    )]
    verbose: Option<String>,

    /// Directory for the daily log files
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Skip TLS certificate verification (self-signed development servers only)
    #[arg(long)]
    dangerous_insecure_tls: bool,

    /// Run a single cycle (jobs, connect, one wait) and exit
    #[arg(long)]
    once: bool,
}

/// Platform log directory:
///   Linux:   ~/.local/share/cloudprint/logs/  (or $XDG_DATA_HOME)
///   macOS:   ~/Library/Application Support/cloudprint/logs/
///   Windows: %LOCALAPPDATA%\cloudprint\logs\
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudprint")
        .join("logs")
}

/// Always write to a daily log file; add stderr output when `--verbose` is
/// passed or `RUST_LOG` is set.
fn init_tracing(log_dir: &Path, verbose_level: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("cloudprint=info,info")
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "cloudprint.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("cloudprint=info,cloudprint::xmpp=debug,info")
        } else {
            EnvFilter::new("cloudprint=info,info")
        };

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The writer thread must outlive every log call; flushes on process exit.
    std::mem::forget(guard);

    eprintln!("Log directory: {}", log_dir.display());
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_dir = cli.log_dir.clone().unwrap_or_else(default_log_dir);
    init_tracing(&log_dir, cli.verbose.as_deref());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "cloudprint starting"
    );

    let mut config = config::load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.fastpoll {
        config.daemon.fast_poll = true;
    }
    if cli.dangerous_insecure_tls {
        config.xmpp.dangerous_insecure_tls = true;
    }

    let settings = DaemonSettings {
        endpoint: config.endpoint()?,
        poll: config.poll_period(),
        retry: config.retry_period(),
    };
    let dialer = TlsDialer::new(config.connect_timeout(), config.xmpp.dangerous_insecure_tls)
        .context("failed to set up TLS")?;
    let mut daemon = Daemon::new(
        CommandJobSource::new(config.daemon.job_command.clone()),
        config.credential_source(),
        dialer,
        config.xmpp_settings(),
        settings,
    );

    if cli.once {
        let outcome = daemon.run_once().await;
        daemon.shutdown().await;
        let outcome = outcome?;
        info!(?outcome, "Single cycle finished");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    daemon.run(shutdown_rx).await;
    Ok(())
}
