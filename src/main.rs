use anyhow::{Context, Result};
use clap::Parser;
use cryptctl::configs::ServerConfig;
use cryptctl::mailer::Mailer;
use cryptctl::server::{lock_memory, CryptServer};
use cryptctl::sysconfig::Sysconfig;
use std::sync::Arc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Centralized disk-encryption key escrow server.
#[derive(Parser)]
#[command(name = "cryptctl-server", version, about)]
struct Args {
    /// Path of the server sysconfig file.
    #[arg(long, default_value = "/etc/sysconfig/cryptctl-server")]
    config: String,
    /// Directory receiving daily-rotated log files, in addition to stdout.
    #[arg(long)]
    log_dir: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout always; a rolling file appender when a log directory is given.
    // The appender guard must outlive the server.
    let (file_layer, _guard) = match &args.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "cryptctl-server.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (
                Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Key material passes through this process; keep it out of swap.
    lock_memory();

    let sysconf = Sysconfig::parse_file(&args.config, false)
        .with_context(|| format!("failed to load configuration from \"{}\"", args.config))?;
    let config = ServerConfig::from_sysconfig(&sysconf)
        .with_context(|| format!("configuration file \"{}\" is unusable", args.config))?;
    let mailer = Mailer::from_sysconfig(&sysconf);
    if let Err(err) = mailer.validate_config() {
        info!("mail notifications are disabled - {:#}", err);
    }

    let server = Arc::new(CryptServer::new(config, mailer)?);
    server.listen_rpc()?;
    server.handle_connections();
    info!("key server has stopped");
    Ok(())
}
