//! powermand: power control daemon
//!
//! ```bash
//! powermand -c /etc/powerman/powerman.toml
//! powermand -c test.toml -l 127.0.0.1:10102 -S -d
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use powerman::{DaemonConf, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "powermand")]
#[command(author, version, about = "Power control daemon", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/powerman/powerman.toml")]
    conf: PathBuf,

    /// Listen address (repeatable; replaces the configured ones)
    #[arg(short, long)]
    listen: Vec<String>,

    /// Complete script delays immediately
    #[arg(short = 'S', long)]
    short_circuit_delays: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    debug: bool,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_directives = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives)),
        )
        .init();

    // must be set before the tunables are first read
    if args.short_circuit_delays {
        std::env::set_var("POWERMAN_SHORT_CIRCUIT_DELAY", "1");
    }

    let mut conf = DaemonConf::from_path(&args.conf)
        .with_context(|| format!("loading {}", args.conf.display()))?;
    if !args.listen.is_empty() {
        conf.listen = args.listen;
    }
    info!(
        version = powerman::server::VERSION,
        conf = %args.conf.display(),
        devices = conf.devices.len(),
        "powermand starting"
    );

    Server::new(conf)
        .run(shutdown_signal())
        .await
        .context("server failed")?;
    Ok(())
}
