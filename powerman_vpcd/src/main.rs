//! vpcd: virtual power controller
//!
//! ```bash
//! # TCP on port 11000, 16 plugs
//! vpcd --port 11000
//!
//! # coprocess mode, for `command = "vpcd --stdio"` devices
//! vpcd --stdio
//! ```

use std::net::SocketAddr;

use clap::Parser;
use powerman_vpcd::{bind, Vpc, VpcOptions, DEFAULT_PLUGS};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "vpcd")]
#[command(author, version, about = "Virtual power controller", long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "11000")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Serve one session on stdin/stdout instead of listening
    #[arg(long)]
    stdio: bool,

    /// Number of plugs
    #[arg(long, default_value_t = DEFAULT_PLUGS)]
    plugs: usize,

    /// Never answer the first `on` command
    #[arg(long)]
    drop_command: bool,

    /// Answer the first `on` command with UNKNOWN
    #[arg(long)]
    bad_response: bool,

    /// Accept connections but never prompt
    #[arg(long)]
    hung: bool,

    /// Report plug 0 as off in `stat_soft`
    #[arg(long)]
    soft_off: bool,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout belongs to the dialogue in --stdio mode
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let vpc = Vpc::new(VpcOptions {
        plugs: args.plugs,
        drop_command: args.drop_command,
        bad_response: args.bad_response,
        hung: args.hung,
        soft_off: args.soft_off,
    });

    if args.stdio {
        vpc.serve_stdio().await?;
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = bind(addr)?;
    info!(%addr, plugs = args.plugs, "vpcd listening");
    tokio::select! {
        r = vpc.run_listener_on(listener) => r?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(())
}
