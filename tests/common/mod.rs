#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use powerman::{DaemonConf, PowermanError, Server};
use powerman_vpcd::{Vpc, VpcOptions};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

/// Shared test setup. Delays are short-circuited so cycle/reset finish at once;
/// this must run before anything reads the process-wide tunables.
pub fn init() {
    INIT.call_once(|| {
        std::env::set_var("POWERMAN_SHORT_CIRCUIT_DELAY", "1");
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Start a virtual power controller on an ephemeral port.
pub async fn start_vpc(opts: VpcOptions) -> std::io::Result<(Vpc, u16)> {
    let vpc = Vpc::new(opts);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let srv = vpc.clone();
    tokio::spawn(async move {
        let _ = srv.run_listener_on(listener).await;
    });
    Ok((vpc, port))
}

/// One vpc device `pdu0` powering `t[0-15]`, alias `front` = `t[0-3]`.
pub fn vpc_conf(port: u16) -> String {
    format!(
        r#"
[[device]]
name = "pdu0"
spec = "vpc"
host = "127.0.0.1"
port = {port}

[[node]]
name = "t[0-15]"
device = "pdu0"
plugs = "[0-15]"

[[alias]]
name = "front"
nodes = "t[0-3]"
"#
    )
}

pub struct RunningServer {
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), PowermanError>>>,
}

impl RunningServer {
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Ask the server to stop and wait for it.
    pub async fn stop(mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(15), task).await???;
        }
        Ok(())
    }
}

/// Start powermand on an ephemeral port with the given configuration text.
pub async fn start_server(conf: &str) -> Result<RunningServer, Box<dyn std::error::Error>> {
    init();
    let conf = DaemonConf::parse(conf, None)?;
    let server = Server::new(conf);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_listener_on(listener, async move {
        let _ = rx.await;
    }));
    Ok(RunningServer {
        addr,
        stop: Some(tx),
        task: Some(task),
    })
}

/// vpcd plus a server configured for it.
pub async fn start_rig(opts: VpcOptions) -> Result<(Vpc, RunningServer), Box<dyn std::error::Error>> {
    init();
    let (vpc, port) = start_vpc(opts).await?;
    let server = start_server(&vpc_conf(port)).await?;
    Ok((vpc, server))
}
