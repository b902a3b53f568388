//! powermand event loop.
//!
//! The server owns the client session table and the dispatcher (and through
//! it the device handles). Device tasks run independently and report back on
//! a single action event channel; each client connection gets a reader task
//! and a writer task that only move bytes.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::ActionEvent;
use crate::config::config as global_config;
use crate::daemon_conf::DaemonConf;
use crate::device::DeviceHandle;
use crate::dispatch::{ClientId, Dispatcher};
use crate::error::PowermanError;
use crate::session::{Line, LineSplitter, Output, Session};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const LISTEN_BACKLOG: i32 = 5;
/// Upper bound on waiting for devices to log out at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

enum ClientEvent {
    Accepted(TcpStream, SocketAddr),
    Line(ClientId, Line),
    Closed(ClientId),
}

struct ClientConn {
    session: Session,
    out: mpsc::UnboundedSender<WriterMsg>,
}

enum WriterMsg {
    Text(String),
    Close,
}

pub struct Server {
    listen: Vec<String>,
    dispatcher: Dispatcher,
    action_rx: mpsc::UnboundedReceiver<ActionEvent>,
    device_tasks: Vec<JoinHandle<()>>,
    clients: HashMap<ClientId, ClientConn>,
    next_client: ClientId,
}

impl Server {
    /// Start one task per configured device. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn new(conf: DaemonConf) -> Self {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(conf.devices.len());
        let mut device_tasks = Vec::with_capacity(conf.devices.len());
        for d in conf.devices {
            let (handle, join) = DeviceHandle::spawn(d.into_device());
            handles.push(handle);
            device_tasks.push(join);
        }
        info!(devices = handles.len(), aliases = conf.aliases.len(), "server configured");
        Self {
            listen: conf.listen,
            dispatcher: Dispatcher::new(handles, conf.aliases, action_tx),
            action_rx,
            device_tasks,
            clients: HashMap::new(),
            next_client: 1,
        }
    }

    #[must_use]
    pub fn devices(&self) -> &[DeviceHandle] {
        self.dispatcher.devices()
    }

    /// Bind every configured listen address and serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<(), PowermanError> {
        let mut listeners = Vec::with_capacity(self.listen.len());
        for addr in &self.listen {
            listeners.push(bind_listener(addr).await?);
        }
        self.serve(listeners, shutdown).await
    }

    /// Serve on an already bound listener (tests bind `127.0.0.1:0`).
    pub async fn run_listener_on(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), PowermanError> {
        self.serve(vec![listener], shutdown).await
    }

    async fn serve(
        mut self,
        listeners: Vec<TcpListener>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), PowermanError> {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let mut acceptors = Vec::with_capacity(listeners.len());
        for l in listeners {
            if let Ok(addr) = l.local_addr() {
                info!(%addr, "listening");
            }
            acceptors.push(tokio::spawn(accept_loop(l, client_tx.clone())));
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(ev) = client_rx.recv() => self.on_client_event(ev, &client_tx),
                Some(ev) = self.action_rx.recv() => {
                    if let Some(reply) = self.dispatcher.on_event(ev) {
                        if let Some(c) = self.clients.get_mut(&reply.client) {
                            let out = c.session.on_reply(reply);
                            send(c, &out);
                        }
                    }
                }
            }
        }

        for a in acceptors {
            a.abort();
        }
        for c in self.clients.values() {
            let _ = c.out.send(WriterMsg::Close);
        }
        self.dispatcher.shutdown();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for t in self.device_tasks {
            if tokio::time::timeout_at(deadline, t).await.is_err() {
                warn!("device task did not stop in time");
                break;
            }
        }
        info!("server stopped");
        Ok(())
    }

    fn on_client_event(&mut self, ev: ClientEvent, events: &mpsc::UnboundedSender<ClientEvent>) {
        match ev {
            ClientEvent::Accepted(stream, peer) => {
                let id = self.next_client;
                self.next_client += 1;
                info!(client = id, %peer, "client connected");
                let (reader, writer) = stream.into_split();
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                tokio::spawn(read_loop(id, reader, events.clone()));
                tokio::spawn(write_loop(id, writer, out_rx));
                let conn = ClientConn {
                    session: Session::new(id),
                    out: out_tx,
                };
                send(&conn, &Session::greeting(VERSION));
                self.clients.insert(id, conn);
            }
            ClientEvent::Line(id, line) => {
                let Some(c) = self.clients.get_mut(&id) else {
                    return;
                };
                let out = match line {
                    Line::Text(text) => c.session.handle_line(&text, &mut self.dispatcher),
                    Line::TooLong => c.session.too_long(),
                };
                send(c, &out);
            }
            ClientEvent::Closed(id) => {
                if let Some(c) = self.clients.remove(&id) {
                    if c.session.is_busy() {
                        debug!(client = id, "client left with a request in flight");
                    }
                    self.dispatcher.client_gone(id);
                    let _ = c.out.send(WriterMsg::Close);
                }
                info!(client = id, "client disconnected");
            }
        }
    }
}

fn send(c: &ClientConn, out: &Output) {
    if !out.is_empty() {
        let _ = c.out.send(WriterMsg::Text(out.render()));
    }
    if out.close {
        let _ = c.out.send(WriterMsg::Close);
    }
}

/// Create a listening socket with `SO_REUSEADDR` and a short backlog.
pub async fn bind_listener(addr: &str) -> Result<TcpListener, PowermanError> {
    let sa = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| PowermanError::Config(format!("cannot resolve listen address {addr}")))?;
    let socket = Socket::new(Domain::for_address(sa), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&sa.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<ClientEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if tx.send(ClientEvent::Accepted(stream, peer)).is_err() {
                    return;
                }
            }
            Err(e) => {
                // transient (ECONNABORTED and friends); keep accepting
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(
    id: ClientId,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut splitter = LineSplitter::new(global_config().client_linemax);
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(ClientEvent::Line(id, line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!(client = id, error = %e, "client read error");
                break;
            }
        }
    }
    let _ = tx.send(ClientEvent::Closed(id));
}

async fn write_loop(
    id: ClientId,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Text(s) => {
                if let Err(e) = writer.write_all(s.as_bytes()).await {
                    debug!(client = id, error = %e, "client write error");
                    break;
                }
            }
            WriterMsg::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}
