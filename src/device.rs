//! Power control device task.
//!
//! Each `Device` runs as its own tokio task and exclusively owns its link,
//! action queue, I/O buffers and the interpreter of the action at the head of
//! the queue. Other components talk to it through a `DeviceHandle`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::action::{
    Action, ActionError, ActionEventKind, ActionOutcome, ActionStatus, NodeResult,
};
use crate::commands::Command;
use crate::config::config as global_config;
use crate::endpoint::Endpoint;
use crate::error::PowermanError;
use crate::interp::{ExecEnv, Interpreter, Step};
use crate::pluglist::PlugList;
use crate::script::{DeviceSpec, PlugState};
use crate::transport::{self, log_io, memstr, Link, LinkReader, LinkWriter};

/// Seconds to wait before reconnect attempt N (the last entry repeats).
pub const RECONNECT_BACKOFF: [u64; 7] = [1, 2, 4, 8, 15, 30, 60];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectState {
    #[default]
    NotConnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectState {
    /// Wording used by the `device` query.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::NotConnected | Self::Error => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub state: ConnectState,
    pub logged_in: bool,
    pub successful_connects: u32,
    pub successful_actions: u32,
    /// Times the device entered `ConnectState::Error`.
    pub errors: u32,
    pub queued: usize,
}

impl DeviceStats {
    /// Reconnections after the first successful connect.
    #[must_use]
    pub const fn reconnects(&self) -> u32 {
        self.successful_connects.saturating_sub(1)
    }
}

#[derive(Debug)]
pub enum DeviceMsg {
    Enqueue(Action),
    /// Log out if possible, then stop the task.
    Shutdown,
}

/// Cheap, cloneable reference to a running device task.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub name: String,
    pub spec: Arc<DeviceSpec>,
    pub plugs: Arc<PlugList>,
    pub endpoint: Endpoint,
    tx: mpsc::UnboundedSender<DeviceMsg>,
    stats: watch::Receiver<DeviceStats>,
}

impl DeviceHandle {
    /// Start the device task on the current runtime.
    #[must_use]
    pub fn spawn(device: Device) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            name: device.name.clone(),
            spec: Arc::clone(&device.spec),
            plugs: Arc::clone(&device.plugs),
            endpoint: device.endpoint.clone(),
            tx,
            stats: device.stats_tx.subscribe(),
        };
        let join = tokio::spawn(device.run(rx));
        (handle, join)
    }

    pub fn enqueue(&self, action: Action) -> Result<(), PowermanError> {
        self.tx
            .send(DeviceMsg::Enqueue(action))
            .map_err(|_| PowermanError::Protocol(format!("device {} not running", self.name)))
    }

    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        *self.stats.borrow()
    }

    /// Wait until the device stats satisfy `pred`.
    pub async fn wait_for(&self, pred: impl FnMut(&DeviceStats) -> bool) -> Result<DeviceStats, PowermanError> {
        let mut rx = self.stats.clone();
        let stats = rx
            .wait_for(pred)
            .await
            .map_err(|_| PowermanError::Protocol(format!("device {} not running", self.name)))?;
        Ok(*stats)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(DeviceMsg::Shutdown);
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Link, PowermanError>> + Send>>;

enum Wake {
    Msg(Option<DeviceMsg>),
    Connected(Result<Link, PowermanError>),
    Read(std::io::Result<usize>),
    Wrote(std::io::Result<usize>),
    Timer,
}

pub struct Device {
    name: String,
    spec: Arc<DeviceSpec>,
    endpoint: Endpoint,
    plugs: Arc<PlugList>,
    state: ConnectState,
    logged_in: bool,
    queue: VecDeque<Action>,
    input: Vec<u8>,
    output: Vec<u8>,
    reader: Option<LinkReader>,
    writer: Option<LinkWriter>,
    retry_count: usize,
    last_retry: Option<Instant>,
    last_ping: Instant,
    /// Interpreter delay in progress.
    wait_until: Option<Instant>,
    known: HashMap<String, PlugState>,
    stats: DeviceStats,
    stats_tx: watch::Sender<DeviceStats>,
    shutting_down: bool,
}

impl Device {
    #[must_use]
    pub fn new(name: impl Into<String>, spec: Arc<DeviceSpec>, endpoint: Endpoint, plugs: PlugList) -> Self {
        let (stats_tx, _) = watch::channel(DeviceStats::default());
        Self {
            name: name.into(),
            spec,
            endpoint,
            plugs: Arc::new(plugs),
            state: ConnectState::NotConnected,
            logged_in: false,
            queue: VecDeque::new(),
            input: Vec::new(),
            output: Vec::new(),
            reader: None,
            writer: None,
            retry_count: 0,
            last_retry: None,
            last_ping: Instant::now(),
            wait_until: None,
            known: HashMap::new(),
            stats: DeviceStats::default(),
            stats_tx,
            shutting_down: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DeviceMsg>) {
        info!(device = %self.name, spec = %self.spec.name, endpoint = %self.endpoint, "device started");
        let mut connecting: Option<ConnectFuture> = None;
        let mut rx_open = true;
        let mut rbuf = vec![0u8; 4096];
        loop {
            let now = Instant::now();
            if connecting.is_none() && self.time_to_reconnect(now) {
                connecting = Some(self.start_connect(now));
            }
            self.process(now);
            self.publish_stats();
            if self.shutting_down && self.queue.is_empty() {
                break;
            }
            let deadline = self.next_deadline(now, connecting.is_some());

            let wake = tokio::select! {
                msg = rx.recv(), if rx_open => Wake::Msg(msg),
                res = poll_connect(&mut connecting) => Wake::Connected(res),
                res = read_link(self.reader.as_mut(), &mut rbuf) => Wake::Read(res),
                res = write_link(self.writer.as_mut(), &self.output), if !self.output.is_empty() => Wake::Wrote(res),
                () = sleep_opt(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Msg(Some(DeviceMsg::Enqueue(action))) => self.enqueue(action),
                Wake::Msg(Some(DeviceMsg::Shutdown)) => self.begin_shutdown(),
                Wake::Msg(None) => {
                    rx_open = false;
                    self.begin_shutdown();
                }
                Wake::Connected(res) => {
                    connecting = None;
                    self.finish_connect(res, Instant::now());
                }
                Wake::Read(Ok(0)) => {
                    warn!(device = %self.name, "device closed connection");
                    self.disconnect(ConnectState::Error);
                }
                Wake::Read(Ok(n)) => self.absorb(&rbuf[..n]),
                Wake::Read(Err(e)) => {
                    warn!(device = %self.name, error = %e, "device read error");
                    self.disconnect(ConnectState::Error);
                }
                Wake::Wrote(Ok(n)) => {
                    log_io(&self.name, "send", &self.output[..n]);
                    self.output.drain(..n);
                }
                Wake::Wrote(Err(e)) => {
                    warn!(device = %self.name, error = %e, "device write error");
                    self.disconnect(ConnectState::Error);
                }
                Wake::Timer => {}
            }
        }
        self.disconnect(ConnectState::NotConnected);
        self.publish_stats();
        info!(device = %self.name, "device stopped");
    }

    fn enqueue(&mut self, action: Action) {
        if self.shutting_down {
            self.finish(action, ActionStatus::Failure, Some(ActionError::DeviceGone));
            return;
        }
        if !matches!(self.state, ConnectState::Connected | ConnectState::Connecting) {
            // expedite reconnect for client work
            self.retry_count = 0;
            self.last_retry = None;
        }
        debug!(device = %self.name, action = action.id, command = %action.command, "enqueue");
        self.queue.push_back(action);
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        let pending: Vec<Action> = self.queue.drain(..).collect();
        for action in pending {
            if !action.command.is_internal() {
                self.finish(action, ActionStatus::Failure, Some(ActionError::DeviceGone));
            }
        }
        if self.state == ConnectState::Connected && self.logged_in && self.spec.supports(Command::Logout) {
            self.queue.push_back(Action::internal(Command::Logout));
        }
    }

    fn backoff(&self) -> Duration {
        let i = self.retry_count.saturating_sub(1).min(RECONNECT_BACKOFF.len() - 1);
        Duration::from_secs(RECONNECT_BACKOFF[i])
    }

    fn time_to_reconnect(&self, now: Instant) -> bool {
        if self.shutting_down || !matches!(self.state, ConnectState::NotConnected | ConnectState::Error) {
            return false;
        }
        match self.last_retry {
            None => true,
            Some(t) => self.retry_count == 0 || now >= t + self.backoff(),
        }
    }

    fn start_connect(&mut self, now: Instant) -> ConnectFuture {
        self.state = ConnectState::Connecting;
        self.retry_count += 1;
        self.last_retry = Some(now);
        debug!(device = %self.name, attempt = self.retry_count, "connecting");
        let endpoint = self.endpoint.clone();
        let limit = self.spec.connect_timeout;
        Box::pin(async move {
            match timeout(limit, transport::connect(&endpoint)).await {
                Ok(res) => res,
                Err(_) => Err(PowermanError::Timeout),
            }
        })
    }

    fn finish_connect(&mut self, res: Result<Link, PowermanError>, now: Instant) {
        match res {
            Ok(link) => {
                info!(device = %self.name, "connected");
                self.reader = Some(link.reader);
                self.writer = Some(link.writer);
                self.state = ConnectState::Connected;
                self.stats.successful_connects += 1;
                self.retry_count = 0;
                self.input.clear();
                self.output.clear();
                self.last_ping = now;
                if self.spec.supports(Command::Login) {
                    self.logged_in = false;
                    if let Some(head) = self.queue.front_mut() {
                        head.rewind();
                    }
                    self.queue.push_front(Action::internal(Command::Login));
                } else {
                    self.logged_in = true;
                }
            }
            Err(e) => {
                warn!(device = %self.name, error = %e, retry_in = ?self.backoff(), "connect failed");
                self.state = ConnectState::Error;
                self.stats.errors += 1;
            }
        }
    }

    fn disconnect(&mut self, next: ConnectState) {
        if self.reader.is_some() || self.writer.is_some() {
            debug!(device = %self.name, "disconnecting");
        }
        self.reader = None;
        self.writer = None;
        self.state = next;
        if next == ConnectState::Error {
            self.stats.errors += 1;
        }
        self.logged_in = false;
        self.input.clear();
        self.output.clear();
        self.wait_until = None;
        // a half-run login is redone on the next connection
        self.queue.retain(|a| a.command != Command::Login);
        if self.shutting_down {
            self.queue.retain(|a| !a.command.is_internal());
        }
        if let Some(head) = self.queue.front_mut() {
            head.rewind();
        }
    }

    fn absorb(&mut self, raw: &[u8]) {
        log_io(&self.name, "recv", raw);
        if let Some(reader) = self.reader.as_mut() {
            reader.accept(raw, &mut self.input, &mut self.output);
        }
        let max = global_config().max_dev_buf;
        if self.input.len() > max {
            let dropped = self.input.len() - max;
            warn!(device = %self.name, dropped, "input buffer overflow, dropping oldest bytes");
            self.input.drain(..dropped);
        }
    }

    fn maybe_enqueue_ping(&mut self, now: Instant) {
        let Some(period) = self.spec.ping_period else {
            return;
        };
        if self.state != ConnectState::Connected
            || !self.logged_in
            || self.shutting_down
            || !self.spec.supports(Command::Ping)
        {
            return;
        }
        if now >= self.last_ping + period {
            self.last_ping = now;
            if !self.queue.iter().any(|a| a.command == Command::Ping) {
                debug!(device = %self.name, "ping");
                self.queue.push_back(Action::internal(Command::Ping));
            }
        }
    }

    /// Drive the head of the queue as far as it can go right now.
    fn process(&mut self, now: Instant) {
        self.wait_until = None;
        self.maybe_enqueue_ping(now);
        loop {
            let connected = self.state == ConnectState::Connected;
            let Some(act) = self.queue.front_mut() else {
                break;
            };
            if act.targets.as_ref().is_some_and(Vec::is_empty) {
                // no plugs to act on, so no dialogue either
                if let Some(a) = self.queue.pop_front() {
                    debug!(device = %self.name, action = a.id, command = %a.command, "empty target set");
                    self.finish(a, ActionStatus::Success, None);
                }
                continue;
            }
            let started = *act.started.get_or_insert(now);
            act.status = ActionStatus::Running;

            if now >= started + self.spec.timeout {
                let err = if !connected {
                    ActionError::ConnectTimeout
                } else if !self.logged_in {
                    ActionError::LoginTimeout
                } else {
                    ActionError::ExpectTimeout
                };
                if connected {
                    act.telemetry_line(&self.name, format!("recv({}): '{}'", self.name, memstr(&self.input)));
                } else {
                    act.telemetry_line(&self.name, format!("connect({}): timeout", self.name));
                }
                if err == ActionError::LoginTimeout {
                    for p in self.plugs.unassigned() {
                        warn!(device = %self.name, plug = %p.name, "plug has no node assigned");
                    }
                }
                warn!(device = %self.name, command = %act.command, error = ?err, "action timed out");
                self.fail_queue(err);
                if connected {
                    self.disconnect(ConnectState::Error);
                }
                break;
            }
            if !connected {
                break;
            }

            if act.interp.is_none() {
                let Some(script) = self.spec.script(act.command) else {
                    warn!(device = %self.name, command = %act.command, "no script for command");
                    if let Some(a) = self.queue.pop_front() {
                        self.finish(a, ActionStatus::Failure, Some(ActionError::Aborted));
                    }
                    continue;
                };
                act.interp = Some(Interpreter::new(script, act.targets.as_deref(), act.mode, act.telemetry));
            }
            let Some(interp) = act.interp.as_mut() else {
                break;
            };
            let mut env = ExecEnv {
                device: &self.name,
                spec: &self.spec,
                plugs: &self.plugs,
                input: &mut self.input,
                output: &mut self.output,
                known: &self.known,
                short_circuit_delay: global_config().short_circuit_delay,
            };
            let step = interp.advance(&mut env, now);
            for line in interp.take_telemetry() {
                act.telemetry_line(&self.name, line);
            }
            match step {
                Step::Done => self.complete_head(),
                Step::WaitUntil(t) => {
                    self.wait_until = Some(t);
                    break;
                }
                Step::WaitInput | Step::WaitOutput => break,
            }
        }
    }

    fn complete_head(&mut self) {
        let Some(mut act) = self.queue.pop_front() else {
            return;
        };
        let results = act.interp.take().map(|i| i.results).unwrap_or_default();
        for (plug, r) in &results.plugs {
            if r.state != PlugState::Unknown {
                self.known.insert(plug.clone(), r.state);
            }
        }
        if act.command == Command::Login {
            self.logged_in = true;
            info!(device = %self.name, "logged in");
        }
        self.stats.successful_actions += 1;

        let failed: Vec<&String> = match &act.targets {
            Some(t) => t.iter().filter(|p| results.failed.contains(*p)).collect(),
            None => results.failed.iter().collect(),
        };
        let (status, error) = match (&act.targets, failed.len()) {
            (_, 0) => (ActionStatus::Success, None),
            (Some(t), n) if n >= t.len() => (ActionStatus::Failure, Some(ActionError::PlugFailure)),
            _ => (ActionStatus::PartialFailure, Some(ActionError::PlugFailure)),
        };
        debug!(device = %self.name, action = act.id, command = %act.command, ?status, "action complete");
        act.status = status;
        act.error = error;
        let node_results = self.node_results(&results);
        let outcome = ActionOutcome {
            command: act.command,
            status,
            error: error.map(|e| {
                let plugs: crate::hostlist::Hostlist = failed.iter().map(|p| p.as_str()).collect();
                format!("{} ({})", e.message(&self.name), plugs.ranged_string())
            }),
            results: node_results,
        };
        act.emit(&self.name, ActionEventKind::Completed(outcome));
        if status == ActionStatus::Failure {
            warn!(device = %self.name, command = %act.command, "action failed, reconnecting");
            self.disconnect(ConnectState::Error);
        }
    }

    fn node_results(&self, results: &crate::action::ActionResults) -> Vec<NodeResult> {
        results
            .plugs
            .iter()
            .filter_map(|(plug, r)| {
                self.plugs.node_of(plug).map(|node| NodeResult {
                    node: node.to_string(),
                    plug: plug.clone(),
                    result: r.clone(),
                })
            })
            .collect()
    }

    /// Fail the head action with `err` and everything queued behind it.
    fn fail_queue(&mut self, err: ActionError) {
        let rest_err = if err == ActionError::ExpectTimeout {
            ActionError::Aborted
        } else {
            err
        };
        let mut first = true;
        while let Some(act) = self.queue.pop_front() {
            let e = if first { err } else { rest_err };
            first = false;
            self.finish(act, e.status(), Some(e));
        }
    }

    fn finish(&self, mut act: Action, status: ActionStatus, error: Option<ActionError>) {
        act.status = status;
        act.error = error;
        let results = act.interp.take().map(|i| i.results).unwrap_or_default();
        let outcome = ActionOutcome {
            command: act.command,
            status,
            error: error.map(|e| e.message(&self.name)),
            results: self.node_results(&results),
        };
        act.emit(&self.name, ActionEventKind::Completed(outcome));
    }

    fn next_deadline(&self, now: Instant, connecting: bool) -> Option<Instant> {
        let mut deadlines = Vec::with_capacity(4);
        if let Some(act) = self.queue.front() {
            deadlines.push(act.started.unwrap_or(now) + self.spec.timeout);
        }
        if let Some(t) = self.wait_until {
            deadlines.push(t);
        }
        if !connecting && !self.shutting_down && matches!(self.state, ConnectState::NotConnected | ConnectState::Error) {
            if let Some(t) = self.last_retry {
                deadlines.push(t + self.backoff());
            }
        }
        if let Some(period) = self.spec.ping_period {
            if self.state == ConnectState::Connected && self.spec.supports(Command::Ping) {
                deadlines.push(self.last_ping + period);
            }
        }
        deadlines.into_iter().min()
    }

    fn publish_stats(&mut self) {
        self.stats.state = self.state;
        self.stats.logged_in = self.logged_in;
        self.stats.queued = self.queue.len();
        let stats = self.stats;
        self.stats_tx.send_if_modified(|s| {
            if *s == stats {
                false
            } else {
                *s = stats;
                true
            }
        });
    }
}

async fn poll_connect(fut: &mut Option<ConnectFuture>) -> Result<Link, PowermanError> {
    match fut.as_mut() {
        Some(f) => f.await,
        None => std::future::pending().await,
    }
}

async fn read_link(reader: Option<&mut LinkReader>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read_some(buf).await,
        None => std::future::pending().await,
    }
}

async fn write_link(writer: Option<&mut LinkWriter>, buf: &[u8]) -> std::io::Result<usize> {
    match writer {
        Some(w) => w.write_some(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(t) => sleep_until(t).await,
        None => std::future::pending().await,
    }
}
