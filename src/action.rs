use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::commands::Command;
use crate::interp::Interpreter;
use crate::script::PlugState;

pub type RequestId = u64;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Running,
    Success,
    PartialFailure,
    Failure,
    Timeout,
}

impl ActionStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Why an action did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionError {
    ConnectTimeout,
    LoginTimeout,
    ExpectTimeout,
    Aborted,
    /// Some target plugs could not be operated on.
    PlugFailure,
    /// The device task went away before running the action.
    DeviceGone,
}

impl ActionError {
    /// Client-visible text for `308` lines.
    #[must_use]
    pub fn message(&self, device: &str) -> String {
        match self {
            Self::ConnectTimeout => format!("{device}: connect timeout"),
            Self::LoginTimeout => format!("{device}: login timeout"),
            Self::ExpectTimeout => {
                format!("{device}: action timed out waiting for expected response")
            }
            Self::Aborted => format!("{device}: action aborted due to previous action timeout"),
            Self::PlugFailure => format!("{device}: action failed for some plugs"),
            Self::DeviceGone => format!("{device}: device not running"),
        }
    }

    /// Status an action takes when it ends with this error.
    #[must_use]
    pub const fn status(&self) -> ActionStatus {
        match self {
            Self::ConnectTimeout | Self::LoginTimeout | Self::ExpectTimeout => ActionStatus::Timeout,
            Self::Aborted | Self::DeviceGone => ActionStatus::Failure,
            Self::PlugFailure => ActionStatus::PartialFailure,
        }
    }
}

/// How the script's `%s` and foreach loops see the target plugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    /// Run the script once per target plug.
    Single,
    /// Run once; `%s` expands to the ranged plug list.
    Ranged,
    /// Run once over every plug of the device.
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlugResult {
    pub value: Option<String>,
    pub state: PlugState,
}

/// Values recorded by `setplugstate` plus plugs whose part of the action failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResults {
    pub plugs: BTreeMap<String, PlugResult>,
    pub failed: BTreeSet<String>,
}

impl ActionResults {
    pub fn record(&mut self, plug: &str, value: String, state: PlugState) {
        self.plugs.insert(
            plug.to_string(),
            PlugResult {
                value: Some(value),
                state,
            },
        );
    }

    /// Last state recorded for `plug`, if it was interpretable.
    #[must_use]
    pub fn state_of(&self, plug: &str) -> Option<PlugState> {
        self.plugs
            .get(plug)
            .map(|r| r.state)
            .filter(|s| *s != PlugState::Unknown)
    }

    pub fn fail(&mut self, plug: &str) {
        self.failed.insert(plug.to_string());
    }
}

/// Per-node result reported back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResult {
    pub node: String,
    pub plug: String,
    pub result: PlugResult,
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub command: Command,
    pub status: ActionStatus,
    pub error: Option<String>,
    pub results: Vec<NodeResult>,
}

#[derive(Debug, Clone)]
pub enum ActionEventKind {
    Telemetry(String),
    Completed(ActionOutcome),
}

#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub request: RequestId,
    pub device: String,
    pub kind: ActionEventKind,
}

/// One script run against one device on behalf of a request.
pub struct Action {
    pub id: u64,
    pub command: Command,
    /// Plug names the request is about; `None` for device-internal actions.
    pub targets: Option<Vec<String>>,
    pub mode: TargetMode,
    pub request: Option<RequestId>,
    pub telemetry: bool,
    pub status: ActionStatus,
    pub error: Option<ActionError>,
    notify: Option<mpsc::UnboundedSender<ActionEvent>>,
    pub(crate) started: Option<Instant>,
    pub(crate) interp: Option<Interpreter>,
}

impl Action {
    #[must_use]
    pub fn new(command: Command, mode: TargetMode) -> Self {
        Self {
            id: NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed),
            command,
            targets: None,
            mode,
            request: None,
            telemetry: false,
            status: ActionStatus::Pending,
            error: None,
            notify: None,
            started: None,
            interp: None,
        }
    }

    /// Login, logout and ping: no targets, no client.
    #[must_use]
    pub fn internal(command: Command) -> Self {
        Self::new(command, TargetMode::All)
    }

    #[must_use]
    pub fn with_targets(mut self, plugs: Vec<String>) -> Self {
        self.targets = Some(plugs);
        self
    }

    #[must_use]
    pub fn with_request(
        mut self,
        request: RequestId,
        notify: mpsc::UnboundedSender<ActionEvent>,
    ) -> Self {
        self.request = Some(request);
        self.notify = Some(notify);
        self
    }

    #[must_use]
    pub const fn with_telemetry(mut self, on: bool) -> Self {
        self.telemetry = on;
        self
    }

    /// Forget interpreter progress so the script starts over (after login
    /// preempts it or the connection drops). The deadline is kept.
    pub fn rewind(&mut self) {
        self.interp = None;
    }

    pub(crate) fn emit(&self, device: &str, kind: ActionEventKind) {
        if let (Some(request), Some(tx)) = (self.request, &self.notify) {
            // receiver gone means the server is shutting down
            let _ = tx.send(ActionEvent {
                request,
                device: device.to_string(),
                kind,
            });
        }
    }

    pub(crate) fn telemetry_line(&self, device: &str, line: String) {
        if self.telemetry {
            self.emit(device, ActionEventKind::Telemetry(line));
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("targets", &self.targets)
            .field("mode", &self.mode)
            .field("request", &self.request)
            .field("status", &self.status)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
