//! Compiled device specifications.
//!
//! A `DeviceSpec` is the immutable description of one type of power
//! controller: its timeouts, hardwired plug names and one `Script` per
//! supported command. Scripts are trees of `Statement`s; nested bodies are
//! shared `Arc` slices so a running interpreter can hold on to the block it
//! is executing without borrowing the spec.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::Command;

/// Highest capture group a `setplugstate` may reference.
pub const MAX_MATCH_POS: usize = 20;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlugState {
    On,
    Off,
    #[default]
    Unknown,
}

impl PlugState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PlugState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Block = Arc<[Statement]>;

/// Which plug a `setplugstate` applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlugRef {
    /// The plug the enclosing block is operating on.
    Target,
    Literal(String),
    /// Capture group of the most recent `expect`.
    Capture(usize),
}

/// Where a `setplugstate` takes its value text from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    Capture(usize),
    Literal(String),
}

/// Maps a value (e.g. "ON", "0x1") to a plug state.
#[derive(Debug, Clone)]
pub struct Interp {
    pub state: PlugState,
    pub regex: regex::Regex,
}

#[derive(Debug, Clone)]
pub enum Statement {
    /// Write text to the device; `%s` is replaced by the target plug name(s).
    Send { fmt: String },
    /// Wait until the device input matches.
    Expect { regex: regex::bytes::Regex },
    Delay(Duration),
    SetPlugState {
        plug: PlugRef,
        value: ValueRef,
        interps: Vec<Interp>,
    },
    ForeachPlug(Block),
    ForeachNode(Block),
    IfOn(Block),
    IfOff(Block),
}

impl Statement {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Expect { .. } => "expect",
            Self::Delay(_) => "delay",
            Self::SetPlugState { .. } => "setplugstate",
            Self::ForeachPlug(_) => "foreachplug",
            Self::ForeachNode(_) => "foreachnode",
            Self::IfOn(_) => "ifon",
            Self::IfOff(_) => "ifoff",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Script {
    pub command: Command,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub name: String,
    /// Per-action deadline, measured from the moment the action reaches the
    /// head of the device queue.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub ping_period: Option<Duration>,
    /// Hardwired plug names; empty for dynamic plug lists.
    pub plugs: Vec<String>,
    pub max_plugs: Option<usize>,
    pub on_string: String,
    pub off_string: String,
    pub scripts: HashMap<Command, Script>,
}

impl DeviceSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_TIMEOUT,
            ping_period: None,
            plugs: Vec::new(),
            max_plugs: None,
            on_string: "on".to_string(),
            off_string: "off".to_string(),
            scripts: HashMap::new(),
        }
    }

    #[must_use]
    pub fn script(&self, command: Command) -> Option<&Script> {
        self.scripts.get(&command)
    }

    #[must_use]
    pub fn supports(&self, command: Command) -> bool {
        self.scripts.contains_key(&command)
    }

    /// Interpret a raw value reported by the device.
    ///
    /// The first matching interp wins. Without interps the value is compared
    /// against the spec's on/off strings, ignoring case and surrounding
    /// whitespace.
    #[must_use]
    pub fn interpret(&self, value: &str, interps: &[Interp]) -> PlugState {
        if !interps.is_empty() {
            return interps
                .iter()
                .find(|i| i.regex.is_match(value))
                .map_or(PlugState::Unknown, |i| i.state);
        }
        let v = value.trim();
        if v.eq_ignore_ascii_case(&self.on_string) {
            PlugState::On
        } else if v.eq_ignore_ascii_case(&self.off_string) {
            PlugState::Off
        } else {
            PlugState::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpret_uses_interps_then_strings() {
        let spec = DeviceSpec::new("t");
        assert_eq!(spec.interpret(" ON ", &[]), PlugState::On);
        assert_eq!(spec.interpret("off", &[]), PlugState::Off);
        assert_eq!(spec.interpret("maybe", &[]), PlugState::Unknown);

        let interps = vec![
            Interp {
                state: PlugState::On,
                regex: regex::Regex::new("^1$").unwrap(),
            },
            Interp {
                state: PlugState::Off,
                regex: regex::Regex::new("^0$").unwrap(),
            },
        ];
        assert_eq!(spec.interpret("1", &interps), PlugState::On);
        assert_eq!(spec.interpret("0", &interps), PlugState::Off);
        assert_eq!(spec.interpret("on", &interps), PlugState::Unknown);
    }
}
