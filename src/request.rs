//! Client request lines.
//!
//! A request is one line of text: a case-insensitive verb and at most one
//! argument (a hostlist or a device name).

use std::fmt;
use std::str::FromStr;

use crate::commands::Command;

/// Power or query verb that targets nodes and runs device scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    On,
    Off,
    Cycle,
    Reset,
    Flash,
    Unflash,
    Status,
    Temp,
    Beacon,
}

impl Verb {
    /// Script used when a device handles one plug at a time.
    #[must_use]
    pub const fn command(&self) -> Command {
        match self {
            Self::On => Command::On,
            Self::Off => Command::Off,
            Self::Cycle => Command::Cycle,
            Self::Reset => Command::Reset,
            Self::Flash => Command::BeaconOn,
            Self::Unflash => Command::BeaconOff,
            Self::Status => Command::Status,
            Self::Temp => Command::StatusTemp,
            Self::Beacon => Command::StatusBeacon,
        }
    }

    #[must_use]
    pub const fn is_query(&self) -> bool {
        matches!(self, Self::Status | Self::Temp | Self::Beacon)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Cycle => "cycle",
            Self::Reset => "reset",
            Self::Flash => "flash",
            Self::Unflash => "unflash",
            Self::Status => "status",
            Self::Temp => "temp",
            Self::Beacon => "beacon",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Help,
    Nodes,
    Telemetry,
    Exprange,
    Quit,
    /// A verb with its node argument. Queries may omit it (all nodes).
    Power { verb: Verb, nodes: Option<String> },
    Device(Option<String>),
    Unknown,
}

impl Request {
    /// Parse one request line (without the line terminator).
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Self::Unknown;
        };
        let arg = words.next().map(str::to_string);
        if words.next().is_some() {
            return Self::Unknown;
        }
        let verb = verb.to_ascii_lowercase();
        let needs_arg = |v: Verb| match &arg {
            Some(_) => Self::Power {
                verb: v,
                nodes: arg.clone(),
            },
            None => Self::Unknown,
        };
        let query = |v: Verb| Self::Power {
            verb: v,
            nodes: arg.clone(),
        };
        match (verb.as_str(), arg.is_some()) {
            ("help", false) => Self::Help,
            ("nodes", false) => Self::Nodes,
            ("telemetry", false) => Self::Telemetry,
            ("exprange", false) => Self::Exprange,
            ("quit", false) => Self::Quit,
            ("on", _) => needs_arg(Verb::On),
            ("off", _) => needs_arg(Verb::Off),
            ("cycle", _) => needs_arg(Verb::Cycle),
            ("reset", _) => needs_arg(Verb::Reset),
            ("flash", _) => needs_arg(Verb::Flash),
            ("unflash", _) => needs_arg(Verb::Unflash),
            ("status", _) => query(Verb::Status),
            ("temp", _) => query(Verb::Temp),
            ("beacon", _) => query(Verb::Beacon),
            ("device", _) => Self::Device(arg.clone()),
            _ => Self::Unknown,
        }
    }
}

impl FromStr for Request {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Help => f.write_str("help"),
            Self::Nodes => f.write_str("nodes"),
            Self::Telemetry => f.write_str("telemetry"),
            Self::Exprange => f.write_str("exprange"),
            Self::Quit => f.write_str("quit"),
            Self::Power { verb, nodes: Some(n) } => write!(f, "{verb} {n}"),
            Self::Power { verb, nodes: None } => write!(f, "{verb}"),
            Self::Device(Some(d)) => write!(f, "device {d}"),
            Self::Device(None) => f.write_str("device"),
            Self::Unknown => f.write_str("?"),
        }
    }
}
