use std::fmt;
use std::path::PathBuf;

use crate::error::PowermanError;

/// Where a power control device is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Network socket, optionally speaking telnet.
    Tcp {
        host: String,
        port: u16,
        telnet: bool,
    },
    /// Serial line; `flags` is e.g. "9600,8n1".
    Serial { path: PathBuf, flags: String },
    /// Coprocess speaking the dialogue on stdin/stdout.
    Pipe { argv: Vec<String> },
}

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 23;
pub const DEFAULT_SERIAL_FLAGS: &str = "9600,8n1";

impl Endpoint {
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
            telnet: false,
        }
    }

    #[must_use]
    pub fn with_telnet(mut self, on: bool) -> Self {
        if let Self::Tcp { telnet, .. } = &mut self {
            *telnet = on;
        }
        self
    }

    #[must_use]
    pub fn serial(path: impl Into<PathBuf>, flags: Option<&str>) -> Self {
        Self::Serial {
            path: path.into(),
            flags: flags.unwrap_or(DEFAULT_SERIAL_FLAGS).to_string(),
        }
    }

    /// Command line split on whitespace, e.g. `"ipmipower -h pm[1-4]"`.
    pub fn pipe(command: &str) -> Result<Self, PowermanError> {
        let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(PowermanError::Config("empty coprocess command".to_string()));
        }
        Ok(Self::Pipe { argv })
    }

    /// Parse `"host:port"`, `"[v6addr]:port"` or a bare host (telnet port).
    pub fn parse_host_port(s: &str) -> Result<Self, PowermanError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::tcp(DEFAULT_HOST, DEFAULT_PORT));
        }
        let bad_port = || PowermanError::Config(format!("bad port in '{s}'"));
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (h, tail) = rest
                .split_once(']')
                .ok_or_else(|| PowermanError::Config(format!("missing ']' in '{s}'")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse::<u16>().map_err(|_| bad_port())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(bad_port()),
            };
            (h, port)
        } else if let Some((h, p)) = s.split_once(':').filter(|_| s.matches(':').count() == 1) {
            (h, p.parse::<u16>().map_err(|_| bad_port())?)
        } else {
            (s, DEFAULT_PORT)
        };
        Ok(Self::tcp(host, port))
    }

    /// Address string for TCP endpoints ("host:port").
    #[must_use]
    pub fn addr(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port, .. } if host.contains(':') => Some(format!("[{host}]:{port}")),
            Self::Tcp { host, port, .. } => Some(format!("{host}:{port}")),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { telnet, .. } => {
                write!(f, "{}", self.addr().unwrap_or_default())?;
                if *telnet {
                    f.write_str(" (telnet)")?;
                }
                Ok(())
            }
            Self::Serial { path, flags } => write!(f, "{} {flags}", path.display()),
            Self::Pipe { argv } => write!(f, "|{}", argv.join(" ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_forms() {
        assert_eq!(
            Endpoint::parse_host_port("pdu1:2000").unwrap(),
            Endpoint::tcp("pdu1", 2000)
        );
        assert_eq!(
            Endpoint::parse_host_port("pdu1").unwrap(),
            Endpoint::tcp("pdu1", 23)
        );
        assert_eq!(
            Endpoint::parse_host_port("[::1]:10101").unwrap(),
            Endpoint::tcp("::1", 10101)
        );
        assert!(Endpoint::parse_host_port("pdu1:notaport").is_err());
    }

    #[test]
    fn pipe_requires_command() {
        assert!(Endpoint::pipe("   ").is_err());
        assert_eq!(
            Endpoint::pipe("ipmipower -h pm[1-4]").unwrap(),
            Endpoint::Pipe {
                argv: vec!["ipmipower".into(), "-h".into(), "pm[1-4]".into()]
            }
        );
    }
}
