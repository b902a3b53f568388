//! Byte-stream links to power control devices.
//!
//! `connect` turns an `Endpoint` into a `Link`: a boxed reader/writer pair the
//! device task polls directly. The device never sees sockets, ttys or child
//! processes, only bytes.

use std::io;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::process::{Child, Command};

use crate::config::config as global_config;
use crate::endpoint::Endpoint;
use crate::error::PowermanError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Printable rendering of device traffic: `\r`, `\n`, `\t` escaped and
/// other control bytes as `\xNN`.
#[must_use]
pub fn memstr(b: &[u8]) -> String {
    let mut s = String::with_capacity(b.len());
    for &c in b {
        match c {
            b'\r' => s.push_str("\\r"),
            b'\n' => s.push_str("\\n"),
            b'\t' => s.push_str("\\t"),
            b'\\' => s.push_str("\\\\"),
            0x20..=0x7e => s.push(char::from(c)),
            _ => s.push_str(&format!("\\x{c:02X}")),
        }
    }
    s
}

pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
}

impl Link {
    /// Wrap an already open duplex stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::from_parts(Box::new(r), Box::new(w), None, false)
    }

    fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
        telnet: bool,
    ) -> Self {
        Self {
            reader: LinkReader {
                inner: reader,
                telnet: telnet.then(TelnetFilter::default),
            },
            writer: LinkWriter {
                inner: writer,
                _child: child,
            },
        }
    }
}

pub struct LinkReader {
    inner: BoxedReader,
    telnet: Option<TelnetFilter>,
}

impl LinkReader {
    /// Read whatever is available into `buf`. `Ok(0)` means end of stream.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    /// Move raw bytes into the device input buffer, answering any telnet
    /// negotiation into `replies`.
    pub fn accept(&mut self, raw: &[u8], input: &mut Vec<u8>, replies: &mut Vec<u8>) {
        match self.telnet.as_mut() {
            Some(t) => t.filter(raw, input, replies),
            None => input.extend_from_slice(raw),
        }
    }
}

pub struct LinkWriter {
    inner: BoxedWriter,
    /// Coprocess, killed when the link is dropped.
    _child: Option<Child>,
}

impl LinkWriter {
    /// Write some of `buf`, returning how many bytes went out.
    pub async fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).await
    }
}

/// Open a link to `endpoint`. The caller applies the connect timeout.
pub async fn connect(endpoint: &Endpoint) -> Result<Link, PowermanError> {
    match endpoint {
        Endpoint::Tcp { host, port, telnet } => {
            let addr = endpoint.addr().unwrap_or_else(|| format!("{host}:{port}"));
            let addrs = lookup_host(&addr)
                .await
                .map_err(|e| PowermanError::Connect(format!("bad address {addr}: {e}")))?;
            let mut last_err = None;
            for remote in addrs {
                match TcpStream::connect(remote).await {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        let (r, w) = stream.into_split();
                        tracing::debug!(%addr, %remote, "tcp connected");
                        return Ok(Link::from_parts(Box::new(r), Box::new(w), None, *telnet));
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(PowermanError::Connect(match last_err {
                Some(e) => format!("{addr}: {e}"),
                None => format!("{addr}: no addresses"),
            }))
        }
        Endpoint::Serial { path, flags } => {
            // line settings (baud, parity) are expected to be applied to the tty beforehand
            let file = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .await
                .map_err(|e| PowermanError::Connect(format!("{}: {e}", path.display())))?;
            let writer = file.try_clone().await?;
            tracing::debug!(path = %path.display(), %flags, "serial opened");
            Ok(Link::from_parts(Box::new(file), Box::new(writer), None, false))
        }
        Endpoint::Pipe { argv } => {
            let (prog, args) = argv
                .split_first()
                .ok_or_else(|| PowermanError::Connect("empty coprocess command".to_string()))?;
            let mut child = Command::new(prog)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| PowermanError::Connect(format!("{prog}: {e}")))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| PowermanError::Connect(format!("{prog}: no stdout")))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| PowermanError::Connect(format!("{prog}: no stdin")))?;
            tracing::debug!(command = %argv.join(" "), pid = ?child.id(), "coprocess started");
            Ok(Link::from_parts(
                Box::new(stdout),
                Box::new(stdin),
                Some(child),
                false,
            ))
        }
    }
}

/// Log device traffic when `POWERMAN_LOG_DEVICE_IO=1`.
pub fn log_io(device: &str, dir: &str, bytes: &[u8]) {
    if global_config().log_device_io {
        log::debug!("[dev {dir}] {device}: {}", memstr(bytes));
    }
}

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Strips telnet commands from the input stream and refuses every option.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: TelnetState,
}

impl TelnetFilter {
    pub fn filter(&mut self, raw: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &b in raw {
            self.state = match (self.state, b) {
                (TelnetState::Data, IAC) => TelnetState::Iac,
                (TelnetState::Data, _) => {
                    data.push(b);
                    TelnetState::Data
                }
                (TelnetState::Iac, IAC) => {
                    data.push(IAC);
                    TelnetState::Data
                }
                (TelnetState::Iac, WILL | WONT | DO | DONT) => TelnetState::Option(b),
                (TelnetState::Iac, SB) => TelnetState::Sub,
                (TelnetState::Iac, _) => TelnetState::Data,
                (TelnetState::Option(cmd), opt) => {
                    match cmd {
                        WILL => replies.extend_from_slice(&[IAC, DONT, opt]),
                        DO => replies.extend_from_slice(&[IAC, WONT, opt]),
                        _ => {}
                    }
                    TelnetState::Data
                }
                (TelnetState::Sub, IAC) => TelnetState::SubIac,
                (TelnetState::Sub, _) => TelnetState::Sub,
                (TelnetState::SubIac, SE) => TelnetState::Data,
                (TelnetState::SubIac, _) => TelnetState::Sub,
            };
        }
    }
}
