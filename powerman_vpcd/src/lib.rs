//! Virtual power controller.
//!
//! Speaks the `vpc` dialogue that the builtin `vpc` device spec drives:
//!
//! ```text
//! 0 vpc> login
//! 0 OK
//! 1 vpc> stat
//! plug 0: OFF
//! ...
//! 1 OK
//! 2 vpc>
//! ```
//!
//! Plug state is shared by every connection to the same `Vpc`, so a test can
//! reconnect and still see what an earlier session switched.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use powerman::transport::memstr;

pub const DEFAULT_PLUGS: usize = 16;

const SPEW: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()-_=+[]";

#[derive(Debug, Clone)]
pub struct VpcOptions {
    pub plugs: usize,
    /// Never answer the first `on N`.
    pub drop_command: bool,
    /// Answer the first `on N` with UNKNOWN instead of OK.
    pub bad_response: bool,
    /// Accept connections but never prompt.
    pub hung: bool,
    /// `stat_soft` always reports plug 0 as OFF.
    pub soft_off: bool,
}

impl Default for VpcOptions {
    fn default() -> Self {
        Self {
            plugs: DEFAULT_PLUGS,
            drop_command: false,
            bad_response: false,
            hung: false,
            soft_off: false,
        }
    }
}

#[derive(Debug)]
struct Shared {
    plugs: Vec<bool>,
    beacons: Vec<bool>,
    errcount: u32,
    connections: u32,
    history: Vec<String>,
}

/// Outcome of one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// The session ends after `text` is written (logoff).
    pub close: bool,
}

impl Answer {
    fn text(text: String) -> Self {
        Self { text, close: false }
    }
}

#[derive(Debug, Clone)]
pub struct Vpc {
    opts: Arc<VpcOptions>,
    shared: Arc<Mutex<Shared>>,
}

impl Vpc {
    #[must_use]
    pub fn new(opts: VpcOptions) -> Self {
        let n = opts.plugs;
        Self {
            opts: Arc::new(opts),
            shared: Arc::new(Mutex::new(Shared {
                plugs: vec![false; n],
                beacons: vec![false; n],
                errcount: 0,
                connections: 0,
                history: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn plug(&self, i: usize) -> Option<bool> {
        self.lock().plugs.get(i).copied()
    }

    pub fn set_plug(&self, i: usize, on: bool) {
        if let Some(p) = self.lock().plugs.get_mut(i) {
            *p = on;
        }
    }

    #[must_use]
    pub fn beacon(&self, i: usize) -> Option<bool> {
        self.lock().beacons.get(i).copied()
    }

    /// Connections accepted so far.
    #[must_use]
    pub fn connections(&self) -> u32 {
        self.lock().connections
    }

    /// Every non-empty command line received, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// Execute one command line at sequence number `seq`.
    ///
    /// Returns `None` when the command is deliberately left unanswered.
    pub fn respond(&self, seq: u64, line: &str, logged_in: &mut bool) -> Option<Answer> {
        let cmd = line.trim_end_matches('\r');
        if cmd.is_empty() {
            return Some(Answer::text(String::new()));
        }
        let mut st = self.lock();
        st.history.push(cmd.to_string());
        let ok = format!("{seq} OK\n");
        if cmd == "logoff" {
            *logged_in = false;
            return Some(Answer { text: ok, close: true });
        }
        if cmd == "login" {
            *logged_in = true;
            return Some(Answer::text(ok));
        }
        if !*logged_in {
            return Some(Answer::text(format!("{seq} Please login\n")));
        }
        let n = st.plugs.len();
        let unknown = format!("{seq} UNKNOWN: {cmd}\n");
        let badval = |v: i64| Answer::text(format!("{seq} BADVAL: {v}\n"));

        let listing = |vals: &[bool], force_off0: bool| {
            let mut s = String::new();
            for (i, on) in vals.iter().enumerate() {
                let on = *on && !(force_off0 && i == 0);
                s.push_str(&format!("plug {i}: {}\n", if on { "ON" } else { "OFF" }));
            }
            s
        };
        match cmd {
            "stat" => return Some(Answer::text(listing(&st.plugs, false) + &ok)),
            "stat_soft" => return Some(Answer::text(listing(&st.plugs, self.opts.soft_off) + &ok)),
            "beacon" => return Some(Answer::text(listing(&st.beacons, false) + &ok)),
            "temp" => {
                let mut s = String::new();
                for i in 0..n {
                    s.push_str(&format!("plug {i}: {}\n", 30 + i));
                }
                return Some(Answer::text(s + &ok));
            }
            "on *" | "off *" | "toggle *" => {
                for p in &mut st.plugs {
                    *p = match cmd {
                        "on *" => true,
                        "off *" => false,
                        _ => !*p,
                    };
                }
                return Some(Answer::text(ok));
            }
            _ => {}
        }

        let Some((verb, arg)) = cmd.split_once(' ') else {
            return Some(Answer::text(unknown));
        };
        let Ok(v) = arg.trim().parse::<i64>() else {
            return Some(Answer::text(unknown));
        };
        if verb == "spew" {
            if v <= 0 {
                return Some(badval(v));
            }
            let width = SPEW.len();
            let mut s = String::new();
            for i in 0..usize::try_from(v).unwrap_or(0) {
                let k = i % width;
                s.push_str(&SPEW[k..]);
                s.push_str(&SPEW[..k]);
                s.push('\n');
            }
            return Some(Answer::text(s + &ok));
        }
        if !matches!(verb, "on" | "off" | "toggle" | "flash" | "unflash") {
            return Some(Answer::text(unknown));
        }
        let idx = match usize::try_from(v) {
            Ok(i) if i < n => i,
            _ => return Some(badval(v)),
        };
        if verb == "on" {
            if self.opts.drop_command {
                st.errcount += 1;
                if st.errcount == 1 {
                    warn!("dropping OK response to 'on' command");
                    return None;
                }
            }
            if self.opts.bad_response {
                st.errcount += 1;
                if st.errcount == 1 {
                    warn!("responding to 'on' with UNKNOWN instead of OK");
                    return Some(Answer::text(unknown));
                }
            }
        }
        match verb {
            "on" => st.plugs[idx] = true,
            "off" => st.plugs[idx] = false,
            "toggle" => st.plugs[idx] = !st.plugs[idx],
            "flash" => st.beacons[idx] = true,
            _ => st.beacons[idx] = false,
        }
        Some(Answer::text(ok))
    }

    /// Run the prompt loop on one stream until EOF or logoff.
    pub async fn serve<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (r, mut w) = tokio::io::split(stream);
        let mut lines = BufReader::new(r).lines();
        self.lock().connections += 1;
        if self.opts.hung {
            warn!("vpc is hung");
            while lines.next_line().await?.is_some() {}
            return Ok(());
        }
        let mut logged_in = false;
        let mut seq: u64 = 0;
        loop {
            w.write_all(format!("{seq} vpc> ").as_bytes()).await?;
            w.flush().await?;
            let Some(line) = lines.next_line().await? else {
                debug!("read returned EOF");
                break;
            };
            debug!(line = %memstr(line.as_bytes()), "command");
            if let Some(answer) = self.respond(seq, &line, &mut logged_in) {
                w.write_all(answer.text.as_bytes()).await?;
                w.flush().await?;
                if answer.close {
                    break;
                }
            }
            seq += 1;
        }
        w.shutdown().await?;
        Ok(())
    }

    /// Accept connections forever, one task per connection.
    pub async fn run_listener_on(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "connection");
            let vpc = self.clone();
            tokio::spawn(async move {
                if let Err(e) = vpc.serve(stream).await {
                    debug!(%peer, error = %e, "session ended");
                }
            });
        }
    }

    /// Serve a single session on stdin/stdout (coprocess mode).
    pub async fn serve_stdio(&self) -> io::Result<()> {
        let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
        self.serve(stdio).await
    }
}

/// Bind with `SO_REUSEADDR`.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(10)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
