//! Async client for the powermand protocol.
//!
//! ```no_run
//! # async fn demo() -> Result<(), powerman::PowermanError> {
//! let mut pm = powerman::PowermanClient::new().connect("localhost:10101").await?;
//! pm.node_on("t[0-3]").await?;
//! let state = pm.node_status("t0").await?;
//! println!("t0 is {state}");
//! pm.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::client_proto::{is_final, CP_EOL, CP_PROMPT, DEFAULT_PORT};
use crate::error::PowermanError;
use crate::hostlist::Hostlist;
use crate::response::{Response, ResponseLine};
use crate::script::PlugState;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// One `304` line of the `device` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub state: String,
    pub reconnects: u32,
    pub actions: u32,
    pub kind: String,
    pub hosts: String,
}

impl DeviceInfo {
    fn parse(text: &str) -> Option<Self> {
        let (name, rest) = text.split_once(": ")?;
        let mut fields = std::collections::HashMap::new();
        for kv in rest.split_whitespace() {
            let (k, v) = kv.split_once('=')?;
            fields.insert(k, v);
        }
        Some(Self {
            name: name.to_string(),
            state: (*fields.get("state")?).to_string(),
            reconnects: fields.get("reconnects")?.parse().ok()?,
            actions: fields.get("actions")?.parse().ok()?,
            kind: (*fields.get("type")?).to_string(),
            hosts: (*fields.get("hosts")?).to_string(),
        })
    }
}

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Connection to powermand. One request at a time.
pub struct PowermanClient {
    timeout: Duration,
    conn: Option<Conn>,
    /// Server greeting version.
    pub server_version: Option<String>,
}

impl Default for PowermanClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PowermanClient {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            conn: None,
            server_version: None,
        }
    }

    /// Per-request timeout (default 60 s).
    #[must_use]
    pub const fn with_timeout(mut self, t: Duration) -> Self {
        self.timeout = t;
        self
    }

    /// Connect to `host:port`; a bare host uses port 10101.
    pub async fn connect(mut self, addr: &str) -> Result<Self, PowermanError> {
        let addr = if addr.is_empty() {
            format!("localhost:{DEFAULT_PORT}")
        } else if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{addr}:{DEFAULT_PORT}")
        };
        let stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| PowermanError::Timeout)?
            .map_err(|e| PowermanError::Connect(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        self.conn = Some(Conn {
            reader: BufReader::new(r),
            writer: w,
        });
        let greeting = self.read_response().await?;
        self.server_version = (greeting.code == 1).then_some(greeting.text);
        Ok(self)
    }

    /// Send `quit` and close.
    pub async fn disconnect(&mut self) -> Result<(), PowermanError> {
        if self.conn.is_some() {
            let _ = self.raw("quit").await;
        }
        self.conn = None;
        Ok(())
    }

    /// Send one request line and collect its complete response.
    pub async fn raw(&mut self, line: &str) -> Result<Response, PowermanError> {
        let conn = self.conn.as_mut().ok_or(PowermanError::NoTarget)?;
        let mut buf = String::with_capacity(line.len() + 2);
        buf.push_str(line);
        buf.push_str(CP_EOL);
        conn.writer.write_all(buf.as_bytes()).await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<Response, PowermanError> {
        let limit = self.timeout;
        let conn = self.conn.as_mut().ok_or(PowermanError::NoTarget)?;
        timeout(limit, read_until_final(&mut conn.reader))
            .await
            .map_err(|_| PowermanError::Timeout)?
    }

    async fn request(&mut self, line: &str) -> Result<Response, PowermanError> {
        self.raw(line).await?.into_result()
    }

    /// Power state of every node in `nodes`, keyed by node. An empty list
    /// asks for every node.
    pub async fn status(&mut self, nodes: &str) -> Result<Vec<(String, PlugState)>, PowermanError> {
        let rsp = self.request(&query_line("status", nodes)).await?;
        node_states(&rsp)
    }

    /// Beacon state of every node in `nodes`.
    pub async fn beacon(&mut self, nodes: &str) -> Result<Vec<(String, PlugState)>, PowermanError> {
        let rsp = self.request(&query_line("beacon", nodes)).await?;
        node_states(&rsp)
    }

    pub async fn node_status(&mut self, node: &str) -> Result<PlugState, PowermanError> {
        let all = self.status(node).await?;
        Ok(all
            .into_iter()
            .find(|(n, _)| n == node)
            .map_or(PlugState::Unknown, |(_, s)| s))
    }

    pub async fn node_on(&mut self, nodes: &str) -> Result<Response, PowermanError> {
        self.request(&format!("on {nodes}")).await
    }

    pub async fn node_off(&mut self, nodes: &str) -> Result<Response, PowermanError> {
        self.request(&format!("off {nodes}")).await
    }

    pub async fn node_cycle(&mut self, nodes: &str) -> Result<Response, PowermanError> {
        self.request(&format!("cycle {nodes}")).await
    }

    pub async fn node_reset(&mut self, nodes: &str) -> Result<Response, PowermanError> {
        self.request(&format!("reset {nodes}")).await
    }

    /// Configured nodes, expanded.
    pub async fn nodes(&mut self) -> Result<Vec<String>, PowermanError> {
        let rsp = self.request("nodes").await?;
        let mut out = Vec::new();
        for text in rsp.data(306) {
            out.extend(Hostlist::parse(text)?.into_vec());
        }
        out.extend(rsp.data(307).map(str::to_string));
        Ok(out)
    }

    pub async fn device_status(&mut self, arg: Option<&str>) -> Result<Vec<DeviceInfo>, PowermanError> {
        let line = arg.map_or_else(|| "device".to_string(), |a| format!("device {a}"));
        let rsp = self.request(&line).await?;
        rsp.data(304)
            .map(|t| {
                DeviceInfo::parse(t)
                    .ok_or_else(|| PowermanError::Protocol(format!("bad device line: '{t}'")))
            })
            .collect()
    }

    /// `(node, value)` pairs from the `temp` query; unknown nodes come
    /// back collapsed with the value "unknown".
    pub async fn temp(&mut self, nodes: Option<&str>) -> Result<Vec<(String, String)>, PowermanError> {
        let line = nodes.map_or_else(|| "temp".to_string(), |n| format!("temp {n}"));
        let rsp = self.request(&line).await?;
        Ok(rsp
            .data(303)
            .filter_map(|t| t.rsplit_once(": "))
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect())
    }

    /// Toggle telemetry; returns the new setting.
    pub async fn telemetry(&mut self) -> Result<bool, PowermanError> {
        let rsp = self.request("telemetry").await?;
        Ok(rsp.text.ends_with("ON"))
    }

    /// Toggle host range expansion; returns the new setting.
    pub async fn exprange(&mut self) -> Result<bool, PowermanError> {
        let rsp = self.request("exprange").await?;
        Ok(rsp.text.ends_with("ON"))
    }
}

fn query_line(verb: &str, nodes: &str) -> String {
    if nodes.is_empty() {
        verb.to_string()
    } else {
        format!("{verb} {nodes}")
    }
}

fn parse_state(s: &str) -> PlugState {
    match s.trim() {
        "on" => PlugState::On,
        "off" => PlugState::Off,
        _ => PlugState::Unknown,
    }
}

/// `302 state: ranged` and `303 node: state` lines, flattened per node.
fn node_states(rsp: &Response) -> Result<Vec<(String, PlugState)>, PowermanError> {
    let mut out = Vec::new();
    for text in rsp.data(302) {
        let (state, list) = text.split_once(':').unwrap_or((text, ""));
        let state = parse_state(state);
        let list = list.trim();
        if list.is_empty() {
            continue;
        }
        let hl = Hostlist::parse(list)?;
        out.extend(hl.iter().map(|n| (n.to_string(), state)));
    }
    for text in rsp.data(303) {
        if let Some((node, state)) = text.rsplit_once(": ") {
            out.push((node.to_string(), parse_state(state)));
        }
    }
    Ok(out)
}

/// Read lines until a final one (1xx/2xx, or the `001` greeting), then
/// swallow the prompt that follows it.
async fn read_until_final(reader: &mut BufReader<OwnedReadHalf>) -> Result<Response, PowermanError> {
    let mut lines: Vec<ResponseLine> = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(PowermanError::Protocol("connection closed by server".to_string()));
        }
        let rl = ResponseLine::parse(&line)?;
        if rl.code < 100 || is_final(rl.code) {
            // no prompt after goodbye or a rejected concurrent request
            if rl.code != 101 && rl.code != 208 {
                let mut p = vec![0u8; CP_PROMPT.len()];
                reader.read_exact(&mut p).await?;
                if p != CP_PROMPT.as_bytes() {
                    return Err(PowermanError::Protocol("missing prompt".to_string()));
                }
            }
            return Ok(Response {
                lines,
                code: rl.code,
                text: rl.text,
            });
        }
        lines.push(rl);
    }
}
