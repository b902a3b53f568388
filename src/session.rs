//! Per-client protocol state.
//!
//! A `Session` turns request lines into response text. It performs no I/O;
//! the server feeds it lines and writes whatever `Output` comes back.

use tracing::debug;

use crate::action::RequestId;
use crate::client_proto::{self as cp, CP_EOL, CP_PROMPT};
use crate::dispatch::{ClientId, Dispatcher, Reply, Submitted};
use crate::request::Request;

/// Text for the client, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub lines: Vec<String>,
    /// Follow the lines with a prompt.
    pub prompt: bool,
    /// Close the connection once written.
    pub close: bool,
}

impl Output {
    fn lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            prompt: false,
            close: false,
        }
    }

    fn with_prompt(mut self) -> Self {
        self.prompt = true;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && !self.prompt
    }

    /// Wire form: CRLF-terminated lines, then the prompt if any.
    #[must_use]
    pub fn render(&self) -> String {
        let mut s = String::new();
        for l in &self.lines {
            s.push_str(l);
            s.push_str(CP_EOL);
        }
        if self.prompt {
            s.push_str(CP_PROMPT);
        }
        s
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: ClientId,
    pub telemetry: bool,
    pub exprange: bool,
    busy: Option<RequestId>,
    quit: bool,
}

impl Session {
    #[must_use]
    pub const fn new(id: ClientId) -> Self {
        Self {
            id,
            telemetry: false,
            exprange: false,
            busy: None,
            quit: false,
        }
    }

    #[must_use]
    pub fn greeting(version: &str) -> Output {
        Output::lines(vec![cp::version_line(version)]).with_prompt()
    }

    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.busy.is_some()
    }

    /// The line exceeded the length limit and was discarded.
    #[must_use]
    pub fn too_long(&self) -> Output {
        Output::lines(vec![cp::CP_ERR_TOOLONG.to_string()]).with_prompt()
    }

    pub fn handle_line(&mut self, line: &str, dispatcher: &mut Dispatcher) -> Output {
        if self.quit {
            return Output::default();
        }
        if self.busy.is_some() {
            return Output::lines(vec![cp::CP_ERR_COM_IN_PROGRESS.to_string()]);
        }
        let request = Request::parse(line);
        debug!(client = self.id, %request, "request");
        let lines = match request {
            Request::Help => {
                let mut l: Vec<String> = cp::CP_RSP_HELP.iter().map(|s| (*s).to_string()).collect();
                l.push(cp::CP_RSP_QUERY_COMPLETE.to_string());
                l
            }
            Request::Nodes => dispatcher.nodes_reply(self.exprange),
            Request::Telemetry => {
                self.telemetry = !self.telemetry;
                let rsp = if self.telemetry { cp::CP_RSP_TELEMETRY_ON } else { cp::CP_RSP_TELEMETRY_OFF };
                vec![rsp.to_string()]
            }
            Request::Exprange => {
                self.exprange = !self.exprange;
                let rsp = if self.exprange { cp::CP_RSP_EXPRANGE_ON } else { cp::CP_RSP_EXPRANGE_OFF };
                vec![rsp.to_string()]
            }
            Request::Quit => {
                self.quit = true;
                return Output {
                    lines: vec![cp::CP_RSP_QUIT.to_string()],
                    prompt: false,
                    close: true,
                };
            }
            Request::Device(arg) => dispatcher.device_reply(arg.as_deref()),
            Request::Power { verb, nodes } => {
                match dispatcher.submit(self.id, verb, nodes.as_deref(), self.telemetry, self.exprange) {
                    Submitted::Done(lines) => lines,
                    Submitted::Started { request, lines } => {
                        self.busy = Some(request);
                        return Output::lines(lines);
                    }
                }
            }
            Request::Unknown => vec![cp::CP_ERR_UNKNOWN.to_string()],
        };
        Output::lines(lines).with_prompt()
    }

    /// Lines produced by the in-flight request.
    pub fn on_reply(&mut self, reply: Reply) -> Output {
        let out = Output::lines(reply.lines);
        if reply.done {
            self.busy = None;
            if !self.quit {
                return out.with_prompt();
            }
        }
        out
    }
}

/// Splits a byte stream into request lines of bounded length.
///
/// Lines end at `\n` (a preceding `\r` is dropped). A line reaching `max`
/// bytes is reported once as `Line::TooLong` and the rest of it is skipped.
#[derive(Debug)]
pub struct LineSplitter {
    buf: Vec<u8>,
    max: usize,
    discarding: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Text(String),
    TooLong,
}

impl LineSplitter {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
            discarding: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Line> {
        let mut out = Vec::new();
        for &b in data {
            if b == b'\n' {
                if !self.discarding {
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                    out.push(Line::Text(String::from_utf8_lossy(&self.buf).into_owned()));
                }
                self.buf.clear();
                self.discarding = false;
                continue;
            }
            if self.discarding {
                continue;
            }
            self.buf.push(b);
            if self.buf.len() >= self.max {
                out.push(Line::TooLong);
                self.buf.clear();
                self.discarding = true;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_crlf_lines() {
        let mut s = LineSplitter::new(64);
        assert!(s.push(b"sta").is_empty());
        assert_eq!(
            s.push(b"tus\r\nnodes\n"),
            vec![Line::Text("status".into()), Line::Text("nodes".into())]
        );
    }

    #[test]
    fn overlong_line_reported_once() {
        let mut s = LineSplitter::new(8);
        let lines = s.push(b"0123456789abcdef\r\nhelp\r\n");
        assert_eq!(lines, vec![Line::TooLong, Line::Text("help".into())]);
    }

    #[test]
    fn render_appends_prompt() {
        let out = Output::lines(vec!["104 Telemetry ON".into()]).with_prompt();
        assert_eq!(out.render(), "104 Telemetry ON\r\npowerman> ");
    }
}
