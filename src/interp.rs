//! Resumable script interpreter.
//!
//! An `Interpreter` runs one `Script` for one `Action`. It never performs
//! I/O: `advance` consumes bytes from the device input buffer, appends to the
//! output buffer and returns a `Step` telling the device what it is waiting
//! for. All progress lives in an explicit frame stack, so the interpreter can
//! be suspended at any statement and resumed on the next readiness event.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::time::Instant;

use crate::action::{ActionResults, TargetMode};
use crate::hostlist::Hostlist;
use crate::pluglist::PlugList;
use crate::script::{Block, DeviceSpec, PlugRef, PlugState, Script, Statement, ValueRef};
use crate::transport::memstr;

/// What the interpreter needs before it can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The script ran to completion.
    Done,
    /// An `expect` has not matched yet.
    WaitInput,
    /// A `send` is still sitting in the output buffer.
    WaitOutput,
    /// A `delay` ends at the given instant.
    WaitUntil(Instant),
}

/// Device-owned state an interpreter reads and writes while advancing.
pub struct ExecEnv<'a> {
    pub device: &'a str,
    pub spec: &'a DeviceSpec,
    pub plugs: &'a PlugList,
    pub input: &'a mut Vec<u8>,
    pub output: &'a mut Vec<u8>,
    /// Last known plug states from earlier actions on this device.
    pub known: &'a HashMap<String, PlugState>,
    pub short_circuit_delay: bool,
}

#[derive(Debug)]
struct Frame {
    block: Block,
    pc: usize,
    /// Plug(s) the block operates on.
    plugs: Vec<String>,
    /// Remaining plugs of an active foreach at `pc`.
    foreach: Option<VecDeque<String>>,
    /// Statement at `pc` has started but not finished.
    processing: bool,
}

impl Frame {
    fn new(block: Block, plugs: Vec<String>) -> Self {
        Self {
            block,
            pc: 0,
            plugs,
            foreach: None,
            processing: false,
        }
    }

    fn next(&mut self) {
        self.pc += 1;
        self.processing = false;
    }
}

#[derive(Debug)]
pub struct Interpreter {
    body: Block,
    mode: TargetMode,
    targets: Option<Vec<String>>,
    /// Plug scopes still to run the script body for (one per plug in single mode).
    roots: VecDeque<Vec<String>>,
    frames: Vec<Frame>,
    captures: Vec<Option<String>>,
    delay_until: Option<Instant>,
    telemetry: Option<Vec<String>>,
    pub results: ActionResults,
}

impl Interpreter {
    #[must_use]
    pub fn new(
        script: &Script,
        targets: Option<&[String]>,
        mode: TargetMode,
        telemetry: bool,
    ) -> Self {
        let roots = match (mode, targets) {
            // nothing to do: the script never runs
            (TargetMode::Single | TargetMode::Ranged, Some([])) => VecDeque::new(),
            (TargetMode::Single, Some(t)) => t.iter().map(|p| vec![p.clone()]).collect(),
            (TargetMode::Ranged, Some(t)) => VecDeque::from([t.to_vec()]),
            _ => VecDeque::from([Vec::new()]),
        };
        Self {
            body: Arc::clone(&script.body),
            mode,
            targets: targets.map(<[String]>::to_vec),
            roots,
            frames: Vec::new(),
            captures: Vec::new(),
            delay_until: None,
            telemetry: telemetry.then(Vec::new),
            results: ActionResults::default(),
        }
    }

    /// Telemetry lines produced since the last call.
    pub fn take_telemetry(&mut self) -> Vec<String> {
        self.telemetry.as_mut().map(std::mem::take).unwrap_or_default()
    }

    fn telemetry(&mut self, line: String) {
        if let Some(t) = self.telemetry.as_mut() {
            t.push(line);
        }
    }

    /// Text of capture group `i` of the last successful `expect`.
    fn capture(&self, i: usize) -> Option<String> {
        self.captures
            .get(i)
            .cloned()
            .flatten()
            .filter(|s| !s.is_empty())
    }

    /// Plugs a foreach iterates: every plug for whole-device actions,
    /// otherwise the targets, in plug list order.
    fn foreach_plugs(&self, plugs: &PlugList, nodes_only: bool) -> VecDeque<String> {
        plugs
            .iter()
            .filter(|p| !nodes_only || p.node.is_some())
            .filter(|p| match (&self.targets, self.mode) {
                (Some(t), TargetMode::Single | TargetMode::Ranged) => t.contains(&p.name),
                _ => true,
            })
            .map(|p| p.name.clone())
            .collect()
    }

    /// Run statements until the script finishes or has to wait.
    pub fn advance(&mut self, env: &mut ExecEnv<'_>, now: Instant) -> Step {
        loop {
            let Some(idx) = self.frames.len().checked_sub(1) else {
                match self.roots.pop_front() {
                    Some(scope) => {
                        self.frames.push(Frame::new(Arc::clone(&self.body), scope));
                        continue;
                    }
                    None => return Step::Done,
                }
            };
            let block = Arc::clone(&self.frames[idx].block);
            let pc = self.frames[idx].pc;
            let Some(stmt) = block.get(pc) else {
                self.frames.pop();
                continue;
            };
            match stmt {
                Statement::Send { fmt } => {
                    if !self.frames[idx].processing {
                        let text = expand_send(fmt, &self.frames[idx].plugs);
                        self.telemetry(format!(
                            "send({}): '{}'",
                            env.device,
                            memstr(text.as_bytes())
                        ));
                        env.output.extend_from_slice(text.as_bytes());
                        self.frames[idx].processing = true;
                    }
                    if !env.output.is_empty() {
                        return Step::WaitOutput;
                    }
                    self.frames[idx].next();
                }
                Statement::Expect { regex } => {
                    let matched = regex.captures(env.input.as_slice()).map(|caps| {
                        let end = caps.get(0).map_or(0, |m| m.end());
                        let groups: Vec<Option<String>> = caps
                            .iter()
                            .map(|g| g.map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned()))
                            .collect();
                        (end, groups)
                    });
                    let Some((end, groups)) = matched else {
                        return Step::WaitInput;
                    };
                    let consumed: Vec<u8> = env.input.drain(..end).collect();
                    self.telemetry(format!("recv({}): '{}'", env.device, memstr(&consumed)));
                    self.captures = groups;
                    self.frames[idx].next();
                }
                Statement::Delay(d) => {
                    if env.short_circuit_delay || d.is_zero() {
                        self.frames[idx].next();
                        continue;
                    }
                    let until = match self.delay_until {
                        Some(u) => u,
                        None => {
                            let u = now + *d;
                            self.delay_until = Some(u);
                            self.telemetry(format!("delay({}): {:.6}", env.device, d.as_secs_f64()));
                            u
                        }
                    };
                    if now < until {
                        return Step::WaitUntil(until);
                    }
                    self.delay_until = None;
                    self.frames[idx].next();
                }
                Statement::SetPlugState {
                    plug,
                    value,
                    interps,
                } => {
                    // a target reference covers every plug in scope
                    let plug_names: Vec<String> = match plug {
                        PlugRef::Literal(name) => vec![name.clone()],
                        PlugRef::Capture(i) => self.capture(*i).into_iter().collect(),
                        PlugRef::Target => self.frames[idx].plugs.clone(),
                    };
                    let text = match value {
                        ValueRef::Capture(i) => self.capture(*i),
                        ValueRef::Literal(s) => Some(s.clone()),
                    };
                    if let Some(v) = text {
                        let state = env.spec.interpret(&v, interps);
                        // plugs without a node are not reported
                        for p in plug_names.iter().filter(|p| env.plugs.find(p).is_some()) {
                            self.results.record(p, v.clone(), state);
                        }
                    }
                    self.frames[idx].next();
                }
                Statement::ForeachPlug(body) | Statement::ForeachNode(body) => {
                    if self.frames[idx].foreach.is_none() {
                        let nodes_only = matches!(stmt, Statement::ForeachNode(_));
                        let plugs = self.foreach_plugs(env.plugs, nodes_only);
                        self.frames[idx].foreach = Some(plugs);
                    }
                    let next = self.frames[idx].foreach.as_mut().and_then(VecDeque::pop_front);
                    match next {
                        Some(p) => self.frames.push(Frame::new(Arc::clone(body), vec![p])),
                        None => {
                            self.frames[idx].foreach = None;
                            self.frames[idx].next();
                        }
                    }
                }
                Statement::IfOn(body) | Statement::IfOff(body) => {
                    if self.frames[idx].processing {
                        // body finished
                        self.frames[idx].next();
                        continue;
                    }
                    let want = if matches!(stmt, Statement::IfOn(_)) {
                        PlugState::On
                    } else {
                        PlugState::Off
                    };
                    // every plug in scope must be in the wanted state
                    let scope = self.frames[idx].plugs.clone();
                    let mut unknown = Vec::new();
                    let mut matched = !scope.is_empty();
                    for p in &scope {
                        let state = self
                            .results
                            .state_of(p)
                            .or_else(|| env.known.get(p).copied())
                            .unwrap_or(PlugState::Unknown);
                        if state == PlugState::Unknown {
                            unknown.push(p.clone());
                        }
                        matched &= state == want;
                    }
                    if matched {
                        self.frames[idx].processing = true;
                        self.frames.push(Frame::new(Arc::clone(body), scope));
                    } else {
                        for p in &unknown {
                            self.results.fail(p);
                        }
                        self.frames[idx].next();
                    }
                }
            }
        }
    }
}

/// Substitute `%s` with the plug argument and `%%` with `%`.
///
/// Several plugs are passed as a sorted ranged hostlist (`[1-4,7]`).
#[must_use]
pub fn expand_send(fmt: &str, plugs: &[String]) -> String {
    let arg = match plugs {
        [] => String::new(),
        [one] => one.clone(),
        many => {
            let mut hl: Hostlist = many.iter().cloned().collect();
            hl.sort();
            hl.ranged_string()
        }
    };
    let mut out = String::with_capacity(fmt.len() + arg.len());
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('s') => {
                    chars.next();
                    out.push_str(&arg);
                    continue;
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_send_substitutes() {
        assert_eq!(expand_send("on %s\n", &["3".into()]), "on 3\n");
        assert_eq!(
            expand_send("on %s\n", &["n3".into(), "n1".into(), "n2".into()]),
            "on n[1-3]\n"
        );
        assert_eq!(expand_send("100%% %s", &[]), "100% ");
        assert_eq!(expand_send("%d", &[]), "%d");
    }
}
