//! Turns client requests into device actions and their results back into
//! client responses.
//!
//! One request fans out into at most one `Action` per device. The dispatcher
//! remembers each request until every action it spawned has reported
//! completion, then renders the merged per-node result.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::action::{Action, ActionEvent, ActionEventKind, PlugResult, RequestId, TargetMode};
use crate::client_proto::{self as cp, CP_ERR_COM_COMPLETE, CP_ERR_QUERY_COMPLETE, CP_ERR_UNIMPL};
use crate::client_proto::{CP_RSP_QUERY_COMPLETE, CP_RSP_SUCCESS};
use crate::commands::Command;
use crate::device::DeviceHandle;
use crate::hostlist::Hostlist;
use crate::request::Verb;
use crate::script::PlugState;

pub type ClientId = u64;

/// Lines for one client produced by an action event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub client: ClientId,
    pub lines: Vec<String>,
    /// The request is complete and the client may get its prompt back.
    pub done: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Submitted {
    /// Answered without touching a device.
    Done(Vec<String>),
    /// Actions are running; `lines` go out now, the rest comes as `Reply`s.
    Started { request: RequestId, lines: Vec<String> },
}

#[derive(Debug)]
struct Pending {
    client: Option<ClientId>,
    verb: Verb,
    /// Resolved nodes in request order.
    nodes: Vec<String>,
    outstanding: usize,
    error: bool,
    exprange: bool,
    results: HashMap<String, PlugResult>,
}

pub struct Dispatcher {
    devices: Vec<DeviceHandle>,
    aliases: HashMap<String, Hostlist>,
    events: mpsc::UnboundedSender<ActionEvent>,
    pending: HashMap<RequestId, Pending>,
    next_request: RequestId,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        devices: Vec<DeviceHandle>,
        aliases: HashMap<String, Hostlist>,
        events: mpsc::UnboundedSender<ActionEvent>,
    ) -> Self {
        Self {
            devices,
            aliases,
            events,
            pending: HashMap::new(),
            next_request: 1,
        }
    }

    #[must_use]
    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }

    /// Every configured node, in device order, without duplicates.
    #[must_use]
    pub fn all_nodes(&self) -> Hostlist {
        let mut hl = Hostlist::new();
        for d in &self.devices {
            for n in d.plugs.nodes().iter() {
                if !hl.contains(n) {
                    hl.push(n);
                }
            }
        }
        hl
    }

    /// Requests still waiting for device actions.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn expand_aliases(&self, hl: &Hostlist) -> Hostlist {
        let mut out = Hostlist::new();
        for h in hl.iter() {
            match self.aliases.get(h) {
                Some(members) => out.extend(members),
                None => out.push(h),
            }
        }
        out.dedup();
        out
    }

    /// Start a node-targeting request.
    pub fn submit(
        &mut self,
        client: ClientId,
        verb: Verb,
        arg: Option<&str>,
        telemetry: bool,
        exprange: bool,
    ) -> Submitted {
        let requested = match arg {
            Some(a) => match Hostlist::parse(a) {
                Ok(hl) => self.expand_aliases(&hl),
                Err(e) => {
                    debug!(client, arg = a, error = %e, "bad hostlist");
                    return Submitted::Done(vec![cp::hostlist_error("invalid range")]);
                }
            },
            None => self.all_nodes(),
        };

        let mut resolved = Vec::new();
        let mut unknown = Hostlist::new();
        // device index -> target plugs
        let mut per_device: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for node in requested.iter() {
            let mut found = false;
            for (i, d) in self.devices.iter().enumerate() {
                if let Some(plug) = d.plugs.find_node(node) {
                    per_device.entry(i).or_default().push(plug.name.clone());
                    found = true;
                }
            }
            if found {
                resolved.push(node.to_string());
            } else {
                unknown.push(node);
            }
        }
        if resolved.is_empty() {
            return Submitted::Done(vec![cp::no_such_nodes(&unknown.ranged_string())]);
        }

        let base = verb.command();
        let mut plan = Vec::with_capacity(per_device.len());
        for (i, plugs) in per_device {
            let dev = &self.devices[i];
            match choose_script(dev, base, &plugs) {
                Some((command, mode)) => plan.push((i, command, mode, plugs)),
                None => {
                    debug!(client, device = %dev.name, command = %base, "no script for request");
                    return Submitted::Done(vec![CP_ERR_UNIMPL.to_string()]);
                }
            }
        }

        let request = self.next_request;
        self.next_request += 1;
        let mut lines = Vec::new();
        let mut error = false;
        if !unknown.is_empty() {
            lines.push(cp::action_error(&format!("No such nodes: {}", unknown.ranged_string())));
            error = true;
        }
        let mut outstanding = 0;
        for (i, command, mode, plugs) in plan {
            let dev = &self.devices[i];
            let action = Action::new(command, mode)
                .with_targets(plugs)
                .with_request(request, self.events.clone())
                .with_telemetry(telemetry);
            debug!(client, request, device = %dev.name, %command, ?mode, "dispatch");
            match dev.enqueue(action) {
                Ok(()) => outstanding += 1,
                Err(e) => {
                    warn!(device = %dev.name, error = %e, "enqueue failed");
                    lines.push(cp::action_error(&format!("{}: device not running", dev.name)));
                    error = true;
                }
            }
        }

        let pending = Pending {
            client: Some(client),
            verb,
            nodes: resolved,
            outstanding,
            error,
            exprange,
            results: HashMap::new(),
        };
        if outstanding == 0 {
            lines.extend(pending.render());
            return Submitted::Done(lines);
        }
        self.pending.insert(request, pending);
        Submitted::Started { request, lines }
    }

    /// Fold an action event into its request.
    pub fn on_event(&mut self, ev: ActionEvent) -> Option<Reply> {
        let Some(p) = self.pending.get_mut(&ev.request) else {
            debug!(request = ev.request, device = %ev.device, "event for finished request");
            return None;
        };
        let mut lines = Vec::new();
        let mut done = false;
        match ev.kind {
            ActionEventKind::Telemetry(line) => lines.push(cp::telemetry(&line)),
            ActionEventKind::Completed(outcome) => {
                if let Some(msg) = &outcome.error {
                    lines.push(cp::action_error(msg));
                    p.error = true;
                }
                for nr in outcome.results {
                    if p.nodes.contains(&nr.node) {
                        let merged = merge_result(p.results.remove(&nr.node), nr.result);
                        p.results.insert(nr.node, merged);
                    }
                }
                p.outstanding = p.outstanding.saturating_sub(1);
                if p.outstanding == 0 {
                    lines.extend(p.render());
                    done = true;
                }
            }
        }
        let client = p.client;
        if done {
            self.pending.remove(&ev.request);
        }
        client.map(|client| Reply { client, lines, done })
    }

    /// Forget the client of any in-flight request; its actions still run.
    pub fn client_gone(&mut self, client: ClientId) {
        for p in self.pending.values_mut() {
            if p.client == Some(client) {
                p.client = None;
            }
        }
    }

    /// Answer to `nodes`.
    #[must_use]
    pub fn nodes_reply(&self, exprange: bool) -> Vec<String> {
        let mut nodes = self.all_nodes();
        nodes.sort();
        let mut lines: Vec<String> = if exprange {
            nodes.iter().map(cp::xnodes).collect()
        } else {
            vec![cp::nodes(&nodes.ranged_string())]
        };
        lines.push(CP_RSP_QUERY_COMPLETE.to_string());
        lines
    }

    /// Answer to `device [<nodes>]`. The argument matches a device by name
    /// or by any node it powers.
    #[must_use]
    pub fn device_reply(&self, arg: Option<&str>) -> Vec<String> {
        let filter = arg.map(|a| (a, Hostlist::parse(a).unwrap_or_default()));
        let mut lines = Vec::new();
        for d in &self.devices {
            let mut hosts = d.plugs.nodes();
            if let Some((name, targets)) = &filter {
                let hit = d.name == *name || hosts.iter().any(|h| targets.contains(h));
                if !hit {
                    continue;
                }
            }
            hosts.sort();
            let stats = d.stats();
            lines.push(cp::device_line(
                &d.name,
                stats.state.as_str(),
                stats.reconnects(),
                stats.successful_actions,
                &d.spec.name,
                &hosts.ranged_string(),
            ));
        }
        lines.push(CP_RSP_QUERY_COMPLETE.to_string());
        lines
    }

    pub fn shutdown(&self) {
        for d in &self.devices {
            d.shutdown();
        }
    }
}

/// Pick the script variant a device runs for `plugs`.
///
/// Queries and requests covering every plug of the device prefer the
/// whole-device script; partial requests prefer the ranged one.
fn choose_script(dev: &DeviceHandle, base: Command, plugs: &[String]) -> Option<(Command, TargetMode)> {
    let covers_all = dev.plugs.unassigned().next().is_none()
        && dev.plugs.iter().all(|p| plugs.contains(&p.name));
    if let Some(all) = base.all_variant() {
        if (base.is_query() || covers_all) && dev.spec.supports(all) {
            return Some((all, TargetMode::All));
        }
    }
    if let Some(ranged) = base.ranged_variant() {
        if dev.spec.supports(ranged) {
            return Some((ranged, TargetMode::Ranged));
        }
    }
    dev.spec.supports(base).then_some((base, TargetMode::Single))
}

/// Combine the results of several devices powering one node, independent
/// of arrival order: a known state beats unknown and on beats off.
fn merge_result(prev: Option<PlugResult>, next: PlugResult) -> PlugResult {
    let Some(prev) = prev else {
        return next;
    };
    let rank = |s: PlugState| match s {
        PlugState::Unknown => 0,
        PlugState::Off => 1,
        PlugState::On => 2,
    };
    // ties go to the greater value text, any value beating none
    if (rank(next.state), &next.value) > (rank(prev.state), &prev.value) {
        next
    } else {
        prev
    }
}

impl Pending {
    fn state_of(&self, node: &str) -> PlugState {
        self.results.get(node).map_or(PlugState::Unknown, |r| r.state)
    }

    fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match self.verb {
            Verb::Status | Verb::Beacon => {
                if self.exprange {
                    for n in &self.nodes {
                        lines.push(cp::node_value(n, self.state_of(n).as_str()));
                    }
                } else {
                    let mut on = Hostlist::new();
                    let mut off = Hostlist::new();
                    let mut unknown = Hostlist::new();
                    for n in &self.nodes {
                        match self.state_of(n) {
                            PlugState::On => on.push(n.as_str()),
                            PlugState::Off => off.push(n.as_str()),
                            PlugState::Unknown => unknown.push(n.as_str()),
                        }
                    }
                    for hl in [&mut on, &mut off, &mut unknown] {
                        hl.sort();
                    }
                    lines.push(cp::status_on(&on.ranged_string()));
                    lines.push(cp::status_off(&off.ranged_string()));
                    lines.push(cp::status_unknown(&unknown.ranged_string()));
                }
            }
            Verb::Temp => {
                let mut missing = Hostlist::new();
                for n in &self.nodes {
                    match self.results.get(n).and_then(|r| r.value.as_deref()) {
                        Some(v) => lines.push(cp::node_value(n, v)),
                        None => missing.push(n.as_str()),
                    }
                }
                if !missing.is_empty() {
                    missing.sort();
                    lines.push(cp::node_value(&missing.ranged_string(), "unknown"));
                }
            }
            _ => {
                lines.push(if self.error { CP_ERR_COM_COMPLETE } else { CP_RSP_SUCCESS }.to_string());
                return lines;
            }
        }
        lines.push(if self.error { CP_ERR_QUERY_COMPLETE } else { CP_RSP_QUERY_COMPLETE }.to_string());
        lines
    }
}
