//! Wire constants of the line-oriented client protocol.
//!
//! Every response line starts with a three digit code. 1xx ends a successful
//! request, 2xx ends a failed one, 3xx carries data or an interim error.

pub const CP_LINEMAX: usize = 8192;
pub const CP_EOL: &str = "\r\n";
pub const CP_PROMPT: &str = "powerman> ";
pub const DEFAULT_PORT: u16 = 10101;

// successful completion
pub const CP_RSP_QUIT: &str = "101 Goodbye";
pub const CP_RSP_SUCCESS: &str = "102 Command completed successfully";
pub const CP_RSP_QUERY_COMPLETE: &str = "103 Query complete";
pub const CP_RSP_TELEMETRY_ON: &str = "104 Telemetry ON";
pub const CP_RSP_TELEMETRY_OFF: &str = "104 Telemetry OFF";
pub const CP_RSP_EXPRANGE_ON: &str = "105 Hostrange expansion ON";
pub const CP_RSP_EXPRANGE_OFF: &str = "105 Hostrange expansion OFF";

// failed completion
pub const CP_ERR_UNKNOWN: &str = "201 Unknown command";
pub const CP_ERR_TOOLONG: &str = "203 Command too long";
pub const CP_ERR_COM_IN_PROGRESS: &str = "208 Command in progress";
pub const CP_ERR_COM_COMPLETE: &str = "210 Command completed with errors";
pub const CP_ERR_QUERY_COMPLETE: &str = "211 Query completed with errors";
pub const CP_ERR_UNIMPL: &str = "213 Command cannot be handled by power control device(s)";

pub const CP_RSP_HELP: &[&str] = &[
    "301 nodes              - query node list",
    "301 device [<nodes>]   - query power control device status",
    "301 status [<nodes>]   - query power status",
    "301 on <nodes>         - power on",
    "301 off <nodes>        - power off",
    "301 cycle <nodes>      - power cycle",
    "301 reset <nodes>      - hardware reset (if available)",
    "301 temp [<nodes>]     - query temperature (if available)",
    "301 beacon [<nodes>]   - query beacon status (if available)",
    "301 flash <nodes>      - set beacon to ON (if available)",
    "301 unflash <nodes>    - set beacon to OFF (if available)",
    "301 telemetry          - toggle telemetry display",
    "301 exprange           - toggle host range expansion",
    "301 help               - display help",
    "301 quit               - logout",
];

#[must_use]
pub fn version_line(version: &str) -> String {
    format!("001 {version}")
}

#[must_use]
pub fn hostlist_error(msg: &str) -> String {
    format!("205 Hostlist error: {msg}")
}

#[must_use]
pub fn no_such_nodes(nodes: &str) -> String {
    format!("209 No such nodes: {nodes}")
}

#[must_use]
pub fn status_on(nodes: &str) -> String {
    format!("302 on:      {nodes}")
}

#[must_use]
pub fn status_off(nodes: &str) -> String {
    format!("302 off:     {nodes}")
}

#[must_use]
pub fn status_unknown(nodes: &str) -> String {
    format!("302 unknown: {nodes}")
}

#[must_use]
pub fn node_value(node: &str, value: &str) -> String {
    format!("303 {node}: {value}")
}

#[must_use]
pub fn device_line(name: &str, state: &str, reconnects: u32, actions: u32, kind: &str, hosts: &str) -> String {
    format!("304 {name}: state={state} reconnects={reconnects:03} actions={actions:03} type={kind} hosts={hosts}")
}

#[must_use]
pub fn telemetry(line: &str) -> String {
    format!("305 {line}")
}

#[must_use]
pub fn nodes(list: &str) -> String {
    format!("306 {list}")
}

#[must_use]
pub fn xnodes(list: &str) -> String {
    format!("307 {list}")
}

#[must_use]
pub fn action_error(msg: &str) -> String {
    format!("308 {msg}")
}

/// Leading three digit code of a response line.
#[must_use]
pub fn code_of(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match line.as_bytes().get(3) {
        None | Some(b' ') => digits.parse().ok(),
        Some(_) => None,
    }
}

/// Line that terminates a response (1xx or 2xx).
#[must_use]
pub const fn is_final(code: u16) -> bool {
    code >= 100 && code < 300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_line_pads_counters() {
        assert_eq!(
            device_line("pdu0", "connected", 1, 42, "vpc", "t[0-15]"),
            "304 pdu0: state=connected reconnects=001 actions=042 type=vpc hosts=t[0-15]"
        );
    }

    #[test]
    fn codes() {
        assert_eq!(code_of(CP_RSP_SUCCESS), Some(102));
        assert_eq!(code_of("302 on:      t1"), Some(302));
        assert_eq!(code_of("30x nope"), None);
        assert_eq!(code_of("3021"), None);
        assert!(is_final(210));
        assert!(!is_final(303));
    }
}
