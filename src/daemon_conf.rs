//! powermand configuration file.
//!
//! ```toml
//! listen = ["127.0.0.1:10101"]
//! spec_files = ["vendor.toml"]
//!
//! [[device]]
//! name = "pdu0"
//! spec = "vpc"
//! host = "localhost"
//! port = 11000
//!
//! [[node]]
//! name = "t[0-15]"
//! device = "pdu0"
//!
//! [[alias]]
//! name = "rack1"
//! nodes = "t[0-7]"
//! ```
//!
//! Inline `[[spec]]` tables use the same format as spec files and are
//! merged over the built-in and `spec_files` definitions.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::client_proto::DEFAULT_PORT;
use crate::device::Device;
use crate::endpoint::Endpoint;
use crate::error::PowermanError;
use crate::hostlist::Hostlist;
use crate::pluglist::PlugList;
use crate::script::DeviceSpec;
use crate::spec_registry::{SpecRaw, SpecRegistry};
use crate::toml_helpers::config_error;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfRaw {
    listen: Option<Vec<String>>,
    #[serde(default)]
    spec_files: Vec<PathBuf>,
    #[serde(default)]
    spec: Vec<SpecRaw>,
    #[serde(default)]
    device: Vec<DeviceRaw>,
    #[serde(default)]
    node: Vec<NodeRaw>,
    #[serde(default)]
    alias: Vec<AliasRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceRaw {
    name: String,
    spec: String,
    host: Option<String>,
    port: Option<u16>,
    #[serde(default)]
    telnet: bool,
    serial: Option<PathBuf>,
    flags: Option<String>,
    command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeRaw {
    name: String,
    device: String,
    plugs: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AliasRaw {
    name: String,
    nodes: String,
}

/// A configured power controller, ready to be started.
#[derive(Debug, Clone)]
pub struct DeviceConf {
    pub name: String,
    pub spec: Arc<DeviceSpec>,
    pub endpoint: Endpoint,
    pub plugs: PlugList,
}

impl DeviceConf {
    #[must_use]
    pub fn into_device(self) -> Device {
        Device::new(self.name, self.spec, self.endpoint, self.plugs)
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConf {
    pub listen: Vec<String>,
    pub devices: Vec<DeviceConf>,
    pub aliases: HashMap<String, Hostlist>,
}

impl DaemonConf {
    /// Parse configuration text. Relative `spec_files` resolve against `base_dir`.
    pub fn parse(s: &str, base_dir: Option<&Path>) -> Result<Self, PowermanError> {
        Self::parse_named("powerman.toml", s, base_dir)
    }

    pub fn from_path(path: &Path) -> Result<Self, PowermanError> {
        let s = fs::read_to_string(path)
            .map_err(|e| PowermanError::Config(format!("read {}: {e}", path.display())))?;
        Self::parse_named(&path.display().to_string(), &s, path.parent())
    }

    fn parse_named(what: &str, s: &str, base_dir: Option<&Path>) -> Result<Self, PowermanError> {
        let raw: ConfRaw = toml::from_str(s).map_err(|e| config_error(what, s, &e))?;

        let mut registry = SpecRegistry::builtin()?;
        for f in &raw.spec_files {
            let path = match base_dir {
                Some(dir) if f.is_relative() => dir.join(f),
                _ => f.clone(),
            };
            registry.merge(SpecRegistry::from_path(&path)?);
        }
        registry.merge(SpecRegistry::from_raw(raw.spec)?);

        let mut devices: Vec<DeviceConf> = Vec::with_capacity(raw.device.len());
        for d in raw.device {
            if devices.iter().any(|x| x.name == d.name) {
                return Err(PowermanError::Config(format!("duplicate device: {}", d.name)));
            }
            let spec = registry.get(&d.spec).ok_or_else(|| {
                PowermanError::Config(format!("device {}: unknown spec '{}'", d.name, d.spec))
            })?;
            let endpoint = endpoint_of(&d)?;
            let plugs = PlugList::new(Some(spec.plugs.as_slice())).with_max_plugs(spec.max_plugs);
            devices.push(DeviceConf {
                name: d.name,
                spec,
                endpoint,
                plugs,
            });
        }

        let mut seen_nodes: HashMap<String, String> = HashMap::new();
        for n in raw.node {
            let dev = devices.iter_mut().find(|d| d.name == n.device).ok_or_else(|| {
                PowermanError::Config(format!("node {}: unknown device '{}'", n.name, n.device))
            })?;
            // a node may be powered by several devices, but only once per device
            for node in Hostlist::parse(&n.name)?.iter() {
                seen_nodes.insert(node.to_string(), dev.name.clone());
            }
            dev.plugs.map(&n.name, n.plugs.as_deref()).map_err(|e| {
                PowermanError::Config(format!("device {}: node {}: {e}", dev.name, n.name))
            })?;
        }
        if seen_nodes.is_empty() {
            return Err(PowermanError::Config("no nodes defined".to_string()));
        }

        let mut aliases = HashMap::new();
        for a in raw.alias {
            if seen_nodes.contains_key(&a.name) || aliases.contains_key(&a.name) {
                return Err(PowermanError::Config(format!("alias {} already defined", a.name)));
            }
            let members = Hostlist::parse(&a.nodes)?;
            if let Some(bad) = members.iter().find(|m| !seen_nodes.contains_key(*m)) {
                return Err(PowermanError::Config(format!(
                    "alias {}: unknown node {bad}",
                    a.name
                )));
            }
            aliases.insert(a.name, members);
        }

        let listen = raw
            .listen
            .unwrap_or_else(|| vec![format!("127.0.0.1:{DEFAULT_PORT}")]);
        Ok(Self {
            listen,
            devices,
            aliases,
        })
    }
}

fn endpoint_of(d: &DeviceRaw) -> Result<Endpoint, PowermanError> {
    let kinds = [d.host.is_some(), d.serial.is_some(), d.command.is_some()];
    if kinds.iter().filter(|k| **k).count() != 1 {
        return Err(PowermanError::Config(format!(
            "device {}: exactly one of host, serial or command is required",
            d.name
        )));
    }
    if let Some(cmd) = &d.command {
        return Endpoint::pipe(cmd);
    }
    if let Some(path) = &d.serial {
        return Ok(Endpoint::serial(path, d.flags.as_deref()));
    }
    let host = d.host.as_deref().unwrap_or_default();
    let ep = match d.port {
        Some(port) => Endpoint::tcp(host, port),
        None => Endpoint::parse_host_port(host)?,
    };
    Ok(ep.with_telnet(d.telnet))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = r#"
listen = ["127.0.0.1:0"]

[[device]]
name = "pdu0"
spec = "vpc"
host = "localhost"
port = 11000

[[node]]
name = "t[0-3]"
device = "pdu0"
plugs = "[0-3]"

[[alias]]
name = "front"
nodes = "t[0-1]"
"#;

    #[test]
    fn parses_devices_nodes_aliases() {
        let conf = DaemonConf::parse(CONF, None).unwrap();
        assert_eq!(conf.devices.len(), 1);
        let d = &conf.devices[0];
        assert_eq!(d.endpoint, Endpoint::tcp("localhost", 11000));
        assert_eq!(d.plugs.node_of("2"), Some("t2"));
        assert_eq!(conf.aliases["front"].len(), 2);
    }

    #[test]
    fn rejects_unknown_spec_and_alias_targets() {
        let bad_spec = CONF.replace("spec = \"vpc\"", "spec = \"nosuch\"");
        assert!(matches!(DaemonConf::parse(&bad_spec, None), Err(PowermanError::Config(_))));
        let bad_alias = CONF.replace("t[0-1]\"", "t[0-9]\"");
        assert!(DaemonConf::parse(&bad_alias, None).is_err());
    }

    #[test]
    fn endpoint_must_be_unambiguous() {
        let both = CONF.replace("port = 11000", "port = 11000\nserial = \"/dev/ttyS0\"");
        assert!(DaemonConf::parse(&both, None).is_err());
    }
}
