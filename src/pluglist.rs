//! Plug ↔ node mapping for one device.
//!
//! A plug list is *hardwired* when the device specification names its plugs
//! (an 8-outlet PDU has outlets "1".."8"); nodes can then only be attached to
//! existing plugs. Otherwise the list is *dynamic* and plugs are created as
//! nodes are mapped.

use thiserror::Error;

use crate::hostlist::Hostlist;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlugListError {
    #[error("unknown plug name: {0}")]
    UnknownPlug(String),
    #[error("plug already assigned a node: {0}")]
    DupPlug(String),
    #[error("node already mapped to a plug: {0}")]
    DupNode(String),
    #[error("more nodes than plugs")]
    NoPlugs,
    #[error("more plugs than nodes")]
    NoNodes,
    #[error("plug count exceeds device limit of {0}")]
    TooManyPlugs(usize),
    #[error("bad hostlist: {0}")]
    Hostlist(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plug {
    pub name: String,
    pub node: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PlugList {
    plugs: Vec<Plug>,
    hardwired: bool,
    max_plugs: Option<usize>,
}

impl PlugList {
    /// Create a plug list. Passing names makes it hardwired.
    #[must_use]
    pub fn new(names: Option<&[String]>) -> Self {
        match names {
            Some(names) if !names.is_empty() => Self {
                plugs: names
                    .iter()
                    .map(|n| Plug {
                        name: n.clone(),
                        node: None,
                    })
                    .collect(),
                hardwired: true,
                max_plugs: None,
            },
            _ => Self::default(),
        }
    }

    #[must_use]
    pub const fn with_max_plugs(mut self, max: Option<usize>) -> Self {
        self.max_plugs = max;
        self
    }

    #[must_use]
    pub const fn is_hardwired(&self) -> bool {
        self.hardwired
    }

    /// Attach nodes to plugs.
    ///
    /// With `pluglist`, the i-th node goes to the i-th plug. Without it,
    /// each node takes the next free plug (hardwired) or gets a new plug
    /// named after itself (dynamic). Stops at the first error; assignments
    /// made before it are kept.
    pub fn map(&mut self, nodelist: &str, pluglist: Option<&str>) -> Result<(), PlugListError> {
        let nodes = Hostlist::parse(nodelist).map_err(|e| PlugListError::Hostlist(e.to_string()))?;
        match pluglist {
            Some(pl) => {
                let plugs =
                    Hostlist::parse(pl).map_err(|e| PlugListError::Hostlist(e.to_string()))?;
                let mut plug_iter = plugs.iter();
                for node in nodes.iter() {
                    let plug = plug_iter.next().ok_or(PlugListError::NoPlugs)?;
                    self.map_one(node, Some(plug))?;
                }
                if plug_iter.next().is_some() {
                    return Err(PlugListError::NoNodes);
                }
            }
            None => {
                for node in nodes.iter() {
                    self.map_one(node, None)?;
                }
            }
        }
        Ok(())
    }

    fn map_one(&mut self, node: &str, plug: Option<&str>) -> Result<(), PlugListError> {
        let name = match plug {
            Some(p) => p.to_string(),
            None if self.hardwired => self
                .plugs
                .iter()
                .find(|p| p.node.is_none())
                .map(|p| p.name.clone())
                .ok_or(PlugListError::NoPlugs)?,
            None => node.to_string(),
        };
        let slot = self.plugs.iter().position(|p| p.name == name);
        match slot {
            Some(i) if self.plugs[i].node.is_some() => return Err(PlugListError::DupPlug(name)),
            None if self.hardwired => return Err(PlugListError::UnknownPlug(name)),
            _ => {}
        }
        if self.find_node(node).is_some() {
            return Err(PlugListError::DupNode(node.to_string()));
        }
        if let Some(i) = slot {
            self.plugs[i].node = Some(node.to_string());
            return Ok(());
        }
        if let Some(max) = self.max_plugs {
            if self.plugs.len() >= max {
                return Err(PlugListError::TooManyPlugs(max));
            }
        }
        self.plugs.push(Plug {
            name,
            node: Some(node.to_string()),
        });
        Ok(())
    }

    /// Look up a plug by name. Unmapped plugs are not found.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Plug> {
        self.plugs
            .iter()
            .find(|p| p.name == name && p.node.is_some())
    }

    /// Reverse lookup: the plug a node is attached to.
    #[must_use]
    pub fn find_node(&self, node: &str) -> Option<&Plug> {
        self.plugs
            .iter()
            .find(|p| p.node.as_deref() == Some(node))
    }

    /// Node attached to the named plug.
    #[must_use]
    pub fn node_of(&self, plug: &str) -> Option<&str> {
        self.find(plug).and_then(|p| p.node.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Plug> {
        self.plugs.iter()
    }

    /// Mapped nodes in plug order.
    #[must_use]
    pub fn nodes(&self) -> Hostlist {
        self.plugs.iter().filter_map(|p| p.node.clone()).collect()
    }

    /// Plugs with no node attached (hardwired lists only ever have these).
    pub fn unassigned(&self) -> impl Iterator<Item = &Plug> {
        self.plugs.iter().filter(|p| p.node.is_none())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugs.is_empty()
    }
}
