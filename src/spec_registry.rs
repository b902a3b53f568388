use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::Command;
use crate::error::PowermanError;
use crate::hostlist::Hostlist;
use crate::script::{
    Block, DeviceSpec, Interp, PlugRef, PlugState, Script, Statement, ValueRef, DEFAULT_TIMEOUT,
    MAX_MATCH_POS,
};
use crate::toml_helpers::config_error;

#[derive(Debug, Deserialize)]
struct SpecFile {
    #[serde(default, rename = "spec")]
    specs: Vec<SpecRaw>,
}

/// One `[[spec]]` table as written in TOML.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SpecRaw {
    pub name: String,
    /// seconds
    pub timeout: Option<f64>,
    pub connect_timeout: Option<f64>,
    pub ping_period: Option<f64>,
    #[serde(default)]
    pub plugs: Vec<String>,
    /// Hostlist shorthand for `plugs`, e.g. `"[1-8]"`.
    pub plug_names: Option<String>,
    pub max_plugs: Option<usize>,
    pub on: Option<String>,
    pub off: Option<String>,
    #[serde(default)]
    pub scripts: HashMap<String, Vec<StmtRaw>>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum StmtRaw {
    Send(String),
    Expect(String),
    Delay(f64),
    Setplugstate(SetPlugStateRaw),
    Foreachplug(Vec<StmtRaw>),
    Foreachnode(Vec<StmtRaw>),
    Ifon(Vec<StmtRaw>),
    Ifoff(Vec<StmtRaw>),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SetPlugStateRaw {
    pub plug: Option<IndexOrText>,
    pub value: IndexOrText,
    #[serde(default)]
    pub interps: Vec<InterpRaw>,
}

/// Integer → capture group of the last `expect`; string → literal.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum IndexOrText {
    Index(i64),
    Text(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct InterpRaw {
    pub on: Option<String>,
    pub off: Option<String>,
}

/// Named collection of compiled device specifications.
#[derive(Debug, Default, Clone)]
pub struct SpecRegistry {
    by_name: HashMap<String, Arc<DeviceSpec>>,
}

impl SpecRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `[[spec]]` tables from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, PowermanError> {
        Self::from_str_named("spec", s)
    }

    fn from_str_named(what: &str, s: &str) -> Result<Self, PowermanError> {
        let sf: SpecFile = toml::from_str(s).map_err(|e| config_error(what, s, &e))?;
        Self::from_raw(sf.specs)
    }

    /// Load and parse a spec TOML from a filesystem path.
    pub fn from_path(path: &Path) -> Result<Self, PowermanError> {
        let s = fs::read_to_string(path).map_err(|e| {
            PowermanError::Config(format!("read spec file {}: {e}", path.display()))
        })?;
        Self::from_str_named(&path.display().to_string(), &s)
    }

    /// Specifications shipped with the crate (`src/specs.toml`).
    pub fn builtin() -> Result<Self, PowermanError> {
        Self::from_str_named("builtin specs.toml", include_str!("specs.toml"))
    }

    pub fn from_raw(raws: Vec<SpecRaw>) -> Result<Self, PowermanError> {
        let mut by_name = HashMap::new();
        for raw in raws {
            let spec = compile_spec(raw)?;
            if by_name.contains_key(&spec.name) {
                return Err(PowermanError::Config(format!(
                    "duplicate spec name: {}",
                    spec.name
                )));
            }
            by_name.insert(spec.name.clone(), Arc::new(spec));
        }
        Ok(Self { by_name })
    }

    /// Add every spec of `other`; definitions in `other` replace same-named ones.
    pub fn merge(&mut self, other: Self) {
        for (name, spec) in other.by_name {
            if self.by_name.insert(name.clone(), spec).is_some() {
                tracing::debug!(spec = %name, "spec definition replaced");
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<DeviceSpec>> {
        self.by_name.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl FromStr for SpecRegistry {
    type Err = PowermanError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s)
    }
}

fn seconds(ctx: &str, field: &str, v: f64) -> Result<Duration, PowermanError> {
    Duration::try_from_secs_f64(v).map_err(|_| {
        PowermanError::Config(format!(
            "{ctx}: {field} must be a non-negative number of seconds"
        ))
    })
}

fn compile_spec(raw: SpecRaw) -> Result<DeviceSpec, PowermanError> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(PowermanError::Config("spec name empty".to_string()));
    }
    let mut spec = DeviceSpec::new(name.clone());
    let sctx = format!("spec '{name}'");
    spec.timeout = match raw.timeout {
        Some(t) => seconds(&sctx, "timeout", t)?,
        None => DEFAULT_TIMEOUT,
    };
    spec.connect_timeout = match raw.connect_timeout {
        Some(t) => seconds(&sctx, "connect_timeout", t)?,
        None => spec.timeout,
    };
    spec.ping_period = raw
        .ping_period
        .map(|t| seconds(&sctx, "ping_period", t))
        .transpose()?
        .filter(|d| !d.is_zero());

    let mut plugs = raw.plugs;
    if let Some(expr) = raw.plug_names.as_deref() {
        let hl = Hostlist::parse(expr)
            .map_err(|e| PowermanError::Config(format!("spec '{name}': plug_names: {e}")))?;
        plugs.extend(hl.into_vec());
    }
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = plugs.iter().find(|p| !seen.insert(p.as_str())) {
        return Err(PowermanError::Config(format!(
            "spec '{name}': duplicate plug name '{dup}'"
        )));
    }
    if let Some(max) = raw.max_plugs {
        if plugs.len() > max {
            return Err(PowermanError::Config(format!(
                "spec '{name}': {} plug names exceed max_plugs {max}",
                plugs.len()
            )));
        }
    }
    spec.plugs = plugs;
    spec.max_plugs = raw.max_plugs;
    if let Some(on) = raw.on {
        spec.on_string = on;
    }
    if let Some(off) = raw.off {
        spec.off_string = off;
    }

    for (script_name, stmts) in raw.scripts {
        let command = script_name
            .parse::<Command>()
            .map_err(|e| PowermanError::Config(format!("spec '{name}': {e}")))?;
        if stmts.is_empty() {
            return Err(PowermanError::Config(format!(
                "spec '{name}' script '{script_name}': empty script"
            )));
        }
        let ctx = format!("spec '{name}' script '{script_name}'");
        let body = compile_block(&ctx, &stmts)?;
        spec.scripts.insert(command, Script { command, body });
    }
    Ok(spec)
}

fn compile_block(ctx: &str, stmts: &[StmtRaw]) -> Result<Block, PowermanError> {
    stmts
        .iter()
        .map(|s| compile_stmt(ctx, s))
        .collect::<Result<Vec<_>, _>>()
        .map(Block::from)
}

fn compile_stmt(ctx: &str, raw: &StmtRaw) -> Result<Statement, PowermanError> {
    let stmt = match raw {
        StmtRaw::Send(fmt) => Statement::Send { fmt: fmt.clone() },
        StmtRaw::Expect(re) => Statement::Expect {
            regex: regex::bytes::Regex::new(re)
                .map_err(|e| PowermanError::Config(format!("{ctx}: bad expect regex: {e}")))?,
        },
        StmtRaw::Delay(secs) => Statement::Delay(seconds(ctx, "delay", *secs)?),
        StmtRaw::Setplugstate(sps) => compile_setplugstate(ctx, sps)?,
        StmtRaw::Foreachplug(b) => Statement::ForeachPlug(compile_nonempty(ctx, "foreachplug", b)?),
        StmtRaw::Foreachnode(b) => Statement::ForeachNode(compile_nonempty(ctx, "foreachnode", b)?),
        StmtRaw::Ifon(b) => Statement::IfOn(compile_nonempty(ctx, "ifon", b)?),
        StmtRaw::Ifoff(b) => Statement::IfOff(compile_nonempty(ctx, "ifoff", b)?),
    };
    Ok(stmt)
}

fn compile_nonempty(ctx: &str, kind: &str, stmts: &[StmtRaw]) -> Result<Block, PowermanError> {
    if stmts.is_empty() {
        return Err(PowermanError::Config(format!("{ctx}: empty {kind} block")));
    }
    compile_block(ctx, stmts)
}

fn capture_index(ctx: &str, i: i64) -> Result<usize, PowermanError> {
    usize::try_from(i)
        .ok()
        .filter(|i| *i <= MAX_MATCH_POS)
        .ok_or_else(|| {
            PowermanError::Config(format!(
                "{ctx}: match position {i} out of range 0..={MAX_MATCH_POS}"
            ))
        })
}

fn compile_setplugstate(ctx: &str, raw: &SetPlugStateRaw) -> Result<Statement, PowermanError> {
    let plug = match &raw.plug {
        None => PlugRef::Target,
        Some(IndexOrText::Index(i)) => PlugRef::Capture(capture_index(ctx, *i)?),
        Some(IndexOrText::Text(s)) => PlugRef::Literal(s.clone()),
    };
    let value = match &raw.value {
        IndexOrText::Index(i) => ValueRef::Capture(capture_index(ctx, *i)?),
        IndexOrText::Text(s) => ValueRef::Literal(s.clone()),
    };
    let mut interps = Vec::new();
    for ir in &raw.interps {
        let (state, re) = match (&ir.on, &ir.off) {
            (Some(re), None) => (PlugState::On, re),
            (None, Some(re)) => (PlugState::Off, re),
            _ => {
                return Err(PowermanError::Config(format!(
                    "{ctx}: each interp needs exactly one of 'on' or 'off'"
                )))
            }
        };
        let regex = regex::Regex::new(re)
            .map_err(|e| PowermanError::Config(format!("{ctx}: bad interp regex: {e}")))?;
        interps.push(Interp { state, regex });
    }
    Ok(Statement::SetPlugState {
        plug,
        value,
        interps,
    })
}
