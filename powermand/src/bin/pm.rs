//! pm: powerman command line client
//!
//! ```bash
//! pm --on t[0-3]
//! pm --query
//! pm -h pmhost:10101 --json --device
//! ```

use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, ArgGroup, Parser};
use powerman::response::Response;
use powerman::PowermanClient;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "pm")]
#[command(author, version, about = "powerman client", long_about = None)]
#[command(disable_help_flag = true)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["on", "off", "cycle", "reset", "query", "list", "device", "temp", "beacon", "flash", "unflash"])
))]
struct Args {
    /// Server address (host or host:port)
    #[arg(short = 'h', long, default_value = "localhost:10101")]
    server_host: String,

    #[arg(short = '1', long)]
    on: bool,
    #[arg(short = '0', long)]
    off: bool,
    #[arg(short, long)]
    cycle: bool,
    #[arg(short, long)]
    reset: bool,
    /// Power status (all nodes when no list is given)
    #[arg(short, long)]
    query: bool,
    /// List configured nodes
    #[arg(short, long)]
    list: bool,
    /// Device status
    #[arg(short, long)]
    device: bool,
    #[arg(short = 'P', long)]
    temp: bool,
    /// Beacon status
    #[arg(short, long)]
    beacon: bool,
    #[arg(short, long)]
    flash: bool,
    #[arg(short, long)]
    unflash: bool,

    /// Show device dialogue
    #[arg(short = 'T', long)]
    telemetry: bool,
    /// Expand host ranges in output
    #[arg(short = 'x', long)]
    exprange: bool,

    /// Machine readable output
    #[arg(long)]
    json: bool,

    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Node list, e.g. `t[0-15]`
    nodes: Option<String>,
}

#[derive(Serialize)]
struct NodeState<'a> {
    node: &'a str,
    state: &'a str,
}

#[derive(Serialize)]
struct Outcome<'a> {
    code: u16,
    message: &'a str,
    errors: Vec<&'a str>,
}

#[derive(Serialize)]
struct DeviceJson<'a> {
    name: &'a str,
    state: &'a str,
    reconnects: u32,
    actions: u32,
    #[serde(rename = "type")]
    kind: &'a str,
    hosts: &'a str,
}

fn emit_json<T: Serialize>(v: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

/// Print the informational lines of a response; errors go to stderr.
fn print_text(rsp: &Response) {
    for l in &rsp.lines {
        if l.code == 308 {
            eprintln!("{}", l.text);
        } else {
            println!("{}", l.text);
        }
    }
}

fn exit_for(rsp: &Response) -> ExitCode {
    if rsp.is_success() {
        ExitCode::SUCCESS
    } else {
        eprintln!("{}", rsp.text);
        ExitCode::FAILURE
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let mut pm = PowermanClient::new()
        .connect(&args.server_host)
        .await
        .with_context(|| format!("connecting to {}", args.server_host))?;
    if args.telemetry {
        pm.telemetry().await?;
    }
    if args.exprange {
        pm.exprange().await?;
    }

    let nodes = args.nodes.as_deref();
    let targets = || nodes.context("a node list is required");

    if args.json {
        if args.query || args.beacon {
            let all = nodes.unwrap_or("");
            let states = if args.query {
                pm.status(all).await?
            } else {
                pm.beacon(all).await?
            };
            let out: Vec<NodeState> = states
                .iter()
                .map(|(n, s)| NodeState { node: n, state: s.as_str() })
                .collect();
            emit_json(&out)?;
        } else if args.temp {
            let vals = pm.temp(nodes).await?;
            let out: Vec<NodeState> = vals
                .iter()
                .map(|(n, v)| NodeState { node: n, state: v })
                .collect();
            emit_json(&out)?;
        } else if args.list {
            emit_json(&pm.nodes().await?)?;
        } else if args.device {
            let devs = pm.device_status(nodes).await?;
            let out: Vec<DeviceJson> = devs
                .iter()
                .map(|d| DeviceJson {
                    name: &d.name,
                    state: &d.state,
                    reconnects: d.reconnects,
                    actions: d.actions,
                    kind: &d.kind,
                    hosts: &d.hosts,
                })
                .collect();
            emit_json(&out)?;
        } else {
            let rsp = pm.raw(&format!("{} {}", power_verb(&args), targets()?)).await?;
            emit_json(&Outcome {
                code: rsp.code,
                message: &rsp.text,
                errors: rsp.action_errors().collect(),
            })?;
            pm.disconnect().await?;
            return Ok(exit_for(&rsp));
        }
        pm.disconnect().await?;
        return Ok(ExitCode::SUCCESS);
    }

    let line = if args.query || args.temp || args.beacon || args.device {
        let verb = if args.query {
            "status"
        } else if args.temp {
            "temp"
        } else if args.beacon {
            "beacon"
        } else {
            "device"
        };
        nodes.map_or_else(|| verb.to_string(), |n| format!("{verb} {n}"))
    } else if args.list {
        "nodes".to_string()
    } else {
        format!("{} {}", power_verb(&args), targets()?)
    };
    let rsp = pm.raw(&line).await?;
    print_text(&rsp);
    pm.disconnect().await?;
    Ok(exit_for(&rsp))
}

fn power_verb(args: &Args) -> &'static str {
    if args.on {
        "on"
    } else if args.off {
        "off"
    } else if args.cycle {
        "cycle"
    } else if args.reset {
        "reset"
    } else if args.flash {
        "flash"
    } else {
        "unflash"
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pm: {e:#}");
            ExitCode::FAILURE
        }
    }
}
