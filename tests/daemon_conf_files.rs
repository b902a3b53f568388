use std::fs;

use powerman::{DaemonConf, Endpoint, PowermanError, SpecRegistry};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const VENDOR_SPEC: &str = r#"
[[spec]]
name = "acme"
timeout = 10.0
plug_names = "[1-8]"

[spec.scripts]
login = [ { expect = "acme> " } ]
on = [ { send = "power on %s\n" }, { expect = "acme> " } ]
off = [ { send = "power off %s\n" }, { expect = "acme> " } ]
"#;

#[test]
fn spec_files_resolve_relative_to_conf() -> TestResult {
    let dir = tempfile::tempdir()?;
    fs::create_dir(dir.path().join("specs"))?;
    fs::write(dir.path().join("specs/acme.toml"), VENDOR_SPEC)?;
    let conf_path = dir.path().join("powerman.toml");
    fs::write(
        &conf_path,
        r#"
listen = ["127.0.0.1:10102", "[::1]:10102"]
spec_files = ["specs/acme.toml"]

[[device]]
name = "acme0"
spec = "acme"
host = "pdu1.example.com:2300"
telnet = true

[[node]]
name = "c[1-8]"
device = "acme0"
"#,
    )?;

    let conf = DaemonConf::from_path(&conf_path)?;
    assert_eq!(conf.listen, vec!["127.0.0.1:10102", "[::1]:10102"]);
    let dev = &conf.devices[0];
    assert_eq!(dev.spec.name, "acme");
    assert_eq!(dev.spec.timeout.as_secs(), 10);
    assert_eq!(
        dev.endpoint,
        Endpoint::tcp("pdu1.example.com", 2300).with_telnet(true)
    );
    assert_eq!(dev.plugs.node_of("1"), Some("c1"));
    assert_eq!(dev.plugs.node_of("8"), Some("c8"));
    Ok(())
}

#[test]
fn inline_spec_replaces_builtin() -> TestResult {
    let conf = DaemonConf::parse(
        r#"
[[spec]]
name = "vpc"
timeout = 1.5
plug_names = "[0-3]"

[spec.scripts]
on = [ { send = "on %s\n" }, { expect = "OK\n" } ]

[[device]]
name = "v0"
spec = "vpc"
command = "vpcd --stdio --plugs 4"

[[node]]
name = "n[0-3]"
device = "v0"
"#,
        None,
    )?;
    let dev = &conf.devices[0];
    assert_eq!(dev.spec.plugs.len(), 4);
    assert!(!dev.spec.supports(powerman::Command::StatusAll));
    assert_eq!(
        dev.endpoint,
        Endpoint::Pipe {
            argv: vec!["vpcd".into(), "--stdio".into(), "--plugs".into(), "4".into()]
        }
    );
    assert_eq!(conf.listen, vec!["127.0.0.1:10101"]);
    Ok(())
}

#[test]
fn missing_spec_file_is_a_config_error() {
    let res = DaemonConf::parse(
        r#"
spec_files = ["/nonexistent/powerman/specs.toml"]
[[device]]
name = "v0"
spec = "vpc"
host = "localhost:11000"
[[node]]
name = "n0"
device = "v0"
"#,
        None,
    );
    assert!(matches!(res, Err(PowermanError::Config(_))));
}

#[test]
fn configuration_errors() {
    let base = r#"
[[device]]
name = "v0"
spec = "vpc"
host = "localhost:11000"
"#;
    let cases = [
        // no nodes
        base.to_string(),
        // node on an unknown device
        format!("{base}\n[[node]]\nname = \"n0\"\ndevice = \"v9\"\n"),
        // same node twice on one device
        format!("{base}\n[[node]]\nname = \"n[0-1]\"\ndevice = \"v0\"\n[[node]]\nname = \"n1\"\ndevice = \"v0\"\n"),
        // more nodes than plugs
        format!("{base}\n[[node]]\nname = \"n[0-16]\"\ndevice = \"v0\"\n"),
        // unknown plug
        format!("{base}\n[[node]]\nname = \"n0\"\ndevice = \"v0\"\nplugs = \"99\"\n"),
        // duplicate device
        format!("{base}{base}\n[[node]]\nname = \"n0\"\ndevice = \"v0\"\n"),
        // alias shadowing a node
        format!("{base}\n[[node]]\nname = \"n0\"\ndevice = \"v0\"\n[[alias]]\nname = \"n0\"\nnodes = \"n0\"\n"),
        // unknown key
        format!("{base}\nbogus = 1\n"),
    ];
    for (i, text) in cases.iter().enumerate() {
        assert!(DaemonConf::parse(text, None).is_err(), "case {i} should fail");
    }
}

#[test]
fn toml_errors_carry_position() {
    let err = SpecRegistry::from_str("[[spec]]\nname = \"x\"\ntimeout = \"soon\"\n").unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("parse error at 3:"), "{msg}");
}

#[test]
fn builtin_specs_are_available() -> TestResult {
    let reg = powerman::builtin_specs()?;
    assert_eq!(reg.names(), vec!["ipmipower", "vpc"]);
    let vpc = reg.get("vpc").ok_or("vpc missing")?;
    assert_eq!(vpc.plugs.len(), 16);
    assert!(vpc.supports(powerman::Command::StatusAll));
    Ok(())
}

#[test]
fn bad_scripts_are_rejected() {
    let bad = [
        // unknown script name
        "[[spec]]\nname = \"x\"\n[spec.scripts]\nfrobnicate = [ { send = \"x\" } ]\n",
        // bad regex
        "[[spec]]\nname = \"x\"\n[spec.scripts]\non = [ { expect = \"(\" } ]\n",
        // empty block
        "[[spec]]\nname = \"x\"\n[spec.scripts]\nstatus_all = [ { foreachplug = [] } ]\n",
        // negative delay
        "[[spec]]\nname = \"x\"\n[spec.scripts]\ncycle = [ { delay = -1.0 } ]\n",
        // capture index out of range
        "[[spec]]\nname = \"x\"\n[spec.scripts]\nstatus = [ { setplugstate = { plug = 1, value = 99 } } ]\n",
        // duplicate plug names
        "[[spec]]\nname = \"x\"\nplugs = [\"a\", \"a\"]\n",
        // more plug names than the device allows
        "[[spec]]\nname = \"x\"\nplug_names = \"[1-9]\"\nmax_plugs = 8\n",
        // interp with both states
        "[[spec]]\nname = \"x\"\n[spec.scripts]\nstatus = [ { setplugstate = { value = 1, interps = [ { on = \"a\", off = \"b\" } ] } } ]\n",
    ];
    for (i, text) in bad.iter().enumerate() {
        assert!(SpecRegistry::from_str(text).is_err(), "case {i} should fail");
    }
}
