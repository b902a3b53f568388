mod common;

use std::time::Duration;

use powerman::client_proto::CP_PROMPT;
use powerman_vpcd::VpcOptions;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const WAIT: Duration = Duration::from_secs(20);

/// Raw protocol connection; checks wire text exactly.
struct Wire {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Wire {
    async fn connect(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (r, w) = TcpStream::connect(addr).await?.into_split();
        let mut wire = Self {
            reader: BufReader::new(r),
            writer: w,
        };
        let greeting = wire.line().await?;
        assert_eq!(greeting, format!("001 {}", powerman::server::VERSION));
        wire.prompt().await?;
        Ok(wire)
    }

    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await
    }

    async fn line(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        let mut s = String::new();
        let n = timeout(WAIT, self.reader.read_line(&mut s)).await??;
        assert!(n > 0, "server closed the connection");
        assert!(s.ends_with("\r\n"), "line not CRLF terminated: {s:?}");
        s.truncate(s.len() - 2);
        Ok(s)
    }

    async fn prompt(&mut self) -> TestResult {
        let mut p = vec![0u8; CP_PROMPT.len()];
        timeout(WAIT, self.reader.read_exact(&mut p)).await??;
        assert_eq!(p, CP_PROMPT.as_bytes());
        Ok(())
    }

    /// Lines up to and including the final 1xx/2xx line, then the prompt.
    async fn request(&mut self, line: &str) -> Result<Vec<String>, Box<dyn std::error::Error>> {
        self.send(line).await?;
        let mut lines = Vec::new();
        loop {
            let l = self.line().await?;
            let final_line = matches!(l.as_bytes().first(), Some(b'1' | b'2'));
            lines.push(l);
            if final_line {
                break;
            }
        }
        self.prompt().await?;
        Ok(lines)
    }
}

#[tokio::test]
async fn help_lists_commands_and_quit_closes() -> TestResult {
    let (_vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    let help = w.request("help").await?;
    let expected = [
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
        "103 Query complete",
    ];
    assert_eq!(help, expected);

    w.send("quit").await?;
    assert_eq!(w.line().await?, "101 Goodbye");
    let mut rest = Vec::new();
    timeout(WAIT, w.reader.read_to_end(&mut rest)).await??;
    assert!(rest.is_empty());

    server.stop().await
}

#[tokio::test]
async fn unknown_and_empty_requests() -> TestResult {
    let (_vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    assert_eq!(w.request("frobnicate t0").await?, vec!["201 Unknown command"]);
    assert_eq!(w.request("").await?, vec!["201 Unknown command"]);
    assert_eq!(w.request("on").await?, vec!["201 Unknown command"]);

    server.stop().await
}

#[tokio::test]
async fn nodes_with_and_without_exprange() -> TestResult {
    let (_vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    assert_eq!(w.request("nodes").await?, vec!["306 t[0-15]", "103 Query complete"]);
    assert_eq!(w.request("exprange").await?, vec!["105 Hostrange expansion ON"]);
    let expanded = w.request("NODES").await?;
    assert_eq!(expanded.len(), 17);
    assert_eq!(expanded[0], "307 t0");
    assert_eq!(expanded[15], "307 t15");

    server.stop().await
}

#[tokio::test]
async fn power_on_then_status() -> TestResult {
    let (vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    assert_eq!(w.request("on t[0-3]").await?, vec!["102 Command completed successfully"]);
    for i in 0..4 {
        assert_eq!(vpc.plug(i), Some(true), "plug {i}");
    }
    assert_eq!(vpc.plug(4), Some(false));

    let st = w.request("status t[0-5]").await?;
    assert_eq!(
        st,
        vec![
            "302 on:      t[0-3]",
            "302 off:     t[4-5]",
            "302 unknown: ",
            "103 Query complete",
        ]
    );

    assert_eq!(w.request("off t2").await?, vec!["102 Command completed successfully"]);
    assert_eq!(vpc.plug(2), Some(false));

    w.request("exprange").await?;
    assert_eq!(
        w.request("status t[1-2]").await?,
        vec!["303 t1: on", "303 t2: off", "103 Query complete"]
    );

    server.stop().await
}

#[tokio::test]
async fn whole_device_request_uses_all_plug_script() -> TestResult {
    let (vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    assert_eq!(w.request("on t[0-15]").await?, vec!["102 Command completed successfully"]);
    assert!(vpc.history().iter().any(|c| c == "on *"));
    assert!((0..16).all(|i| vpc.plug(i) == Some(true)));

    assert_eq!(w.request("cycle t[0-15]").await?, vec!["102 Command completed successfully"]);
    assert!(vpc.history().iter().any(|c| c == "off *"));

    server.stop().await
}

#[tokio::test]
async fn alias_expands_to_members() -> TestResult {
    let (vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    assert_eq!(w.request("on front").await?, vec!["102 Command completed successfully"]);
    assert!((0..4).all(|i| vpc.plug(i) == Some(true)));
    assert_eq!(vpc.plug(4), Some(false));

    server.stop().await
}

#[tokio::test]
async fn unknown_nodes_are_reported() -> TestResult {
    let (vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    assert_eq!(w.request("on x[1-2]").await?, vec!["209 No such nodes: x[1-2]"]);

    let mixed = w.request("on t15,t16,t17").await?;
    assert_eq!(
        mixed,
        vec!["308 No such nodes: t[16-17]", "210 Command completed with errors"]
    );
    assert_eq!(vpc.plug(15), Some(true));

    assert_eq!(w.request("on t[3-").await?, vec!["205 Hostlist error: invalid range"]);

    server.stop().await
}

#[tokio::test]
async fn temp_and_beacon_queries() -> TestResult {
    let (vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    assert_eq!(
        w.request("temp t[0-1]").await?,
        vec!["303 t0: 30", "303 t1: 31", "103 Query complete"]
    );

    assert_eq!(w.request("flash t3").await?, vec!["102 Command completed successfully"]);
    assert_eq!(vpc.beacon(3), Some(true));
    assert_eq!(
        w.request("beacon t[2-3]").await?,
        vec!["302 on:      t3", "302 off:     t2", "302 unknown: ", "103 Query complete"]
    );
    assert_eq!(w.request("unflash t3").await?, vec!["102 Command completed successfully"]);
    assert_eq!(vpc.beacon(3), Some(false));

    server.stop().await
}

#[tokio::test]
async fn device_without_script_gets_213() -> TestResult {
    common::init();
    let (_vpc, port) = common::start_vpc(VpcOptions::default()).await?;
    let conf = format!(
        r#"{}
[[spec]]
name = "onlyon"
plug_names = "[0-1]"

[spec.scripts]
on = [
  {{ send = "on %s\n" }},
  {{ expect = "[0-9]* OK\n" }},
]

[[device]]
name = "pdu1"
spec = "onlyon"
host = "127.0.0.1"
port = {port}

[[node]]
name = "u[0-1]"
device = "pdu1"
"#,
        common::vpc_conf(port)
    );
    let server = common::start_server(&conf).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    let unimpl = "213 Command cannot be handled by power control device(s)";
    assert_eq!(w.request("temp u0").await?, vec![unimpl]);
    assert_eq!(w.request("status u[0-1]").await?, vec![unimpl]);
    // one incapable device rejects the whole request
    assert_eq!(w.request("status t0,u0").await?, vec![unimpl]);

    server.stop().await
}

#[tokio::test]
async fn overlong_line_is_rejected() -> TestResult {
    let (_vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    let long = "x".repeat(powerman::client_proto::CP_LINEMAX + 100);
    assert_eq!(w.request(&long).await?, vec!["203 Command too long"]);
    // the connection is still usable
    assert_eq!(w.request("nodes").await?, vec!["306 t[0-15]", "103 Query complete"]);

    server.stop().await
}

#[tokio::test]
async fn second_request_while_busy_gets_208() -> TestResult {
    let (_vpc, server) = common::start_rig(VpcOptions {
        drop_command: true,
        ..VpcOptions::default()
    })
    .await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    // vpcd swallows the first "on", so this waits for the action timeout
    w.send("on t0").await?;
    w.send("status t0").await?;
    assert_eq!(w.line().await?, "208 Command in progress");
    assert_eq!(
        w.line().await?,
        "308 pdu0: action timed out waiting for expected response"
    );
    assert_eq!(w.line().await?, "210 Command completed with errors");
    w.prompt().await?;

    // the device reconnects and the next request goes through
    assert_eq!(w.request("on t0").await?, vec!["102 Command completed successfully"]);

    server.stop().await
}

#[tokio::test]
async fn telemetry_shows_device_dialogue() -> TestResult {
    let (_vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    assert_eq!(w.request("telemetry").await?, vec!["104 Telemetry ON"]);
    let lines = w.request("on t5").await?;
    assert!(lines.iter().any(|l| l.starts_with("305 send(pdu0): 'on 5")), "{lines:?}");
    assert!(lines.iter().any(|l| l.starts_with("305 recv(pdu0): ")), "{lines:?}");
    assert_eq!(lines.last().map(String::as_str), Some("102 Command completed successfully"));

    assert_eq!(w.request("telemetry").await?, vec!["104 Telemetry OFF"]);
    assert_eq!(w.request("on t6").await?, vec!["102 Command completed successfully"]);

    server.stop().await
}

#[tokio::test]
async fn device_query_reports_connection() -> TestResult {
    let (_vpc, server) = common::start_rig(VpcOptions::default()).await?;
    let mut w = Wire::connect(&server.addr_string()).await?;

    // make sure the device has connected and logged in
    w.request("status t0").await?;
    let lines = w.request("device pdu0").await?;
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("304 pdu0: state=connected reconnects=000 actions="), "{}", lines[0]);
    assert!(lines[0].ends_with("type=vpc hosts=t[0-15]"), "{}", lines[0]);

    let by_node = w.request("device t3").await?;
    assert_eq!(by_node.len(), 2);
    assert_eq!(w.request("device nosuch").await?, vec!["103 Query complete"]);

    server.stop().await
}
