mod common;

use std::sync::Arc;
use std::time::Duration;

use powerman::action::ActionEvent;
use powerman::{
    Action, ActionEventKind, ActionOutcome, ActionStatus, Command, ConnectState, Device,
    DeviceHandle, DeviceSpec, Endpoint, PlugList, PlugState, SpecRegistry, TargetMode,
};
use powerman_vpcd::VpcOptions;
use tokio::sync::mpsc;
use tokio::time::timeout;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const WAIT: Duration = Duration::from_secs(20);

/// vpc dialogue with a short action timeout.
const FAST_VPC: &str = r#"
[[spec]]
name = "fastvpc"
timeout = 0.5
plug_names = "[0-15]"

[spec.scripts]
login = [
  { expect = "[0-9]* vpc> " },
  { send = "login\n" },
  { expect = "[0-9]* OK\n" },
  { expect = "[0-9]* vpc> " },
]
logout = [
  { send = "logoff\n" },
  { expect = "[0-9]* OK\n" },
]
on = [
  { send = "on %s\n" },
  { expect = "[0-9]* OK\n" },
  { expect = "[0-9]* vpc> " },
]
"#;

fn spec(name: &str) -> Result<Arc<DeviceSpec>, Box<dyn std::error::Error>> {
    let mut reg = SpecRegistry::builtin()?;
    reg.merge(SpecRegistry::from_str(FAST_VPC)?);
    Ok(reg.get(name).ok_or("missing spec")?)
}

fn start_device(spec: Arc<DeviceSpec>, endpoint: Endpoint) -> Result<DeviceHandle, Box<dyn std::error::Error>> {
    let mut plugs = PlugList::new(Some(spec.plugs.as_slice()));
    plugs.map("t[0-15]", Some("[0-15]"))?;
    let (handle, _join) = DeviceHandle::spawn(Device::new("pdu0", spec, endpoint, plugs));
    Ok(handle)
}

fn action(
    command: Command,
    mode: TargetMode,
    plugs: &[&str],
    request: u64,
    tx: &mpsc::UnboundedSender<ActionEvent>,
) -> Action {
    Action::new(command, mode)
        .with_targets(plugs.iter().map(|p| (*p).to_string()).collect())
        .with_request(request, tx.clone())
}

async fn completion(rx: &mut mpsc::UnboundedReceiver<ActionEvent>) -> ActionOutcome {
    loop {
        let ev = timeout(WAIT, rx.recv())
            .await
            .expect("no action event in time")
            .expect("event channel closed");
        if let ActionEventKind::Completed(outcome) = ev.kind {
            return outcome;
        }
    }
}

#[tokio::test]
async fn logs_in_and_switches_plugs() -> TestResult {
    common::init();
    let (vpc, port) = common::start_vpc(VpcOptions::default()).await?;
    let dev = start_device(spec("vpc")?, Endpoint::tcp("127.0.0.1", port))?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let stats = timeout(WAIT, dev.wait_for(|s| s.logged_in)).await??;
    assert_eq!(stats.state, ConnectState::Connected);
    assert_eq!(vpc.history().first().map(String::as_str), Some("login"));

    dev.enqueue(action(Command::On, TargetMode::Single, &["3", "7"], 1, &tx))?;
    let out = completion(&mut rx).await;
    assert_eq!(out.status, ActionStatus::Success);
    assert_eq!(out.error, None);
    assert_eq!(vpc.plug(3), Some(true));
    assert_eq!(vpc.plug(7), Some(true));
    let hist = vpc.history();
    assert!(hist.iter().any(|c| c == "on 3") && hist.iter().any(|c| c == "on 7"));

    let all: Vec<String> = (0..16).map(|i| i.to_string()).collect();
    let all: Vec<&str> = all.iter().map(String::as_str).collect();
    dev.enqueue(action(Command::StatusAll, TargetMode::All, &all, 2, &tx))?;
    let out = completion(&mut rx).await;
    assert_eq!(out.status, ActionStatus::Success);
    assert_eq!(out.results.len(), 16);
    let t3 = out.results.iter().find(|r| r.node == "t3").ok_or("t3 missing")?;
    assert_eq!(t3.plug, "3");
    assert_eq!(t3.result.state, PlugState::On);
    assert_eq!(t3.result.value.as_deref(), Some("ON"));
    let t4 = out.results.iter().find(|r| r.node == "t4").ok_or("t4 missing")?;
    assert_eq!(t4.result.state, PlugState::Off);

    dev.shutdown();
    Ok(())
}

#[tokio::test]
async fn hung_device_times_out_login() -> TestResult {
    common::init();
    let (_vpc, port) = common::start_vpc(VpcOptions {
        hung: true,
        ..VpcOptions::default()
    })
    .await?;
    let dev = start_device(spec("fastvpc")?, Endpoint::tcp("127.0.0.1", port))?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    dev.enqueue(action(Command::On, TargetMode::Single, &["0"], 1, &tx))?;
    let out = completion(&mut rx).await;
    assert_eq!(out.status, ActionStatus::Timeout);
    assert_eq!(out.error.as_deref(), Some("pdu0: login timeout"));

    dev.shutdown();
    Ok(())
}

#[tokio::test]
async fn unreachable_device_times_out_connect() -> TestResult {
    common::init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    let dev = start_device(spec("fastvpc")?, Endpoint::tcp("127.0.0.1", port))?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    dev.enqueue(action(Command::On, TargetMode::Single, &["0"], 1, &tx))?;
    let out = completion(&mut rx).await;
    assert_eq!(out.status, ActionStatus::Timeout);
    assert_eq!(out.error.as_deref(), Some("pdu0: connect timeout"));
    assert_ne!(dev.stats().state, ConnectState::Connected);

    dev.shutdown();
    Ok(())
}

#[tokio::test]
async fn expect_timeout_aborts_queue_and_reconnects() -> TestResult {
    common::init();
    let (vpc, port) = common::start_vpc(VpcOptions {
        drop_command: true,
        ..VpcOptions::default()
    })
    .await?;
    let dev = start_device(spec("fastvpc")?, Endpoint::tcp("127.0.0.1", port))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    timeout(WAIT, dev.wait_for(|s| s.logged_in)).await??;

    dev.enqueue(action(Command::On, TargetMode::Single, &["1"], 1, &tx))?;
    dev.enqueue(action(Command::On, TargetMode::Single, &["2"], 2, &tx))?;
    let first = completion(&mut rx).await;
    assert_eq!(first.status, ActionStatus::Timeout);
    assert_eq!(
        first.error.as_deref(),
        Some("pdu0: action timed out waiting for expected response")
    );
    let second = completion(&mut rx).await;
    assert_eq!(second.status, ActionStatus::Failure);
    assert_eq!(
        second.error.as_deref(),
        Some("pdu0: action aborted due to previous action timeout")
    );

    let stats = timeout(WAIT, dev.wait_for(|s| s.successful_connects >= 2 && s.logged_in)).await??;
    assert_eq!(stats.reconnects(), 1);
    // the missed expect put the device in the error state before it reconnected
    assert_eq!(stats.errors, 1);

    dev.enqueue(action(Command::On, TargetMode::Single, &["2"], 3, &tx))?;
    assert_eq!(completion(&mut rx).await.status, ActionStatus::Success);
    assert_eq!(vpc.plug(2), Some(true));

    dev.shutdown();
    Ok(())
}

#[tokio::test]
async fn empty_target_set_touches_nothing() -> TestResult {
    common::init();
    let (vpc, port) = common::start_vpc(VpcOptions::default()).await?;
    let dev = start_device(spec("vpc")?, Endpoint::tcp("127.0.0.1", port))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    timeout(WAIT, dev.wait_for(|s| s.logged_in)).await??;

    dev.enqueue(action(Command::On, TargetMode::Single, &[], 1, &tx))?;
    dev.enqueue(action(Command::OnRanged, TargetMode::Ranged, &[], 2, &tx))?;
    for _ in 0..2 {
        let out = completion(&mut rx).await;
        assert_eq!(out.status, ActionStatus::Success);
        assert_eq!(out.error, None);
        assert!(out.results.is_empty());
    }

    dev.enqueue(action(Command::On, TargetMode::Single, &["5"], 3, &tx))?;
    assert_eq!(completion(&mut rx).await.status, ActionStatus::Success);
    assert_eq!(vpc.history(), vec!["login".to_string(), "on 5".to_string()]);
    assert_eq!(dev.stats().errors, 0);

    dev.shutdown();
    Ok(())
}

#[tokio::test]
async fn reconnects_after_device_hangs_up() -> TestResult {
    common::init();
    let (vpc, port) = common::start_vpc(VpcOptions::default()).await?;
    let dev = start_device(spec("vpc")?, Endpoint::tcp("127.0.0.1", port))?;
    timeout(WAIT, dev.wait_for(|s| s.logged_in)).await??;

    // vpcd closes the connection after logoff
    dev.enqueue(Action::internal(Command::Logout))?;
    let stats = timeout(WAIT, dev.wait_for(|s| s.successful_connects >= 2 && s.logged_in)).await??;
    assert_eq!(stats.state, ConnectState::Connected);
    assert_eq!(vpc.connections(), 2);

    dev.shutdown();
    Ok(())
}

#[tokio::test]
async fn shutdown_logs_out() -> TestResult {
    common::init();
    let (vpc, port) = common::start_vpc(VpcOptions::default()).await?;
    let spec = spec("vpc")?;
    let mut plugs = PlugList::new(Some(spec.plugs.as_slice()));
    plugs.map("t[0-15]", Some("[0-15]"))?;
    let (dev, join) = DeviceHandle::spawn(Device::new("pdu0", spec, Endpoint::tcp("127.0.0.1", port), plugs));
    timeout(WAIT, dev.wait_for(|s| s.logged_in)).await??;

    dev.shutdown();
    timeout(WAIT, join).await??;
    assert_eq!(vpc.history().last().map(String::as_str), Some("logoff"));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn coprocess_transport() -> TestResult {
    common::init();
    // `cat` echoes each command back, which is all this script expects
    let reg = SpecRegistry::from_str(
        r#"
[[spec]]
name = "echo"
timeout = 5.0

[spec.scripts]
on = [
  { send = "on %s\n" },
  { expect = "on ([a-z0-9]+)\n" },
  { setplugstate = { value = "on", interps = [ { on = "on" } ] } },
]
"#,
    )?;
    let spec = reg.get("echo").ok_or("missing spec")?;
    let mut plugs = PlugList::new(None);
    plugs.map("n[1-2]", None)?;
    let (dev, _join) = DeviceHandle::spawn(Device::new("echo0", spec, Endpoint::pipe("cat")?, plugs));
    let (tx, mut rx) = mpsc::unbounded_channel();

    dev.enqueue(action(Command::On, TargetMode::Single, &["n2"], 1, &tx))?;
    let out = completion(&mut rx).await;
    assert_eq!(out.status, ActionStatus::Success);
    assert_eq!(out.results.len(), 1);
    assert_eq!(out.results[0].node, "n2");
    assert_eq!(out.results[0].result.state, PlugState::On);

    dev.shutdown();
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn failed_action_puts_device_in_error() -> TestResult {
    common::init();
    // nothing is known about n1, so the guard fails the only target
    let reg = SpecRegistry::from_str(
        r#"
[[spec]]
name = "guard"
timeout = 5.0

[spec.scripts]
on = [
  { ifoff = [
    { send = "on %s\n" },
    { expect = "on ([a-z0-9]+)\n" },
  ] },
]
"#,
    )?;
    let spec = reg.get("guard").ok_or("missing spec")?;
    let mut plugs = PlugList::new(None);
    plugs.map("n[1-2]", None)?;
    let (dev, _join) = DeviceHandle::spawn(Device::new("guard0", spec, Endpoint::pipe("cat")?, plugs));
    let (tx, mut rx) = mpsc::unbounded_channel();
    timeout(WAIT, dev.wait_for(|s| s.state == ConnectState::Connected)).await??;

    dev.enqueue(action(Command::On, TargetMode::Single, &["n1"], 1, &tx))?;
    let out = completion(&mut rx).await;
    assert_eq!(out.status, ActionStatus::Failure);
    assert_eq!(out.error.as_deref(), Some("guard0: action failed for some plugs (n1)"));

    let stats = timeout(WAIT, dev.wait_for(|s| s.errors >= 1 && s.successful_connects >= 2)).await??;
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.reconnects(), 1);

    dev.shutdown();
    Ok(())
}
