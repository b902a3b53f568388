#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::doc_markdown,
    clippy::too_long_first_doc_paragraph
)]

//! powerman
//!
//! Core of the powerman power control daemon: it talks to remote power
//! controllers (PDUs, IPMI helpers, serial switches) through per-device
//! dialogue scripts and serves the line-oriented powerman client protocol.
//!
//! Main pieces:
//! - `Hostlist` and `PlugList` for `node[1-16]` style names and the node to plug mapping
//! - `DeviceSpec` scripts (send / expect / delay / setplugstate / foreach / ifon / ifoff) loaded from TOML
//! - `Interpreter`, a resumable script runner that never blocks
//! - `Device`, one tokio task per power controller with reconnect and timeouts
//! - `Dispatcher` and `Server`, the powermand request fan-out and event loop
//! - `PowermanClient`, an async client for the protocol
//!
//! Starting a daemon from a configuration file:
//! ```no_run
//! # async fn demo() -> Result<(), powerman::PowermanError> {
//! let conf = powerman::DaemonConf::from_path(std::path::Path::new("/etc/powerman/powerman.toml"))?;
//! let server = powerman::Server::new(conf);
//! server.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod client;
pub mod client_proto;
pub mod commands;
pub mod config;
pub mod daemon_conf;
pub mod device;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod hostlist;
pub mod interp;
pub mod pluglist;
pub mod request;
pub mod response;
pub mod script;
pub mod server;
pub mod session;
pub mod spec_registry;
pub mod toml_helpers;
pub mod transport;

pub use action::{Action, ActionError, ActionEvent, ActionEventKind, ActionOutcome, ActionStatus, TargetMode};
pub use client::{DeviceInfo, PowermanClient};
pub use commands::Command;
pub use daemon_conf::{DaemonConf, DeviceConf};
pub use device::{ConnectState, Device, DeviceHandle, DeviceStats};
pub use dispatch::Dispatcher;
pub use endpoint::Endpoint;
pub use error::PowermanError;
pub use hostlist::Hostlist;
pub use interp::{Interpreter, Step};
pub use pluglist::{PlugList, PlugListError};
pub use script::{DeviceSpec, PlugState};
pub use server::Server;
pub use spec_registry::SpecRegistry;

/// Device specifications shipped with the crate (`vpc`, `ipmipower`).
pub fn builtin_specs() -> Result<SpecRegistry, PowermanError> {
    SpecRegistry::builtin()
}
