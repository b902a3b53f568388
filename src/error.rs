use thiserror::Error;

use crate::pluglist::PlugListError;

#[derive(Error, Debug)]
pub enum PowermanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("hostlist error: {0}")]
    Hostlist(String),

    #[error("plug mapping error: {0}")]
    PlugList(#[from] PlugListError),

    #[error("connect error: {0}")]
    Connect(String),

    /// A final 2xx response from powermand.
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("no server address set on client")]
    NoTarget,
}
