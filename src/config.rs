use once_cell::sync::Lazy;

#[derive(Debug)]
pub struct Config {
    /// Complete every `delay` statement immediately (test rigs, `powermand -S`).
    pub short_circuit_delay: bool,
    pub log_device_io: bool,
    pub max_dev_buf: usize,
    pub client_linemax: usize,
}

impl Config {
    fn from_env() -> Self {
        let short_circuit_delay = std::env::var("POWERMAN_SHORT_CIRCUIT_DELAY")
            .map(|v| v == "1")
            .unwrap_or(false);
        let log_device_io = std::env::var("POWERMAN_LOG_DEVICE_IO")
            .map(|v| v == "1")
            .unwrap_or(false);
        let max_dev_buf = std::env::var("POWERMAN_MAX_DEV_BUF")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n >= 1024)
            .unwrap_or(65536usize);
        let client_linemax = std::env::var("POWERMAN_CLIENT_LINEMAX")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(crate::client_proto::CP_LINEMAX);
        Self {
            short_circuit_delay,
            log_device_io,
            max_dev_buf,
            client_linemax,
        }
    }
}

/// Global config loaded once from environment at first access.
pub static GLOBAL_CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

/// Convenience accessor
pub fn config() -> &'static Config {
    &GLOBAL_CONFIG
}
