//! Connection and pool configuration.

use std::time::Duration;

use crate::stratum_v1::{StratumError, StratumResult};

/// Keep-alive probe interval applied to every Stratum socket.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(120);

/// Transport settings applied by the socket adapter.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Disable Nagle's algorithm so each line goes out immediately
    pub no_delay: bool,

    /// Idle time before the kernel starts keep-alive probing
    pub keepalive: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }
}

/// Pool connection configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://host:port or host:port)
    pub url: String,

    /// Worker username
    pub username: String,

    /// Worker password
    pub password: String,

    /// User agent string
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            user_agent: concat!("stratum-link/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl PoolConfig {
    /// The `host:port` part of the URL, with any scheme stripped.
    pub fn address(&self) -> StratumResult<&str> {
        let addr = self
            .url
            .strip_prefix("stratum+tcp://")
            .or_else(|| self.url.strip_prefix("tcp://"))
            .unwrap_or(&self.url)
            .trim_end_matches('/');

        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(addr),
            _ => Err(StratumError::InvalidUrl(self.url.clone())),
        }
    }
}
