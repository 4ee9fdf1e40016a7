//! Session Configuration
//!
//! Timing and socket options shared by every tunnel of one session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration for one SSH session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Readiness wait granularity for general blocking calls (ms)
    #[serde(default = "default_select_timeout")]
    pub select_timeout_ms: u64,

    /// Readiness wait granularity inside tunnels and pumps (ms)
    #[serde(default = "default_tunnel_select_timeout")]
    pub tunnel_select_timeout_ms: u64,

    /// How long one remote-forward accept attempt may wait before the worker
    /// re-checks its stop signal (ms)
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_ms: u64,

    /// Pump read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Set TCP_NODELAY on local sockets
    #[serde(default)]
    pub tcp_nodelay: bool,

    /// Tear a tunnel down on the first connection-handling error
    #[serde(default)]
    pub auto_terminate_tunnels: bool,

    /// SSH keepalive interval in seconds, 0 disables keepalive
    #[serde(default)]
    pub keepalive_interval_secs: u64,

    /// Upper bound for closing a channel when a pump exits (ms)
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Upper bound for a SOCKS5 client to finish its handshake (ms)
    #[serde(default = "default_socks_handshake_timeout")]
    pub socks_handshake_timeout_ms: u64,
}

fn default_select_timeout() -> u64 {
    5
}

fn default_tunnel_select_timeout() -> u64 {
    1
}

fn default_accept_timeout() -> u64 {
    100
}

fn default_buffer_size() -> usize {
    32 * 1024
}

fn default_close_timeout() -> u64 {
    1000
}

fn default_socks_handshake_timeout() -> u64 {
    10_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            select_timeout_ms: default_select_timeout(),
            tunnel_select_timeout_ms: default_tunnel_select_timeout(),
            accept_timeout_ms: default_accept_timeout(),
            buffer_size: default_buffer_size(),
            tcp_nodelay: false,
            auto_terminate_tunnels: false,
            keepalive_interval_secs: 0,
            close_timeout_ms: default_close_timeout(),
            socks_handshake_timeout_ms: default_socks_handshake_timeout(),
        }
    }
}

impl SessionConfig {
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn with_auto_terminate_tunnels(mut self, enabled: bool) -> Self {
        self.auto_terminate_tunnels = enabled;
        self
    }

    pub fn with_keepalive_interval(mut self, secs: u64) -> Self {
        self.keepalive_interval_secs = secs;
        self
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes.max(1);
        self
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms.max(1))
    }

    pub fn tunnel_select_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_select_timeout_ms.max(1))
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn socks_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.socks_handshake_timeout_ms.max(1))
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}
