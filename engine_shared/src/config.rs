//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to app).
//! Values are consumed as already validated; the only policy applied here is
//! the listen port fallback.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bind address. `localhost` is accepted.
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Listen port. Zero falls back to `defport`.
    #[serde(default)]
    pub hostport: u16,
    /// Fallback listen port.
    #[serde(default = "default_defport")]
    pub defport: u16,
    /// Maximum number of concurrent client sessions.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Seconds without inbound traffic before a client is dropped.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f32,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Inbound datagrams drained per poll.
    #[serde(default = "default_max_datagrams_per_tick")]
    pub max_datagrams_per_tick: usize,
    /// Frames a client may fall behind before it gets a full snapshot.
    #[serde(default = "default_max_snapshot_lag")]
    pub max_snapshot_lag: u32,
    /// Unacknowledged reliable messages are resent after this long.
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_defport() -> u16 {
    27015
}

fn default_max_clients() -> usize {
    32
}

fn default_timeout_secs() -> f32 {
    65.0
}

fn default_tick_hz() -> u32 {
    64
}

fn default_max_datagrams_per_tick() -> usize {
    256
}

fn default_max_snapshot_lag() -> u32 {
    32
}

fn default_resend_interval_ms() -> u64 {
    200
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            hostport: 0,
            defport: default_defport(),
            max_clients: default_max_clients(),
            timeout_secs: default_timeout_secs(),
            tick_hz: default_tick_hz(),
            max_datagrams_per_tick: default_max_datagrams_per_tick(),
            max_snapshot_lag: default_max_snapshot_lag(),
            resend_interval_ms: default_resend_interval_ms(),
            player_name: default_player_name(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Port the server listens on: `hostport`, or `defport` when unset.
    pub fn port(&self) -> u16 {
        if self.hostport == 0 {
            self.defport
        } else {
            self.hostport
        }
    }

    /// Resolves `ip` and [`port`](Self::port) into a socket address.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip = if self.ip.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.ip
                .parse()
                .with_context(|| format!("parse ip '{}'", self.ip))?
        };
        Ok(SocketAddr::new(ip, self.port()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f32(self.timeout_secs.max(0.0))
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_hz.max(1) as f32)
    }
}
