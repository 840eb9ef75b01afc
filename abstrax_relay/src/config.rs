// Relay configuration.
//
// `RelayConfig` carries every tunable of a running relay. Defaults reproduce
// the stock deployment: control panels on port 8081 (WebSocket), the dump
// and snapshot files on port 8080 (HTTP), snapshots under `presets/`, and
// updates forwarded to the laser on UDP port 60000 both by broadcast and to
// localhost.
//
// A JSON file may supply any subset of fields (`load_file`); `main.rs` then
// applies command-line overrides on top.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default OSC port of the laser consumers.
pub const DEFAULT_SINK_PORT: u16 = 60000;

/// Configuration for starting a relay server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address both listeners bind to.
    pub bind: IpAddr,
    /// WebSocket port for control clients (0 lets the OS pick).
    pub ws_port: u16,
    /// HTTP port for the state dump and snapshot files (0 lets the OS pick).
    pub http_port: u16,
    pub snapshot_dir: PathBuf,
    /// `host:port` destinations for forwarded updates.
    pub sinks: Vec<String>,
    /// Messages buffered per session before it is evicted as too slow.
    pub outbound_queue_depth: usize,
    pub write_timeout_ms: u64,
    /// How often idle loops wake to check for shutdown and outbound data.
    pub poll_interval_ms: u64,
    /// Snapshot to load into the state before accepting clients.
    pub restore: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ws_port: 8081,
            http_port: 8080,
            snapshot_dir: PathBuf::from("presets"),
            sinks: vec![
                format!("255.255.255.255:{DEFAULT_SINK_PORT}"),
                format!("127.0.0.1:{DEFAULT_SINK_PORT}"),
            ],
            outbound_queue_depth: 256,
            write_timeout_ms: 5000,
            poll_interval_ms: 20,
            restore: None,
        }
    }
}

impl RelayConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Replace the broadcast destination with `ip`, keeping the localhost
    /// sink. This is the `relay <ip>` form of the command line.
    pub fn set_primary_sink_ip(&mut self, ip: IpAddr) {
        let primary = SocketAddr::new(ip, DEFAULT_SINK_PORT).to_string();
        match self.sinks.first_mut() {
            Some(first) => *first = primary,
            None => self.sinks.push(primary),
        }
    }

    /// Resolve every sink to a socket address.
    pub fn sink_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.sinks.iter().map(|s| resolve_sink(s)).collect()
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Resolve `host:port`; a bare host gets the default sink port.
pub fn resolve_sink(target: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_SINK_PORT));
    }
    target
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidSink(target.to_owned()))
}
