// Outbound protocol sinks.
//
// Every accepted state update is forwarded, unmodified, to each configured
// sink. The contract is fire-and-forget: `forward` never returns an error and
// never blocks the hub. Delivery is best effort, matching the connectionless
// UDP transport the laser consumers listen on.
//
// `UdpSink` wraps the raw text in an OSC `/abstract/conf` message (see
// `abstrax_protocol::osc`) and sends it from a non-blocking socket with
// broadcast enabled, so a sink address may be a unicast host or a broadcast
// address such as 255.255.255.255. Send failures are logged once at `warn`
// when a sink starts failing and at `debug` while it keeps failing.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use abstrax_protocol::osc::{CONF_ADDRESS, encode_string_message};

/// A destination for forwarded state updates.
pub trait ProtocolSink: Send {
    /// Forward a raw update. Must swallow all failures.
    fn forward(&mut self, raw: &str);

    /// Human-readable destination, for logs.
    fn describe(&self) -> String;
}

/// OSC-over-UDP sink.
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
    failing: bool,
}

impl UdpSink {
    /// Bind an ephemeral local socket for sending to `target`.
    pub fn bind(target: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)?;
        if target.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            target,
            failing: false,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl ProtocolSink for UdpSink {
    fn forward(&mut self, raw: &str) {
        let packet = match encode_string_message(CONF_ADDRESS, raw) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("not forwarding update to {}: {e}", self.target);
                return;
            }
        };
        match self.socket.send_to(&packet, self.target) {
            Ok(_) => {
                if self.failing {
                    log::info!("sink {} is reachable again", self.target);
                    self.failing = false;
                }
            }
            Err(e) if self.failing => log::debug!("sink {}: {e}", self.target),
            Err(e) => {
                log::warn!("sink {}: {e}", self.target);
                self.failing = true;
            }
        }
    }

    fn describe(&self) -> String {
        format!("udp://{}{CONF_ADDRESS}", self.target)
    }
}
