// Blocking WebSocket client for the relay.
//
// Speaks the same text protocol as the browser control panels: every frame is
// a raw `key:value ...` delta, or `save:<name>`. Used by the integration tests
// and handy for scripting a show from a terminal.
//
// The client owns one `WebSocket<TcpStream>`; reads use a per-call timeout so
// a test can wait for a broadcast without hanging forever.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use abstrax_protocol::codec::SAVE_PREFIX;
use tungstenite::{Message, WebSocket};

/// Client connection failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect: {0}")]
    Io(#[from] io::Error),
    #[error("websocket handshake: {0}")]
    Handshake(String),
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// A connected control client.
pub struct ControlClient {
    ws: WebSocket<TcpStream>,
}

impl ControlClient {
    /// Connect to a relay's WebSocket address.
    pub fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let (ws, _response) = tungstenite::client(format!("ws://{addr}/"), stream)
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
        Ok(Self { ws })
    }

    /// Send a raw message.
    pub fn send(&mut self, raw: &str) -> Result<(), ClientError> {
        self.ws.send(Message::Text(raw.to_owned()))?;
        Ok(())
    }

    /// Ask the relay to save a snapshot.
    pub fn save(&mut self, name: &str) -> Result<(), ClientError> {
        self.send(&format!("{SAVE_PREFIX}{name}"))
    }

    /// Wait up to `timeout` for the next text message. Returns `None` on
    /// timeout.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<String>, ClientError> {
        self.ws.get_ref().set_read_timeout(Some(timeout))?;
        loop {
            match self.ws.read() {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Close(_)) => {
                    return Err(ClientError::WebSocket(tungstenite::Error::ConnectionClosed));
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Collect messages until none arrives for `quiet`.
    pub fn drain(&mut self, quiet: Duration) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(Some(text)) = self.recv_timeout(quiet) {
            messages.push(text);
        }
        messages
    }

    /// Close the connection gracefully.
    pub fn close(mut self) {
        let _ = self.ws.close(None);
        // Read until the relay acknowledges the close or the socket times out.
        let _ = self.ws.get_ref().set_read_timeout(Some(Duration::from_secs(1)));
        while self.ws.read().is_ok() {}
    }
}
