// abstrax_relay — state-synchronization relay for the Abstrax laser show.
//
// Browser control panels connect over WebSocket and send `key:value` deltas
// whenever an operator moves a control. The relay keeps the one authoritative
// copy of the show state, rebroadcasts each delta verbatim to every other
// panel, forwards it as OSC to the laser consumers over UDP, and saves named
// snapshots of the state on request.
//
// Module overview:
// - `state.rs`:     `StateStore`, the authoritative key/value map.
// - `snapshot.rs`:  `SnapshotStore` (atomic preset files) and the background
//                   `SnapshotWriter`.
// - `sink.rs`:      `ProtocolSink` trait and the OSC-over-UDP sink.
// - `hub.rs`:       `RelayHub`: session set, merge, broadcast, forward,
//                   save requests. The core data structure `server.rs` drives.
// - `server.rs`:    listener, connection threads, and the hub event loop.
//                   Uses `std::net` + `tungstenite` with a thread per
//                   connection and an `mpsc` channel funnelling events into
//                   the single-threaded hub.
// - `http.rs`:      `/state.txt` and snapshot files over `tiny_http`.
// - `client.rs`:    blocking WebSocket client (tests, scripting).
// - `config.rs`, `error.rs`: configuration and error types.
//
// Dependencies: `abstrax_protocol` (delta codec and OSC packets).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in
// another process via the library API (`start_relay`).

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod server;
pub mod sink;
pub mod snapshot;
pub mod state;

pub use config::RelayConfig;
pub use server::{RelayAddrs, RelayHandle, start_relay};
