// WebSocket server and hub event loop for the relay.
//
// Architecture: thread-per-connection with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): assigns each new
//   connection a `SessionId` and spawns a connection thread for it.
// - **Connection threads** (one per client): perform the WebSocket handshake
//   (Connecting), announce the session with `InternalEvent::Connected`
//   (Open), then read frames and hand them to the hub. On close, error, or
//   eviction they send `InternalEvent::Disconnected` (Closed) and exit.
// - **Writer threads** (one per client): block on the session's bounded
//   outbound queue and write each message the moment it arrives, so
//   delivery never waits on the reader. A socket write that fails or times
//   out ends the session.
// - **Hub thread**: owns the `RelayHub`, receives events from the channel,
//   and dispatches them one at a time. This is what serializes merges: two
//   sessions' messages can arrive concurrently, but the hub applies,
//   broadcasts and forwards them strictly one after the other.
// - **HTTP thread** (`http.rs`): serves the dump and snapshot files, reading
//   the `StateStore` under its read lock.
// - **Snapshot writer thread** (`snapshot.rs`), owned by the hub.
//
// The hub only ever touches a session through its outbound queue. When the
// hub drops a session the queue's sender goes away and the writer thread
// exits; when the writer exits the queue's receiver goes away and the hub
// evicts the session on its next send. Either way the connection thread
// notices within one poll interval and closes the socket.
//
// Shutdown: `RelayHandle::stop` clears a shared `keep_running` flag; every
// loop polls it at `poll_interval` and exits, and the hub's snapshot writer
// finishes queued saves before the hub thread returns.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread;
use std::time::Duration;

use abstrax_protocol::codec;
use abstrax_protocol::types::SessionId;
use tungstenite::protocol::Role;
use tungstenite::{Message, WebSocket};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::http;
use crate::hub::RelayHub;
use crate::sink::{ProtocolSink, UdpSink};
use crate::snapshot::{SnapshotStore, SnapshotWriter};
use crate::state::StateStore;

/// Time allowed for a client to complete the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Events sent from listener/connection threads to the hub thread.
enum InternalEvent {
    Connected {
        id: SessionId,
        peer: SocketAddr,
        outbound: SyncSender<String>,
    },
    MessageFrom {
        id: SessionId,
        raw: String,
    },
    Disconnected {
        id: SessionId,
    },
}

/// Per-connection settings copied out of `RelayConfig`.
#[derive(Clone, Copy)]
struct ConnectionSettings {
    queue_depth: usize,
    write_timeout: Duration,
    poll_interval: Duration,
}

/// Addresses the relay actually bound (useful when port 0 is configured).
#[derive(Clone, Copy, Debug)]
pub struct RelayAddrs {
    pub ws: SocketAddr,
    pub http: SocketAddr,
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

/// Start the relay on background threads. Returns a handle for stopping it
/// and the bound WebSocket and HTTP addresses.
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, RelayAddrs), RelayError> {
    let sink_addrs = config.sink_addrs()?;
    let mut sinks: Vec<Box<dyn ProtocolSink>> = Vec::with_capacity(sink_addrs.len());
    for addr in sink_addrs {
        let sink = UdpSink::bind(addr).map_err(|source| RelayError::Bind {
            what: "sink socket",
            source,
        })?;
        log::info!("forwarding updates to {}", sink.describe());
        sinks.push(Box::new(sink));
    }

    let snapshots = Arc::new(SnapshotStore::new(&config.snapshot_dir));
    let state = Arc::new(StateStore::new());
    if let Some(name) = &config.restore {
        let text = snapshots.load(name)?;
        state.merge(codec::decode(text.trim_end_matches(['\r', '\n'])));
        log::info!("restored snapshot {name:?} ({} parameters)", state.len());
    }

    let listener =
        TcpListener::bind((config.bind, config.ws_port)).map_err(|source| RelayError::Bind {
            what: "websocket listener",
            source,
        })?;
    let ws_addr = listener.local_addr().map_err(|source| RelayError::Bind {
        what: "websocket listener",
        source,
    })?;
    let http_server = tiny_http::Server::http((config.bind, config.http_port)).map_err(|e| {
        RelayError::Bind {
            what: "http listener",
            source: io::Error::other(e.to_string()),
        }
    })?;
    let http_addr = http_server
        .server_addr()
        .to_ip()
        .ok_or_else(|| RelayError::Bind {
            what: "http listener",
            source: io::Error::other("not an IP listener"),
        })?;

    let writer = SnapshotWriter::spawn(Arc::clone(&snapshots)).map_err(|source| {
        RelayError::Bind {
            what: "snapshot writer",
            source,
        }
    })?;
    let hub = RelayHub::new(Arc::clone(&state), writer, sinks);

    let keep_running = Arc::new(AtomicBool::new(true));
    let settings = ConnectionSettings {
        queue_depth: config.outbound_queue_depth.max(1),
        write_timeout: config.write_timeout(),
        poll_interval: config.poll_interval(),
    };
    let (tx, rx) = mpsc::channel();

    let mut threads = Vec::new();
    {
        let keep_running = Arc::clone(&keep_running);
        threads.push(thread::spawn(move || {
            run_hub(hub, rx, keep_running, settings.poll_interval);
        }));
    }
    {
        let keep_running = Arc::clone(&keep_running);
        threads.push(thread::spawn(move || {
            accept_loop(listener, tx, keep_running, settings);
        }));
    }
    {
        let keep_running = Arc::clone(&keep_running);
        threads.push(thread::spawn(move || {
            http::serve(
                http_server,
                state,
                snapshots,
                keep_running,
                settings.poll_interval,
            );
        }));
    }

    log::info!("control sessions on ws://{ws_addr}/, state on http://{http_addr}/state.txt");
    Ok((
        RelayHandle {
            keep_running,
            threads,
        },
        RelayAddrs {
            ws: ws_addr,
            http: http_addr,
        },
    ))
}

/// Hub loop. Runs until `keep_running` is set to false.
fn run_hub(
    mut hub: RelayHub,
    rx: Receiver<InternalEvent>,
    keep_running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(poll_interval) {
            Ok(event) => {
                handle_event(&mut hub, event);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut hub, event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("hub stopping with {} open sessions", hub.session_count());
}

/// Dispatch a single event to the hub.
fn handle_event(hub: &mut RelayHub, event: InternalEvent) {
    match event {
        InternalEvent::Connected { id, peer, outbound } => {
            hub.on_connect(id, peer.to_string(), outbound);
        }
        InternalEvent::MessageFrom { id, raw } => {
            hub.on_message(id, &raw);
        }
        InternalEvent::Disconnected { id } => {
            hub.on_disconnect(id);
        }
    }
}

/// Accept connections and spawn a connection thread for each.
fn accept_loop(
    listener: TcpListener,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
    settings: ConnectionSettings,
) {
    // Non-blocking so the loop can check keep_running periodically.
    if let Err(e) = listener.set_nonblocking(true) {
        log::error!("websocket listener: {e}");
        return;
    }
    let mut next_id = 0u64;

    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let id = SessionId(next_id);
                next_id += 1;
                let tx = tx.clone();
                let keep_running = Arc::clone(&keep_running);
                thread::spawn(move || {
                    run_connection(stream, peer, id, tx, keep_running, settings);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(settings.poll_interval);
            }
            Err(e) => {
                log::warn!("accept failed: {e}");
                thread::sleep(settings.poll_interval);
            }
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    ClientClosed,
    /// The hub dropped the session; its outbound queue is gone.
    Evicted,
    Shutdown,
    Failed(tungstenite::Error),
}

/// A client socket shared by a session's reader and writer threads.
///
/// Reads go straight to this handle's clone of the socket. Writes go through
/// a lock shared by every clone and always hand the whole buffer to the
/// socket, so control replies from the reader (pong, close) and broadcasts
/// from the writer never interleave mid-frame.
#[derive(Debug)]
struct SessionStream {
    read: TcpStream,
    write: Arc<Mutex<TcpStream>>,
}

impl SessionStream {
    fn new(stream: TcpStream) -> io::Result<Self> {
        let write = stream.try_clone()?;
        Ok(Self {
            read: stream,
            write: Arc::new(Mutex::new(write)),
        })
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            read: self.read.try_clone()?,
            write: Arc::clone(&self.write),
        })
    }
}

impl Read for SessionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read.read(buf)
    }
}

impl Write for SessionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut socket = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        socket.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

/// One client connection, from handshake to close. Runs in its own thread
/// and spawns a writer thread once the session is open.
fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
    settings: ConnectionSettings,
) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
    let _ = stream.set_write_timeout(Some(settings.write_timeout));

    let stream = match SessionStream::new(stream) {
        Ok(stream) => stream,
        Err(e) => {
            log::debug!("{peer}: cannot share socket: {e}");
            return;
        }
    };
    let mut ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("handshake with {peer} failed: {e}");
            return;
        }
    };
    // Socket options are shared by every clone; only the reader reads.
    let _ = ws.get_ref().read.set_read_timeout(Some(settings.poll_interval));

    let writer_ws = match ws.get_ref().try_clone() {
        Ok(stream) => WebSocket::from_raw_socket(stream, Role::Server, None),
        Err(e) => {
            log::debug!("{peer}: cannot share socket: {e}");
            return;
        }
    };
    let (outbound, queue) = mpsc::sync_channel(settings.queue_depth);
    let alive = Arc::new(AtomicBool::new(true));
    let writer = {
        let alive = Arc::clone(&alive);
        let keep_running = Arc::clone(&keep_running);
        thread::Builder::new()
            .name(format!("{id}-writer"))
            .spawn(move || {
                let end = write_loop(writer_ws, &queue, &alive, &keep_running, settings);
                alive.store(false, Ordering::SeqCst);
                end
            })
    };
    let writer = match writer {
        Ok(writer) => writer,
        Err(e) => {
            log::warn!("{id}: cannot spawn writer thread: {e}");
            return;
        }
    };

    let read_end = if tx
        .send(InternalEvent::Connected { id, peer, outbound })
        .is_ok()
    {
        read_loop(&mut ws, id, &tx, &alive, &keep_running)
    } else {
        Some(SessionEnd::Shutdown)
    };
    alive.store(false, Ordering::SeqCst);
    let write_end = writer.join();

    let end = match (read_end, write_end) {
        (Some(end), _) | (None, Ok(end)) => end,
        (None, Err(_)) => SessionEnd::Evicted,
    };
    match &end {
        SessionEnd::Failed(e) => log::warn!("{id} dropped: {e}"),
        end => log::debug!("{id} ended: {end:?}"),
    }
    let _ = tx.send(InternalEvent::Disconnected { id });
    if !matches!(end, SessionEnd::Failed(_)) {
        let _ = ws.close(None);
        let _ = ws.flush();
    }
}

/// Inbound half: forward every frame to the hub. Returns `None` when the
/// writer stopped first, in which case its reason is the session's.
fn read_loop(
    ws: &mut WebSocket<SessionStream>,
    id: SessionId,
    tx: &Sender<InternalEvent>,
    alive: &AtomicBool,
    keep_running: &AtomicBool,
) -> Option<SessionEnd> {
    loop {
        if !keep_running.load(Ordering::SeqCst) {
            return Some(SessionEnd::Shutdown);
        }
        if !alive.load(Ordering::SeqCst) {
            return None;
        }

        let raw = match ws.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    log::debug!("{id}: ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => return Some(SessionEnd::ClientClosed),
            Ok(_) => continue,
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed) => return Some(SessionEnd::ClientClosed),
            Err(e) => return Some(SessionEnd::Failed(e)),
        };
        if tx.send(InternalEvent::MessageFrom { id, raw }).is_err() {
            return Some(SessionEnd::Shutdown);
        }
    }
}

/// Outbound half: write whatever the hub queues as soon as it arrives. A
/// write that fails or exceeds the write timeout ends the session; dropping
/// `queue` on return is what tells the hub to evict it.
fn write_loop(
    mut ws: WebSocket<SessionStream>,
    queue: &Receiver<String>,
    alive: &AtomicBool,
    keep_running: &AtomicBool,
    settings: ConnectionSettings,
) -> SessionEnd {
    loop {
        if !keep_running.load(Ordering::SeqCst) {
            return SessionEnd::Shutdown;
        }
        if !alive.load(Ordering::SeqCst) {
            return SessionEnd::ClientClosed;
        }
        match queue.recv_timeout(settings.poll_interval) {
            Ok(text) => {
                if let Err(e) = ws.write(Message::Text(text)) {
                    return SessionEnd::Failed(e);
                }
                // Batch whatever else is already queued into one flush.
                for text in queue.try_iter() {
                    if let Err(e) = ws.write(Message::Text(text)) {
                        return SessionEnd::Failed(e);
                    }
                }
                if let Err(e) = ws.flush() {
                    return SessionEnd::Failed(e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return SessionEnd::Evicted,
        }
    }
}
