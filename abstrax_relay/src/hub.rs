// Relay hub: session set, state merging, and fan-out.
//
// `RelayHub` is the central data structure that `server.rs` drives. It owns
// the set of open control sessions and the configured protocol sinks, and it
// is the only writer of the shared `StateStore`. All mutation happens through
// methods called from the server's single-threaded hub loop, so merges are
// applied in arrival order and each one is followed by its broadcast and
// forward before the next message is looked at. No internal locking beyond
// the `StateStore`'s own lock, which exists for the HTTP reader thread.
//
// Message handling:
// - `save:<name>` persists a snapshot of the current state. The name is
//   sanitized here; the dump is taken here; the file write happens on the
//   snapshot writer thread. Only the requesting session hears about the
//   outcome (`saved:<name>` or `savefailed:<name>`). Nothing is broadcast or
//   forwarded.
// - Anything else is a state delta: decode, merge, then propagate the raw
//   text unmodified to every other open session and to every sink.
//
// Writing to sessions: each session has a bounded outbound queue drained by
// its own writer thread. When a queue is full the hub waits for that writer
// to make room. The writer either keeps draining or, when its socket stalls
// past the write timeout, exits, so the wait is bounded. A session whose
// writer has exited is evicted once the current broadcast has visited every
// other recipient. Queue depth alone never evicts anyone.
//
// New sessions start blank; the hub does not push the current state on
// connect. Clients that want it read `/state.txt`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{SyncSender, TrySendError};

use abstrax_protocol::codec::{
    self, ClientRequest, SAVE_FAILED_ACK_PREFIX, SAVED_ACK_PREFIX, parse_request,
};
use abstrax_protocol::types::SessionId;

use crate::snapshot::{SaveJob, SnapshotWriter, sanitize_name};
use crate::sink::ProtocolSink;
use crate::state::StateStore;

/// Relay state for all connected control clients.
pub struct RelayHub {
    state: Arc<StateStore>,
    sessions: BTreeMap<SessionId, SessionState>,
    sinks: Vec<Box<dyn ProtocolSink>>,
    snapshots: SnapshotWriter,
}

struct SessionState {
    peer: String,
    outbound: SyncSender<String>,
}

impl RelayHub {
    pub fn new(
        state: Arc<StateStore>,
        snapshots: SnapshotWriter,
        sinks: Vec<Box<dyn ProtocolSink>>,
    ) -> Self {
        Self {
            state,
            sessions: BTreeMap::new(),
            sinks,
            snapshots,
        }
    }

    /// Register an open session. `outbound` feeds its connection thread.
    pub fn on_connect(&mut self, id: SessionId, peer: String, outbound: SyncSender<String>) {
        log::info!("{id} connected from {peer}");
        if let Some(old) = self.sessions.insert(id, SessionState { peer, outbound }) {
            log::warn!("{id} re-registered, replacing session from {}", old.peer);
        }
    }

    /// Handle one raw message from `id`. Messages from sessions that are
    /// not (or no longer) open are ignored.
    pub fn on_message(&mut self, id: SessionId, raw: &str) {
        if !self.sessions.contains_key(&id) {
            log::debug!("ignoring message from closed {id}");
            return;
        }
        match parse_request(raw) {
            ClientRequest::Save { name } => self.save(id, name),
            ClientRequest::Update { raw } => self.apply_update(id, raw),
        }
    }

    /// Deregister a session. Anything still queued for it is dropped.
    pub fn on_disconnect(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.remove(&id) {
            log::info!("{id} from {} disconnected", session.peer);
        }
    }

    /// The full state in wire encoding.
    pub fn dump_as_text(&self) -> String {
        self.state.dump_text()
    }

    /// Returns the number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_open(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Merge a delta, then broadcast and forward the raw text.
    fn apply_update(&mut self, from: SessionId, raw: &str) {
        self.state.merge(codec::decode(raw));
        log::debug!("{from}: {raw}");
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("state: {}", self.state.dump_text());
        }

        self.broadcast_except(from, raw);
        for sink in &mut self.sinks {
            sink.forward(raw);
        }
    }

    fn save(&mut self, from: SessionId, name: &str) {
        let name = match sanitize_name(name) {
            Ok(name) => name,
            Err(e) => {
                log::warn!("{from}: {e}");
                self.send_to(from, SAVE_FAILED_ACK_PREFIX.to_owned());
                return;
            }
        };
        let Some(session) = self.sessions.get(&from) else {
            return;
        };

        let mut contents = self.state.dump_text();
        contents.push('\n');

        let outbound = session.outbound.clone();
        let ack_name = name.clone();
        log::info!("{from}: saving snapshot {name:?}");
        self.snapshots.submit(SaveJob {
            name,
            contents,
            on_done: Box::new(move |result| {
                let ack = match result {
                    Ok(_) => format!("{SAVED_ACK_PREFIX}{ack_name}"),
                    Err(_) => format!("{SAVE_FAILED_ACK_PREFIX}{ack_name}"),
                };
                // The session may have gone away while the write ran.
                let _ = outbound.send(ack);
            }),
        });
    }

    /// Send to one session, evicting it if its writer is gone.
    fn send_to(&mut self, id: SessionId, msg: String) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        if !deliver(id, &session.outbound, msg) {
            self.evict(id);
        }
    }

    /// Queue `raw` for every open session except `sender`.
    fn broadcast_except(&mut self, sender: SessionId, raw: &str) {
        let mut failed = Vec::new();
        for (&id, session) in &self.sessions {
            if id != sender && !deliver(id, &session.outbound, raw.to_owned()) {
                failed.push(id);
            }
        }
        for id in failed {
            self.evict(id);
        }
    }

    fn evict(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.remove(&id) {
            log::debug!("dropping {id} from {}: connection closed", session.peer);
        }
    }
}

/// Queue `msg`, waiting for room if the queue is full. Returns false once
/// the session's writer has gone away.
fn deliver(id: SessionId, outbound: &SyncSender<String>, msg: String) -> bool {
    match outbound.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            log::debug!("{id}: outbound queue full, waiting for writer");
            outbound.send(msg).is_ok()
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::snapshot::SnapshotStore;

    /// Sink that records every forwarded update.
    #[derive(Clone, Default)]
    struct RecordingSink {
        forwarded: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.forwarded.lock().unwrap())
        }
    }

    impl ProtocolSink for RecordingSink {
        fn forward(&mut self, raw: &str) {
            self.forwarded.lock().unwrap().push(raw.to_owned());
        }

        fn describe(&self) -> String {
            "recording".into()
        }
    }

    struct Fixture {
        hub: RelayHub,
        state: Arc<StateStore>,
        sink: RecordingSink,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path()));
        let writer = SnapshotWriter::spawn(store).unwrap();
        let state = Arc::new(StateStore::new());
        let sink = RecordingSink::default();
        let hub = RelayHub::new(Arc::clone(&state), writer, vec![Box::new(sink.clone())]);
        Fixture {
            hub,
            state,
            sink,
            dir,
        }
    }

    fn connect(hub: &mut RelayHub, id: u64, depth: usize) -> Receiver<String> {
        let (tx, rx) = mpsc::sync_channel(depth);
        hub.on_connect(SessionId(id), format!("peer-{id}"), tx);
        rx
    }

    fn drain(rx: &Receiver<String>) -> Vec<String> {
        rx.try_iter().collect()
    }

    #[test]
    fn update_broadcasts_raw_to_others_only() {
        let mut f = fixture();
        let a = connect(&mut f.hub, 0, 8);
        let b = connect(&mut f.hub, 1, 8);
        let c = connect(&mut f.hub, 2, 8);

        f.hub.on_message(SessionId(0), "x:100 y:200");

        assert!(drain(&a).is_empty());
        assert_eq!(drain(&b), vec!["x:100 y:200"]);
        assert_eq!(drain(&c), vec!["x:100 y:200"]);
        assert_eq!(f.hub.dump_as_text(), "x:100 y:200");
    }

    #[test]
    fn raw_text_propagates_unmodified() {
        let mut f = fixture();
        let _a = connect(&mut f.hub, 0, 8);
        let b = connect(&mut f.hub, 1, 8);

        let quirky = "y:2  x:1 junk x:3";
        f.hub.on_message(SessionId(0), quirky);

        assert_eq!(drain(&b), vec![quirky]);
        assert_eq!(f.sink.take(), vec![quirky]);
        assert_eq!(f.state.dump_text(), "x:3 y:2");
    }

    #[test]
    fn update_forwarded_to_every_sink() {
        let dir = TempDir::new().unwrap();
        let writer =
            SnapshotWriter::spawn(Arc::new(SnapshotStore::new(dir.path()))).unwrap();
        let s1 = RecordingSink::default();
        let s2 = RecordingSink::default();
        let mut hub = RelayHub::new(
            Arc::new(StateStore::new()),
            writer,
            vec![Box::new(s1.clone()), Box::new(s2.clone())],
        );
        let _a = connect(&mut hub, 0, 8);

        hub.on_message(SessionId(0), "r:1");
        hub.on_message(SessionId(0), "g:2");

        assert_eq!(s1.take(), vec!["r:1", "g:2"]);
        assert_eq!(s2.take(), vec!["r:1", "g:2"]);
    }

    #[test]
    fn single_session_still_forwards() {
        let mut f = fixture();
        let a = connect(&mut f.hub, 0, 8);
        f.hub.on_message(SessionId(0), "mode:3");
        assert!(drain(&a).is_empty());
        assert_eq!(f.sink.take(), vec!["mode:3"]);
    }

    #[test]
    fn new_session_starts_blank() {
        let mut f = fixture();
        let _a = connect(&mut f.hub, 0, 8);
        f.hub.on_message(SessionId(0), "x:1");
        let late = connect(&mut f.hub, 1, 8);
        assert!(drain(&late).is_empty());
    }

    #[test]
    fn message_from_closed_session_ignored() {
        let mut f = fixture();
        let _a = connect(&mut f.hub, 0, 8);
        let b = connect(&mut f.hub, 1, 8);
        f.hub.on_disconnect(SessionId(0));

        f.hub.on_message(SessionId(0), "x:1");
        f.hub.on_message(SessionId(9), "y:1");

        assert!(drain(&b).is_empty());
        assert!(f.sink.take().is_empty());
        assert_eq!(f.hub.dump_as_text(), "");
        assert_eq!(f.hub.session_count(), 1);
    }

    #[test]
    fn disconnect_does_not_touch_state() {
        let mut f = fixture();
        let _a = connect(&mut f.hub, 0, 8);
        f.hub.on_message(SessionId(0), "x:1");
        f.hub.on_disconnect(SessionId(0));
        f.hub.on_disconnect(SessionId(0));
        assert_eq!(f.hub.dump_as_text(), "x:1");
        assert!(!f.hub.is_open(SessionId(0)));
    }

    #[test]
    fn dead_session_evicted_without_skipping_others() {
        let mut f = fixture();
        let _a = connect(&mut f.hub, 0, 8);
        let b = connect(&mut f.hub, 1, 8);
        let c = connect(&mut f.hub, 2, 8);
        let d = connect(&mut f.hub, 3, 8);
        drop(b);

        f.hub.on_message(SessionId(0), "x:1");

        assert_eq!(drain(&c), vec!["x:1"]);
        assert_eq!(drain(&d), vec!["x:1"]);
        assert!(!f.hub.is_open(SessionId(1)));
        assert_eq!(f.hub.session_count(), 3);
    }

    #[test]
    fn full_queue_waits_for_draining_writer() {
        let mut f = fixture();
        let _a = connect(&mut f.hub, 0, 8);
        let slow = connect(&mut f.hub, 1, 2);
        let fast = connect(&mut f.hub, 2, 64);

        let writer = thread::spawn(move || {
            let mut written = Vec::new();
            while let Ok(msg) = slow.recv_timeout(Duration::from_secs(5)) {
                written.push(msg);
                thread::sleep(Duration::from_millis(1));
            }
            written
        });
        for i in 0..40 {
            f.hub.on_message(SessionId(0), &format!("x:{i}"));
        }

        let expected: Vec<String> = (0..40).map(|i| format!("x:{i}")).collect();
        assert!(f.hub.is_open(SessionId(1)));
        assert_eq!(drain(&fast), expected);
        f.hub.on_disconnect(SessionId(1));
        assert_eq!(writer.join().unwrap(), expected);
    }

    #[test]
    fn session_evicted_once_writer_exits() {
        let mut f = fixture();
        let _a = connect(&mut f.hub, 0, 8);
        let stuck = connect(&mut f.hub, 1, 2);
        let fast = connect(&mut f.hub, 2, 8);

        f.hub.on_message(SessionId(0), "x:1");
        f.hub.on_message(SessionId(0), "x:2");
        assert!(f.hub.is_open(SessionId(1)));

        // The queue is full; the hub waits until the writer gives up.
        let gives_up = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(stuck);
        });
        f.hub.on_message(SessionId(0), "x:3");
        gives_up.join().unwrap();

        assert!(!f.hub.is_open(SessionId(1)));
        assert_eq!(drain(&fast), vec!["x:1", "x:2", "x:3"]);
        f.hub.on_message(SessionId(0), "x:4");
        assert_eq!(drain(&fast), vec!["x:4"]);
    }

    #[test]
    fn concurrent_senders_see_each_other_once() {
        let mut f = fixture();
        let a = connect(&mut f.hub, 0, 8);
        let b = connect(&mut f.hub, 1, 8);

        f.hub.on_message(SessionId(0), "x:1");
        f.hub.on_message(SessionId(1), "y:2");

        assert_eq!(drain(&a), vec!["y:2"]);
        assert_eq!(drain(&b), vec!["x:1"]);
        assert_eq!(f.hub.dump_as_text(), "x:1 y:2");
    }

    #[test]
    fn save_persists_dump_and_acks_sender_only() {
        let mut f = fixture();
        let a = connect(&mut f.hub, 0, 8);
        let b = connect(&mut f.hub, 1, 8);
        f.hub.on_message(SessionId(1), "x:100 y:200");
        let expected = format!("{}\n", f.hub.dump_as_text());
        drain(&a);

        f.hub.on_message(SessionId(0), "save:My Show");

        let ack = a.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ack, "saved:My Show");
        let contents = fs::read_to_string(f.dir.path().join("My Show.preset")).unwrap();
        assert_eq!(contents, expected);

        assert!(drain(&b).is_empty());
        assert_eq!(f.sink.take(), vec!["x:100 y:200"]);
        assert_eq!(f.hub.dump_as_text(), "x:100 y:200");
    }

    #[test]
    fn save_uses_state_at_request_time() {
        let mut f = fixture();
        let a = connect(&mut f.hub, 0, 8);
        f.hub.on_message(SessionId(0), "x:1");
        f.hub.on_message(SessionId(0), "save:before");
        f.hub.on_message(SessionId(0), "x:2");

        assert_eq!(
            a.recv_timeout(Duration::from_secs(5)).unwrap(),
            "saved:before"
        );
        let contents = fs::read_to_string(f.dir.path().join("before.preset")).unwrap();
        assert_eq!(contents, "x:1\n");
    }

    #[test]
    fn save_sanitizes_name() {
        let mut f = fixture();
        let a = connect(&mut f.hub, 0, 8);
        f.hub.on_message(SessionId(0), "save:a/b*c.preset!!");
        assert_eq!(
            a.recv_timeout(Duration::from_secs(5)).unwrap(),
            "saved:abc.preset"
        );
        assert!(f.dir.path().join("abc.preset.preset").is_file());
    }

    #[test]
    fn save_with_invalid_name_writes_nothing() {
        let mut f = fixture();
        let a = connect(&mut f.hub, 0, 8);
        f.hub.on_message(SessionId(0), "x:1");
        f.hub.on_message(SessionId(0), "save:***");

        assert_eq!(drain(&a), vec!["savefailed:"]);
        assert_eq!(fs::read_dir(f.dir.path()).unwrap().count(), 0);
        assert_eq!(f.hub.dump_as_text(), "x:1");
    }

    #[test]
    fn persistence_failure_reported_to_requester() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("presets");
        fs::write(&blocker, "file, not a directory").unwrap();
        let writer = SnapshotWriter::spawn(Arc::new(SnapshotStore::new(&blocker))).unwrap();
        let mut hub = RelayHub::new(Arc::new(StateStore::new()), writer, Vec::new());
        let a = connect(&mut hub, 0, 8);
        let b = connect(&mut hub, 1, 8);

        hub.on_message(SessionId(0), "save:show");
        assert_eq!(
            a.recv_timeout(Duration::from_secs(5)).unwrap(),
            "savefailed:show"
        );
        assert!(drain(&b).is_empty());

        // The relay keeps working.
        hub.on_message(SessionId(1), "x:1");
        assert_eq!(drain(&a), vec!["x:1"]);
    }
}
