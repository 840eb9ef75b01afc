// Read-only HTTP surface.
//
// Routes (GET only):
//   /state.txt         current state dump, `text/plain`
//   /s/                stored snapshot names, one per line
//   /s/<name>.preset   contents of one snapshot
//
// Snapshot names are percent-decoded. Everything else is 404; other methods
// get 405. Static control-panel files are served elsewhere. `route` is pure
// apart from reading the state and the snapshot directory, so the table is
// tested without a socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tiny_http::{Header, Method, Request, Response, Server};

use crate::error::SnapshotError;
use crate::snapshot::{SNAPSHOT_SUFFIX, SnapshotStore};
use crate::state::StateStore;

/// Path of the state dump.
pub const STATE_PATH: &str = "/state.txt";

/// Prefix under which snapshot files are served.
pub const SNAPSHOT_PREFIX: &str = "/s/";

/// Serve requests until `keep_running` is cleared.
pub fn serve(
    server: Server,
    state: Arc<StateStore>,
    snapshots: Arc<SnapshotStore>,
    keep_running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    while keep_running.load(Ordering::SeqCst) {
        match server.recv_timeout(poll_interval) {
            Ok(Some(request)) => respond(request, &state, &snapshots),
            Ok(None) => {}
            Err(e) => {
                log::error!("http server: {e}");
                break;
            }
        }
    }
}

fn respond(request: Request, state: &StateStore, snapshots: &SnapshotStore) {
    let (status, body) = route(request.method(), request.url(), state, snapshots);
    log::debug!("{} {} -> {status}", request.method(), request.url());

    let mut response = Response::from_string(body).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"text/plain"[..]) {
        response.add_header(header);
    }
    if let Err(e) = request.respond(response) {
        log::debug!("http response failed: {e}");
    }
}

/// Map a request to `(status, body)`.
pub fn route(
    method: &Method,
    url: &str,
    state: &StateStore,
    snapshots: &SnapshotStore,
) -> (u16, String) {
    if *method != Method::Get {
        return (405, "method not allowed\n".into());
    }
    let path = url.split(['?', '#']).next().unwrap_or_default();

    if path == STATE_PATH {
        return (200, state.dump_text());
    }
    if path == SNAPSHOT_PREFIX || path == "/s" {
        return match snapshots.list() {
            Ok(names) => (200, names.iter().map(|n| format!("{n}\n")).collect()),
            Err(e) => {
                log::warn!("listing snapshots: {e}");
                (500, "snapshot listing failed\n".into())
            }
        };
    }
    if let Some(file) = path.strip_prefix(SNAPSHOT_PREFIX) {
        let Some(file) = percent_decode(file) else {
            return not_found();
        };
        let Some(name) = file.strip_suffix(SNAPSHOT_SUFFIX) else {
            return not_found();
        };
        return match snapshots.load(name) {
            Ok(text) => (200, text),
            Err(SnapshotError::NotFound(_) | SnapshotError::InvalidName(_)) => not_found(),
            Err(e) => {
                log::warn!("loading snapshot: {e}");
                (500, "snapshot read failed\n".into())
            }
        };
    }
    not_found()
}

fn not_found() -> (u16, String) {
    (404, "not found\n".into())
}

/// Decode `%XX` escapes in a URL path segment. `None` for a malformed escape
/// or a result that is not UTF-8.
fn percent_decode(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
