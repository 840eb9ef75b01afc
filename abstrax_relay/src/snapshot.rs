// Named snapshots of the control state.
//
// A snapshot is the encoded full dump plus a trailing newline, stored as
// `<dir>/<name>.preset`. Names are sanitized by dropping every character
// outside `[A-Za-z0-9. ]`; a name with nothing left is rejected before any
// file is touched. Because the suffix is always appended and `/` never
// survives sanitization, a name cannot escape the snapshot directory.
//
// Writes are atomic for readers: contents go to a hidden temp file in the
// same directory, are synced, and then renamed over the target. A second
// save under the same name replaces the file wholesale.
//
// `SnapshotWriter` runs saves on a dedicated thread so the hub loop never
// waits on disk I/O. Each job carries a completion callback; the hub uses it
// to acknowledge the requesting session.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use abstrax_protocol::codec;

use crate::error::SnapshotError;
use crate::state::State;

/// File suffix of every snapshot.
pub const SNAPSHOT_SUFFIX: &str = ".preset";

/// Strip disallowed characters from an operator-supplied name.
pub fn sanitize_name(name: &str) -> Result<String, SnapshotError> {
    let clean: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == ' ')
        .collect();
    if clean.is_empty() {
        return Err(SnapshotError::InvalidName(name.to_owned()));
    }
    Ok(clean)
}

/// Snapshot files in a single flat directory.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    temp_counter: AtomicU64,
}

impl SnapshotStore {
    /// The directory is created on first save if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Path of the snapshot file for an already-sanitized name.
    pub fn path_for(&self, sanitized: &str) -> PathBuf {
        self.dir.join(format!("{sanitized}{SNAPSHOT_SUFFIX}"))
    }

    /// Persist `state` under `name`. Returns the written path.
    pub fn save(&self, name: &str, state: &State) -> Result<PathBuf, SnapshotError> {
        self.save_text(name, &snapshot_contents(state))
    }

    /// Persist pre-encoded snapshot contents under `name`.
    pub fn save_text(&self, name: &str, contents: &str) -> Result<PathBuf, SnapshotError> {
        let sanitized = sanitize_name(name)?;
        let target = self.path_for(&sanitized);
        self.write_atomic(&sanitized, &target, contents)
            .map_err(|source| SnapshotError::Persistence {
                name: sanitized,
                source,
            })?;
        Ok(target)
    }

    /// Read a snapshot's contents.
    pub fn load(&self, name: &str) -> Result<String, SnapshotError> {
        let sanitized = sanitize_name(name)?;
        match fs::read_to_string(self.path_for(&sanitized)) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SnapshotError::NotFound(sanitized))
            }
            Err(source) => Err(SnapshotError::Persistence {
                name: sanitized,
                source,
            }),
        }
    }

    /// Names of all stored snapshots (without suffix), sorted.
    pub fn list(&self) -> Result<Vec<String>, SnapshotError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SnapshotError::Persistence {
                    name: String::new(),
                    source,
                });
            }
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(name) = file_name.strip_suffix(SNAPSHOT_SUFFIX) else {
                continue;
            };
            if !name.is_empty() && entry.file_type().is_ok_and(|t| t.is_file()) {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn write_atomic(&self, sanitized: &str, target: &Path, contents: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .dir
            .join(format!(".{sanitized}.{}.{n}.tmp", std::process::id()));

        let result = (|| {
            let mut file = fs::File::create(&temp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp, target)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }
}

/// Encoded snapshot file contents for `state`.
pub fn snapshot_contents(state: &State) -> String {
    let mut text = codec::encode(state);
    text.push('\n');
    text
}

/// Completion callback for a background save.
pub type SaveCallback = Box<dyn FnOnce(Result<PathBuf, SnapshotError>) + Send>;

/// A save request for the writer thread.
pub struct SaveJob {
    pub name: String,
    pub contents: String,
    pub on_done: SaveCallback,
}

/// Background thread that performs snapshot writes in submission order.
pub struct SnapshotWriter {
    tx: Option<Sender<SaveJob>>,
    thread: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn spawn(store: Arc<SnapshotStore>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<SaveJob>();
        let thread = thread::Builder::new()
            .name("snapshot-writer".into())
            .spawn(move || {
                for job in rx {
                    let result = store.save_text(&job.name, &job.contents);
                    match &result {
                        Ok(path) => log::info!("saved snapshot to {}", path.display()),
                        Err(e) => log::warn!("snapshot save failed: {e}"),
                    }
                    (job.on_done)(result);
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Queue a save. If the writer thread is gone the job completes
    /// immediately with a persistence error.
    pub fn submit(&self, job: SaveJob) {
        let Some(tx) = &self.tx else {
            fail_job(job);
            return;
        };
        if let Err(mpsc::SendError(job)) = tx.send(job) {
            fail_job(job);
        }
    }
}

fn fail_job(job: SaveJob) {
    let source = io::Error::other("snapshot writer stopped");
    (job.on_done)(Err(SnapshotError::Persistence {
        name: job.name,
        source,
    }));
}

impl Drop for SnapshotWriter {
    /// Finish queued writes before returning.
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
