//! Durable storage for `{current_term, voted_for}`, the log, and the last
//! known commit index. The node is the only caller and writes synchronously
//! while holding its state lock.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core_types::LogEntry;
use crate::{LogIndex, NodeId, Term};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    #[serde(default)]
    pub commit_index: LogIndex,
}

pub trait DurableStore: Send {
    fn load_state(&self) -> io::Result<HardState>;

    fn save_state(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()>;

    fn save_commit_index(&mut self, commit_index: LogIndex) -> io::Result<()>;

    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// Replaces the persisted log with `entries`.
    fn save_log(&mut self, entries: &[LogEntry]) -> io::Result<()>;
}

/// JSON files under a data directory:
/// - `node-<id>-state.json`: term, vote and commit index
/// - `node-<id>-log.json`: the full entry sequence
pub struct FileStore {
    state_path: PathBuf,
    log_path: PathBuf,
    hard_state: HardState,
}

#[derive(Serialize, Deserialize, Default)]
struct LogFile {
    entries: Vec<LogEntry>,
}

impl FileStore {
    /// Opens (creating the directory if needed) the store for node `id`.
    pub fn open(dir: impl AsRef<Path>, id: NodeId) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut store = FileStore {
            state_path: dir.join(format!("node-{}-state.json", id)),
            log_path: dir.join(format!("node-{}-log.json", id)),
            hard_state: HardState::default(),
        };
        store.hard_state = store.load_state()?;
        Ok(store)
    }

    fn write_state(&mut self, next: HardState) -> io::Result<()> {
        write_json_atomically(&self.state_path, &next)?;
        self.hard_state = next;
        Ok(())
    }
}

/// Write to a sibling temp file, fsync, rename over the target, then fsync
/// the directory so the rename itself survives a crash.
fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    sync_dir(path)
}

fn sync_dir(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

fn read_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> io::Result<T> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e),
    }
}

impl DurableStore for FileStore {
    fn load_state(&self) -> io::Result<HardState> {
        read_json_or_default(&self.state_path)
    }

    fn save_state(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        self.write_state(HardState {
            current_term: term,
            voted_for,
            ..self.hard_state
        })
    }

    fn save_commit_index(&mut self, commit_index: LogIndex) -> io::Result<()> {
        self.write_state(HardState {
            commit_index,
            ..self.hard_state
        })
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        let file: LogFile = read_json_or_default(&self.log_path)?;
        Ok(file.entries)
    }

    fn save_log(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let file = LogFile {
            entries: entries.to_vec(),
        };
        write_json_atomically(&self.log_path, &file)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: HardState,
    log: Vec<LogEntry>,
    fail_writes: bool,
    writes: usize,
}

/// In-process store. Clones share the same contents, so a test can keep a
/// handle to inspect what the node persisted or make writes fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(state: HardState, log: Vec<LogEntry>) -> Self {
        let store = Self::default();
        {
            let mut inner = store.lock();
            inner.state = state;
            inner.log = log;
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A panic while holding this lock can only come from a test.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn hard_state(&self) -> HardState {
        self.lock().state
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.lock().log.clone()
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    fn write(&self, f: impl FnOnce(&mut MemoryInner)) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        f(&mut inner);
        inner.writes += 1;
        Ok(())
    }
}

impl DurableStore for MemoryStore {
    fn load_state(&self) -> io::Result<HardState> {
        Ok(self.lock().state)
    }

    fn save_state(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        self.write(|inner| {
            inner.state.current_term = term;
            inner.state.voted_for = voted_for;
        })
    }

    fn save_commit_index(&mut self, commit_index: LogIndex) -> io::Result<()> {
        self.write(|inner| inner.state.commit_index = commit_index)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.lock().log.clone())
    }

    fn save_log(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.write(|inner| inner.log = entries.to_vec())
    }
}
