use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SUMMARY_LIMIT: usize = 10;
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    ".quill",
];
const IGNORED_SUFFIXES: &[&str] = &[".pyc", ".swp", ".tmp", "~"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "+",
            Self::Modified => "~",
            Self::Deleted => "-",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    modified: Option<SystemTime>,
    size: u64,
}

#[derive(Default)]
struct WatchState {
    roots: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Snapshot>,
    // Changes seen by the poll thread that nobody has asked for yet.
    pending: Vec<FileChange>,
}

/// Polling watcher comparing mtime and size snapshots.
#[derive(Default)]
pub struct FileWatcher {
    state: Arc<Mutex<WatchState>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FileWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file or directory and record its current state as the baseline.
    pub fn watch(&self, path: &Path) {
        let root = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut state = lock(&self.state);
        for (file, snapshot) in scan(&root) {
            state.files.entry(file).or_insert(snapshot);
        }
        state.roots.insert(root);
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        lock(&self.state).roots.iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background poll thread. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                {
                    let mut state = lock(&state);
                    let changes = check(&mut state);
                    state.pending.extend(changes);
                }
                thread::sleep(POLL_INTERVAL);
            }
        });
        *lock(&self.thread) = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }

    /// Changes since the last call, including any the poll thread collected.
    pub fn check_once(&self) -> Vec<FileChange> {
        let mut state = lock(&self.state);
        let mut changes = std::mem::take(&mut state.pending);
        changes.extend(check(&mut state));
        changes
    }

    pub fn summary(&self) -> String {
        summarize(&self.check_once())
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn summarize(changes: &[FileChange]) -> String {
    if changes.is_empty() {
        return "No file changes detected.".to_string();
    }
    let mut lines = vec![format!("{} file(s) changed:", changes.len())];
    for change in changes.iter().take(SUMMARY_LIMIT) {
        lines.push(format!("  {} {}", change.kind, change.path.display()));
    }
    if changes.len() > SUMMARY_LIMIT {
        lines.push(format!("  ... and {} more", changes.len() - SUMMARY_LIMIT));
    }
    lines.join("\n")
}

fn check(state: &mut WatchState) -> Vec<FileChange> {
    let mut current = BTreeMap::new();
    for root in &state.roots {
        current.extend(scan(root));
    }
    let mut changes = Vec::new();
    for (path, snapshot) in &current {
        match state.files.get(path) {
            None => changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Created,
            }),
            Some(previous) if previous != snapshot => changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Modified,
            }),
            Some(_) => {}
        }
    }
    for path in state.files.keys() {
        if !current.contains_key(path) {
            changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Deleted,
            });
        }
    }
    state.files = current;
    changes
}

fn scan(root: &Path) -> Vec<(PathBuf, Snapshot)> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !IGNORED_DIRS.iter().any(|d| entry.file_name() == *d)
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            !IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        })
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some((
                entry.into_path(),
                Snapshot {
                    modified: meta.modified().ok(),
                    size: meta.len(),
                },
            ))
        })
        .collect()
}
