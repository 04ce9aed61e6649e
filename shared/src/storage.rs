//! Durable storage boundary for recording logs
//!
//! The recording writer thread is the only caller of the write half, so the
//! locks inside the implementations are never contended on the hot path.

use log::debug;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const RECORDING_EXTENSION: &str = "jsonl";
pub const DEFAULT_RECORDING_DIR: &str = "recordings";

/// Line-oriented append log storage
pub trait RecordingStorage: Send + Sync {
    fn open_writer(&self, path: &Path) -> io::Result<()>;
    fn write_line(&self, line: &str) -> io::Result<()>;
    fn close_writer(&self) -> io::Result<()>;
    fn read_lines(&self, path: &Path) -> io::Result<Vec<String>>;
    /// Recordings known to this storage, oldest first
    fn list_recordings(&self) -> io::Result<Vec<PathBuf>>;
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "storage lock poisoned"))
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "recording writer is not open")
}

/// Stores each recording as a `.jsonl` file under a root directory
pub struct FileRecordingStorage {
    root: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileRecordingStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for FileRecordingStorage {
    fn default() -> Self {
        Self::new(DEFAULT_RECORDING_DIR)
    }
}

impl RecordingStorage for FileRecordingStorage {
    fn open_writer(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        debug!("Opened recording file {}", path.display());
        *lock(&self.writer)? = Some(BufWriter::new(file));
        Ok(())
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = lock(&self.writer)?;
        let writer = guard.as_mut().ok_or_else(not_open)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    fn close_writer(&self) -> io::Result<()> {
        match lock(&self.writer)?.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    fn read_lines(&self, path: &Path) -> io::Result<Vec<String>> {
        let reader = BufReader::new(File::open(path)?);
        reader.lines().collect()
    }

    fn list_recordings(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORDING_EXTENSION) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            files.push((modified, path));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }
}

/// In-memory storage, handy for tests and for piping recordings elsewhere
#[derive(Default)]
pub struct MemoryRecordingStorage {
    files: Mutex<BTreeMap<PathBuf, Vec<String>>>,
    current: Mutex<Option<PathBuf>>,
    write_limit: Option<usize>,
}

impl MemoryRecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose writes start failing after `limit` lines
    pub fn with_write_limit(limit: usize) -> Self {
        Self {
            write_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn insert(&self, path: impl Into<PathBuf>, lines: Vec<String>) -> io::Result<()> {
        lock(&self.files)?.insert(path.into(), lines);
        Ok(())
    }

    /// Lines written so far to `path`
    pub fn lines(&self, path: &Path) -> Vec<String> {
        lock(&self.files)
            .ok()
            .and_then(|files| files.get(path).cloned())
            .unwrap_or_default()
    }

    pub fn is_writer_open(&self) -> bool {
        lock(&self.current).map(|c| c.is_some()).unwrap_or(false)
    }
}

impl RecordingStorage for MemoryRecordingStorage {
    fn open_writer(&self, path: &Path) -> io::Result<()> {
        lock(&self.files)?.insert(path.to_path_buf(), Vec::new());
        *lock(&self.current)? = Some(path.to_path_buf());
        Ok(())
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let current = lock(&self.current)?.clone().ok_or_else(not_open)?;
        let mut files = lock(&self.files)?;
        let lines = files.entry(current).or_default();
        if let Some(limit) = self.write_limit {
            if lines.len() >= limit {
                return Err(io::Error::new(io::ErrorKind::Other, "storage full"));
            }
        }
        lines.push(line.to_string());
        Ok(())
    }

    fn close_writer(&self) -> io::Result<()> {
        lock(&self.current)?.take();
        Ok(())
    }

    fn read_lines(&self, path: &Path) -> io::Result<Vec<String>> {
        lock(&self.files)?
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such recording"))
    }

    fn list_recordings(&self) -> io::Result<Vec<PathBuf>> {
        Ok(lock(&self.files)?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("relay-storage-{}-{}", name, nanos))
    }

    #[test]
    fn test_file_storage_write_and_read() {
        let dir = scratch_dir("rw");
        let storage = FileRecordingStorage::new(&dir);
        let path = dir.join("session_1.jsonl");

        storage.open_writer(&path).unwrap();
        storage.write_line("first").unwrap();
        storage.write_line("second").unwrap();
        storage.close_writer().unwrap();

        let lines = storage.read_lines(&path).unwrap();
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);

        let listed = storage.list_recordings().unwrap();
        assert_eq!(listed, vec![path]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_storage_write_without_open_fails() {
        let storage = FileRecordingStorage::new(scratch_dir("closed"));
        let err = storage.write_line("orphan").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        // Closing twice is harmless
        storage.close_writer().unwrap();
        storage.close_writer().unwrap();
    }

    #[test]
    fn test_file_storage_lists_only_recordings() {
        let dir = scratch_dir("list");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("notes.txt"), "ignore me").unwrap();
        fs::write(dir.join("a.jsonl"), "{}\n").unwrap();

        let storage = FileRecordingStorage::new(&dir);
        let listed = storage.list_recordings().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ends_with("a.jsonl"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_storage_missing_root_lists_nothing() {
        let storage = FileRecordingStorage::new(scratch_dir("missing"));
        assert!(storage.list_recordings().unwrap().is_empty());
    }

    #[test]
    fn test_memory_storage_lifecycle() {
        let storage = MemoryRecordingStorage::new();
        let path = Path::new("mem/session.jsonl");

        storage.open_writer(path).unwrap();
        assert!(storage.is_writer_open());
        storage.write_line("a").unwrap();
        storage.close_writer().unwrap();
        assert!(!storage.is_writer_open());

        assert_eq!(storage.read_lines(path).unwrap(), vec!["a".to_string()]);
        assert_eq!(storage.list_recordings().unwrap(), vec![path.to_path_buf()]);
        assert!(storage.read_lines(Path::new("missing")).is_err());
    }

    #[test]
    fn test_memory_storage_write_limit() {
        let storage = MemoryRecordingStorage::with_write_limit(1);
        let path = Path::new("limited.jsonl");
        storage.open_writer(path).unwrap();
        storage.write_line("ok").unwrap();
        assert!(storage.write_line("too many").is_err());
        assert_eq!(storage.lines(path).len(), 1);
    }
}
