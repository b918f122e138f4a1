//! Destinations for reassembled files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use trellis_common::helpers::{free_path, safe_file_name};

/// Persists a completed file. Called from a blocking task.
pub trait FileSink: Send + Sync {
    fn write(&self, name: &str, data: &[u8]) -> io::Result<PathBuf>;
}

/// Writes files into one directory, never overwriting existing files.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FileSink for DirectorySink {
    fn write(&self, name: &str, data: &[u8]) -> io::Result<PathBuf> {
        let name = safe_file_name(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid filename {name:?}"))
        })?;
        std::fs::create_dir_all(&self.dir)?;
        let path = free_path(&self.dir.join(name));
        std::fs::write(&path, data)?;
        Ok(path)
    }
}

/// Keeps files in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    files: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FileSink for MemorySink {
    fn write(&self, name: &str, data: &[u8]) -> io::Result<PathBuf> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), data.to_vec()));
        Ok(PathBuf::from(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::helpers::now_millis;

    #[test]
    fn directory_sink_writes_sanitized_unique_files() {
        let dir = std::env::temp_dir().join(format!("trellis-sink-{}", now_millis()));
        let sink = DirectorySink::new(&dir);

        let first = sink.write("../recv_alice_1", b"one").unwrap();
        let second = sink.write("recv_alice_1", b"two").unwrap();

        assert_eq!(first, dir.join("recv_alice_1"));
        assert_eq!(second, dir.join("recv_alice_1-1"));
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn memory_sink_records_writes() {
        let sink = MemorySink::new();
        sink.write("f", b"data").unwrap();
        assert_eq!(sink.files(), vec![("f".to_string(), b"data".to_vec())]);
    }
}
