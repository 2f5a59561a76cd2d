//! Storage the recorder persists into.
//!
//! The worker only needs "create a file by name" plus a blocking
//! write/seek/sync handle. [`FsStorage`] maps names onto a directory;
//! [`memory::MemoryStorage`] keeps files in memory and can inject failures.

pub mod memory;
pub mod wav;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};

/// A writable, seekable recording target.
pub trait StorageFile: Write + Seek + Send {
    /// Push written data to stable storage.
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl StorageFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Creates (or truncates) recording files by name.
pub trait RecordingStorage: Send {
    fn create(&mut self, name: &str) -> io::Result<Box<dyn StorageFile>>;
}

/// Files on the local filesystem, relative names resolved against `root`.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl RecordingStorage for FsStorage {
    fn create(&mut self, name: &str) -> io::Result<Box<dyn StorageFile>> {
        let path = self.resolve(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Box::new(file))
    }
}
