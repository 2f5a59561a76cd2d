//! In-memory storage backend with failure injection.

use std::collections::BTreeMap;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{RecordingStorage, StorageFile};

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, Vec<u8>>,
    /// Remaining bytes before writes fail; `None` is unlimited.
    capacity: Option<u64>,
    fail_create: bool,
    creates: usize,
}

/// Cloneable handle; clones share the same files.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of `name`, if it was ever created.
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(name).cloned()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.inner.lock().files.keys().cloned().collect()
    }

    /// Number of successful `create` calls.
    pub fn create_count(&self) -> usize {
        self.inner.lock().creates
    }

    /// Fail writes once `bytes` more bytes have been stored.
    pub fn set_capacity(&self, bytes: Option<u64>) {
        self.inner.lock().capacity = bytes;
    }

    pub fn fail_creates(&self, fail: bool) {
        self.inner.lock().fail_create = fail;
    }
}

impl RecordingStorage for MemoryStorage {
    fn create(&mut self, name: &str) -> io::Result<Box<dyn StorageFile>> {
        let mut inner = self.inner.lock();
        if inner.fail_create {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot create {name}"),
            ));
        }
        inner.files.insert(name.to_string(), Vec::new());
        inner.creates += 1;
        Ok(Box::new(MemoryFile {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            pos: 0,
        }))
    }
}

struct MemoryFile {
    inner: Arc<Mutex<Inner>>,
    name: String,
    pos: u64,
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.capacity {
            if (buf.len() as u64) > remaining {
                return Err(io::Error::other("storage full"));
            }
            inner.capacity = Some(remaining - buf.len() as u64);
        }
        let file = inner
            .files
            .get_mut(&self.name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file removed"))?;
        let start = self.pos as usize;
        let end = start + buf.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self
            .inner
            .lock()
            .files
            .get(&self.name)
            .map(|f| f.len() as u64)
            .unwrap_or(0);
        let next = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let next = next.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.pos = next;
        Ok(next)
    }
}

impl StorageFile for MemoryFile {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_patches_in_place() {
        let mut storage = MemoryStorage::new();
        let mut file = storage.create("a").unwrap();
        file.write_all(b"hello world").unwrap();
        file.seek(SeekFrom::Start(6)).unwrap();
        file.write_all(b"WORLD").unwrap();
        assert_eq!(storage.file("a").unwrap(), b"hello WORLD");
    }

    #[test]
    fn capacity_failure_is_all_or_nothing() {
        let mut storage = MemoryStorage::new();
        storage.set_capacity(Some(4));
        let mut file = storage.create("a").unwrap();
        assert!(file.write_all(b"abcdef").is_err());
        assert_eq!(storage.file("a").unwrap(), b"");
        file.write_all(b"abcd").unwrap();
        assert!(file.write_all(b"e").is_err());
    }

    #[test]
    fn create_failure_is_injected() {
        let mut storage = MemoryStorage::new();
        storage.fail_creates(true);
        assert!(storage.create("a").is_err());
        assert_eq!(storage.create_count(), 0);
    }
}
