//! Narrow backend trait behind the Cache Store (spec §4.1, §9 "memory /
//! disk / redis polymorphism" redesign collapsed to one interface).
//! Coalescing and eviction logic in `cache::mod` never know which backend
//! is in play.

use crate::options::Fingerprint;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait CacheBackend: Send + Sync {
    fn get(&self, key: Fingerprint) -> std::io::Result<Option<Vec<u8>>>;
    fn put(&self, key: Fingerprint, bytes: &[u8]) -> std::io::Result<()>;
    fn delete(&self, key: Fingerprint) -> std::io::Result<()>;
    fn clear(&self) -> std::io::Result<()>;
}

/// In-process artifact store; the default and the only backend exercised
/// by unit tests. Entries vanish on restart (spec §1 non-goal: no durable
/// job persistence across restarts).
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<Fingerprint, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn get(&self, key: Fingerprint) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap_or_else(|e| e.into_inner()).get(&key).cloned())
    }

    fn put(&self, key: Fingerprint, bytes: &[u8]) -> std::io::Result<()> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: Fingerprint) -> std::io::Result<()> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
        Ok(())
    }

    fn clear(&self) -> std::io::Result<()> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

/// Artifacts persisted as one file per fingerprint under `base_dir`.
pub struct DiskBackend {
    base_dir: PathBuf,
}

impl DiskBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(DiskBackend { base_dir })
    }

    fn path_for(&self, key: Fingerprint) -> PathBuf {
        self.base_dir.join(key.to_hex())
    }
}

impl CacheBackend for DiskBackend {
    fn get(&self, key: Fingerprint) -> std::io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: Fingerprint, bytes: &[u8]) -> std::io::Result<()> {
        fs::write(self.path_for(key), bytes)
    }

    fn delete(&self, key: Fingerprint) -> std::io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn clear(&self) -> std::io::Result<()> {
        if self.base_dir.exists() {
            fs::remove_dir_all(&self.base_dir)?;
            fs::create_dir_all(&self.base_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ProcessingOptions;

    #[test]
    fn memory_backend_round_trips() {
        let backend = MemoryBackend::new();
        let key = Fingerprint::compute(b"x", &ProcessingOptions::default());
        backend.put(key, b"hello").unwrap();
        assert_eq!(backend.get(key).unwrap(), Some(b"hello".to_vec()));
        backend.delete(key).unwrap();
        assert_eq!(backend.get(key).unwrap(), None);
    }

    #[test]
    fn disk_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let key = Fingerprint::compute(b"y", &ProcessingOptions::default());
        backend.put(key, b"world").unwrap();
        assert_eq!(backend.get(key).unwrap(), Some(b"world".to_vec()));
        backend.clear().unwrap();
        assert_eq!(backend.get(key).unwrap(), None);
    }
}
