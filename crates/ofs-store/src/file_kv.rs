//! Tier B: small synchronous key-value store on the filesystem
//!
//! One file per key, written through a temp file and rename so a crash
//! never leaves a torn value. A byte quota across all keys mimics the hard
//! limits of small embedded key-value stores.

use crate::error::StoreError;
use crate::store::DurableStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Default quota: 5 MiB
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Secondary tier
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
    quota: usize,
    write_lock: Mutex<()>,
}

impl FileKvStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>, quota: usize) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io_error(&dir, e))?;
        Ok(Self {
            dir,
            quota,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() + 4);
        for ch in key.chars() {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                name.push(ch);
            } else {
                name.push_str(&format!("%{:04x}", u32::from(ch)));
            }
        }
        name.push_str(".kv");
        self.dir.join(name)
    }

    /// Bytes used by every key except `exclude`
    fn usage_excluding(&self, exclude: &Path) -> Result<usize, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io_error(&self.dir, e))?;
        let mut total = 0usize;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io_error(&self.dir, e))?;
            let path = entry.path();
            if path == exclude || path.extension().and_then(|e| e.to_str()) != Some("kv") {
                continue;
            }
            let len = entry
                .metadata()
                .map_err(|e| StoreError::io_error(&path, e))?
                .len();
            total = total.saturating_add(usize::try_from(len).unwrap_or(usize::MAX));
        }
        Ok(total)
    }

    /// Bytes currently used
    pub fn usage(&self) -> Result<usize, StoreError> {
        self.usage_excluding(Path::new(""))
    }

    fn read_sync(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io_error(path, e)),
        }
    }

    fn write_sync(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(key);

        let used = self.usage_excluding(&path)?;
        let size = used.saturating_add(value.len());
        if size > self.quota {
            return Err(StoreError::QuotaExceeded {
                size,
                limit: self.quota,
            });
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).map_err(|e| StoreError::io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io_error(&path, e))
    }

    fn delete_sync(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io_error(path, e)),
        }
    }
}

#[async_trait]
impl DurableStore for FileKvStore {
    fn name(&self) -> &'static str {
        "file-kv"
    }

    fn quota_bytes(&self) -> Option<usize> {
        Some(self.quota)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read_sync(key)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.write_sync(key, &value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.delete_sync(key)
    }

    fn put_blocking(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write_sync(key, value)
    }
}
