use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use crate::{Collection, Error, Result};

/// Blocking durable storage for whole collections.
///
/// Implementations are called from `spawn_blocking`, so they are free to do
/// synchronous I/O.
pub trait Durable: Send + Sync {
    /// Reads the collection stored under `key`. `Ok(None)` means no record exists.
    fn load(&self, key: &str) -> Result<Option<Collection>>;
    /// Overwrites the collection stored under `key`.
    fn save(&self, key: &str, value: &Collection) -> Result<()>;
}

/// File-backed durable layer for the [`Store`](crate::engine::Store).
///
/// Each collection is stored in its own `<key>.json` file using an atomic
/// "write-then-rename" so a crash never leaves a half-written collection.
pub struct Persistence {
    data_dir: PathBuf,
}

impl Persistence {
    /// Initializes a new `Persistence` handler in the specified directory.
    ///
    /// If the directory does not exist, it will be created.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| unavailable(&dir, e))?;
        }
        Ok(Self { data_dir: dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(Error::InvalidRequest(format!("invalid storage key {:?}", key)));
        }
        Ok(self.data_dir.join(format!("{}.json", key)))
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> Error {
    Error::StorageUnavailable(format!("{}: {}", path.display(), e))
}

impl Durable for Persistence {
    fn load(&self, key: &str) -> Result<Option<Collection>> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // A missing file is "no record" only while the directory itself is there.
                if self.data_dir.is_dir() {
                    return Ok(None);
                }
                return Err(unavailable(&self.data_dir, e));
            }
            Err(e) => return Err(unavailable(&path, e)),
        };
        // Corrupt data surfaces as an error rather than an empty collection.
        let value: Collection = serde_json::from_slice(&bytes)?;
        Ok(Some(value))
    }

    fn save(&self, key: &str, value: &Collection) -> Result<()> {
        let file_path = self.path_for(key)?;
        let temp_path = file_path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(value)?;

        fs::write(&temp_path, bytes).map_err(|e| unavailable(&temp_path, e))?;
        fs::rename(&temp_path, &file_path).map_err(|e| unavailable(&file_path, e))?;

        Ok(())
    }
}

/// Process-local durable layer, used for tests and `--in-memory` daemons.
#[derive(Default)]
pub struct MemoryDurable {
    data: Mutex<HashMap<String, Collection>>,
}

impl MemoryDurable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Durable for MemoryDurable {
    fn load(&self, key: &str) -> Result<Option<Collection>> {
        let data = self.data.lock().map_err(|_| Error::StorageUnavailable("memory layer poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn save(&self, key: &str, value: &Collection) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| Error::StorageUnavailable("memory layer poisoned".to_string()))?;
        data.insert(key.to_string(), value.clone());
        Ok(())
    }
}
