use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use hikeathon_core::{CoreError, KeyValueStore};
use tracing::warn;

/// Values stored in the durable tier are small JSON documents.
pub const MAX_VALUE_BYTES: u64 = 1024 * 1024;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 50;

/// Durable tier: one JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    fn load(&self, path: &Path) -> io::Result<String> {
        let meta = fs::metadata(path)?;
        if meta.len() > MAX_VALUE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file too large: {} bytes (max {MAX_VALUE_BYTES})", meta.len()),
            ));
        }
        fs::read_to_string(path)
    }

    fn write_once(path: &Path, value: &str) -> io::Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value.as_bytes())?;
        if path.exists() {
            let _ = fs::remove_file(path);
        }
        fs::rename(&tmp, path)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let path = self.path_for(key);
        match self.load(&path) {
            Ok(value) => Some(value),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(key, path = %path.display(), "durable value unreadable: {err}");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoreError> {
        let path = self.path_for(key);
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match Self::write_once(&path, value) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    if attempt >= MAX_ATTEMPTS {
                        break;
                    }
                    let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
            }
        }
        let reason = last_err.map_or_else(|| "unknown error".to_owned(), |err| err.to_string());
        Err(CoreError::Storage(format!(
            "failed to write {}: {reason}",
            path.display()
        )))
    }

    fn remove(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(err) = fs::remove_file(&path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(key, path = %path.display(), "failed to remove durable value: {err}");
        }
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
