//! Storage configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the embedded host database.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database directory. Ignored for temporary databases.
    pub path: PathBuf,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Background flush interval in milliseconds. None leaves flushing to
    /// explicit [`flush`](super::StorageEngine::flush) calls, which the
    /// migration state store makes at every phase boundary.
    pub flush_every_ms: Option<u64>,

    /// Enable zstd compression.
    pub compression: bool,

    /// In-memory database removed on drop.
    pub temporary: bool,

    /// How long application writes wait for a table's shared lock while a
    /// migration holds or waits for the exclusive lock.
    pub write_lock_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./halo-data"),
            cache_capacity: 256 * 1024 * 1024,
            flush_every_ms: Some(500),
            compression: true,
            temporary: false,
            write_lock_timeout: Duration::from_secs(30),
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// In-memory database for tests.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::new(),
            temporary: true,
            ..Default::default()
        }
    }

    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    pub fn with_write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.write_lock_timeout = timeout;
        self
    }

    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression)
            .flush_every_ms(self.flush_every_ms);
        if self.temporary {
            config.temporary(true)
        } else {
            config.path(&self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let config = StorageConfig::new("/var/lib/halo")
            .with_cache_capacity(1024)
            .with_write_lock_timeout(Duration::from_millis(250));
        assert_eq!(config.path, PathBuf::from("/var/lib/halo"));
        assert_eq!(config.cache_capacity, 1024);
        assert_eq!(config.write_lock_timeout, Duration::from_millis(250));
        assert!(!config.temporary);
    }

    #[test]
    fn test_temporary_opens_in_memory() {
        let db = StorageConfig::temporary().to_sled_config().open().unwrap();
        db.insert(b"k", b"v".to_vec()).unwrap();
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
    }
}
