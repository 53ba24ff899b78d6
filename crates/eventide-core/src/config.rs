use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single SQLite store handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the database file. `None` opens an in-memory database.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Open the connection read-only. Read-only stores never run
    /// migrations and reject transactions.
    #[serde(default)]
    pub read_only: bool,

    /// Enable WAL mode (file-backed stores only)
    /// Default: true
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,

    /// SQLite synchronous mode
    #[serde(default)]
    pub synchronous: SynchronousMode,

    /// Label used in log output for this handle.
    #[serde(default = "default_name")]
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SynchronousMode {
    /// Full fsync (safest, slowest)
    Full,
    /// fsync at critical moments (good balance)
    #[default]
    Normal,
    /// No fsync (fastest, least safe)
    Off,
}

fn default_wal_mode() -> bool {
    true
}

fn default_name() -> String {
    "eventide".to_string()
}

impl StoreConfig {
    /// Configuration for a file-backed store.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            read_only: false,
            wal_mode: default_wal_mode(),
            synchronous: SynchronousMode::default(),
            name: default_name(),
        }
    }

    /// Configuration for an in-memory store.
    pub fn memory() -> Self {
        Self {
            path: None,
            read_only: false,
            wal_mode: default_wal_mode(),
            synchronous: SynchronousMode::default(),
            name: default_name(),
        }
    }

    pub fn is_memory(&self) -> bool {
        self.path.is_none()
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_synchronous(mut self, synchronous: SynchronousMode) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn with_wal_mode(mut self, wal_mode: bool) -> Self {
        self.wal_mode = wal_mode;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Configuration for the event engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The read-write store holding model tables and the version.
    pub store: StoreConfig,

    /// Store holding the event queue. Defaults to the same file as
    /// `store` (sharing its connection).
    #[serde(default)]
    pub queue: Option<StoreConfig>,

    /// Interval between queue polls when waiting for events
    /// Default: 1000
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Base backoff between retries of a failing event; the sleep is this
    /// value multiplied by the consecutive-failure count.
    /// Default: 5000
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Consecutive failures tolerated before the poll loop gives up.
    /// Default: 38
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exit the poll loop after the first failed event instead of
    /// retrying. Intended for tests.
    #[serde(default)]
    pub stop_on_error: bool,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    38
}

impl EngineConfig {
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            queue: None,
            poll_interval_ms: default_poll_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retries: default_max_retries(),
            stop_on_error: false,
        }
    }

    /// Engine over an in-memory database.
    pub fn memory() -> Self {
        Self::new(StoreConfig::memory())
    }

    /// Engine over a file-backed database.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(StoreConfig::file(path))
    }

    /// Keep the queue in its own database file.
    pub fn with_queue(mut self, queue: StoreConfig) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
