//! Database builder for fluent configuration
//!
//! Provides a builder pattern for choosing the record store, the engine
//! configuration and the lock conflict policy.

use std::path::Path;
use std::sync::Arc;

use arbor_concurrency::{ConflictPolicy, LockManager};
use arbor_core::ArborResult;
use arbor_storage::{MemoryStore, RecordStore};

use super::{Database, EngineConfig};

// ============================================================================
// Database Builder Pattern
// ============================================================================

/// Builder for Database configuration
///
/// # Two Ways to Open a Database
///
/// ```
/// use std::sync::Arc;
/// use arbor_engine::{Database, EngineConfig};
/// use arbor_storage::MemoryStore;
///
/// // 1. Explicit store and config
/// let db = Database::open(Arc::new(MemoryStore::new()), EngineConfig::default())?;
///
/// // 2. Builder
/// let db = Database::builder()
///     .config(EngineConfig::new().with_cache_enabled(false))
///     .open()?;
/// # Ok::<(), arbor_core::ArborError>(())
/// ```
///
/// Without an explicit store the builder uses a fresh [`MemoryStore`].
#[derive(Default)]
pub struct DatabaseBuilder {
    store: Option<Arc<dyn RecordStore>>,
    config: EngineConfig,
    policy: Option<Box<dyn ConflictPolicy>>,
}

impl DatabaseBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record store
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the engine configuration from a TOML file
    ///
    /// The file is created with default settings if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be written, read or parsed.
    pub fn config_file(mut self, path: &Path) -> ArborResult<Self> {
        EngineConfig::write_default_if_missing(path)?;
        self.config = EngineConfig::load(path)?;
        Ok(self)
    }

    /// Replace the lock grant rule
    ///
    /// Defaults to global write exclusivity.
    pub fn conflict_policy(mut self, policy: Box<dyn ConflictPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Open the database
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid configuration, or the store's
    /// error if the root record cannot be created.
    pub fn open(self) -> ArborResult<Database> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let locks = match self.policy {
            Some(policy) => LockManager::with_policy(self.config.lock_timeout(), policy),
            None => LockManager::new(self.config.lock_timeout()),
        };
        Database::open_with_locks(store, self.config, Arc::new(locks))
    }
}
