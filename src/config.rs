//! Database open options.

use crate::error::{DbError, DbResult};

/// Default page size for newly created files.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Smallest accepted page size.
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest accepted page size. Node offsets are stored as `u16`.
pub const MAX_PAGE_SIZE: usize = 65536;
/// Default number of clean pages kept in the page cache.
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// How hard commit works to make data durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// fsync the journal before the commit point and the data file after apply.
    #[default]
    Full,
    /// Skip every fsync. A crash may lose committed transactions but never
    /// exposes a partially applied one after recovery.
    Off,
}

/// Options accepted by [`crate::Database::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Page size used when the file is created. An existing file keeps the
    /// page size recorded in its header.
    pub page_size: usize,
    /// Capacity of the clean page cache, in pages.
    pub cache_size: usize,
    pub sync: SyncMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            sync: SyncMode::Full,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    pub fn validate(&self) -> DbResult<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(DbError::InvalidConfig(format!(
                "page size {} must be a power of two between {} and {}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.cache_size == 0 {
            return Err(DbError::InvalidConfig(
                "cache size must hold at least one page".to_string(),
            ));
        }
        Ok(())
    }
}
