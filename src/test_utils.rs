use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{
    config::{Config, SyncMode},
    db::Database,
};

/// Scratch directory removed on drop
pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn join<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl AsRef<Path> for TestDir {
    fn as_ref(&self) -> &Path {
        self.dir.path()
    }
}

/// Small pages so trees grow several levels quickly; no fsync.
pub fn test_config() -> Config {
    Config::new().page_size(512).cache_size(64).sync(SyncMode::Off)
}

/// Open a fresh database in its own scratch directory. Keep the `TestDir`
/// alive for as long as the database is used.
pub fn open_test_db() -> (TestDir, Database) {
    let dir = TestDir::new();
    let db = Database::open(dir.join("test.db"), test_config()).unwrap();
    (dir, db)
}
