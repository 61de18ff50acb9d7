//! `Config` persistence (§6 "Config persistence"): the opaque
//! `load_config`/`save_config` hooks, as a `ConfigStore` trait plus a
//! default JSON-on-disk implementation.
//!
//! Grounded on `bootupd/src/backend/statefile.rs`'s lock-then-write-temp-
//! then-rename pattern, adapted from `openat`'s directory-relative API to
//! plain `std::fs` since the config file lives at a fixed absolute path
//! rather than relative to a mutable sysroot.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fn_error_context::context;
use fs2::FileExt;

use crate::model::Config;

/// Platform-specific persistence for `Config` (§6). The core does not
/// dictate the on-disk format; this is the in-tree default.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Config>;
    fn save(&self, config: &Config) -> Result<()>;
}

/// JSON file guarded by an `fs2` exclusive lock, written via a temp file
/// plus rename so a crash mid-write never leaves a truncated config.
pub struct JsonFileConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        JsonFileConfigStore { path, lock_path }
    }

    fn acquire_lock(&self) -> Result<std::fs::File> {
        let lockfile = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&self.lock_path)?;
        lockfile.lock_exclusive()?;
        Ok(lockfile)
    }
}

impl ConfigStore for JsonFileConfigStore {
    #[context("loading config from {}", self.path.display())]
    fn load(&self) -> Result<Config> {
        if !self.path.exists() {
            return Ok(Config::default());
        }
        let _lock = self.acquire_lock()?;
        let f = std::fs::File::open(&self.path)?;
        let config = serde_json::from_reader(std::io::BufReader::new(f)).context("parsing config JSON")?;
        Ok(config)
    }

    #[context("saving config to {}", self.path.display())]
    fn save(&self, config: &Config) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let f = std::fs::File::create(&tmp_path)?;
            let mut w = std::io::BufWriter::new(f);
            serde_json::to_writer_pretty(&mut w, config)?;
            w.flush()?;
            w.into_inner()?.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path().join("petitboot.json"));
        let mut config = Config::default();
        config.autoboot_timeout_sec = 42;
        store.save(&config).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.autoboot_timeout_sec, 42);
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path().join("missing.json"));
        let config = store.load().unwrap();
        assert_eq!(config.autoboot_timeout_sec, Config::default().autoboot_timeout_sec);
    }
}
