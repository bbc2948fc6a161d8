//! Source providers and configuration persistence
//!
//! Policy includes are resolved through a [`FileProvider`]. Runtime
//! configuration is stored as pretty-printed JSON and written atomically
//! via a temp file and rename.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::RuntimeConfig;

/// Resolves include names to source text.
pub trait FileProvider: Send + Sync {
    /// Contents of the named source unit.
    fn read_source(&self, name: &str) -> Result<String>;
}

/// Reads sources relative to a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryFileProvider {
    root: PathBuf,
}

impl DirectoryFileProvider {
    /// Provider rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileProvider for DirectoryFileProvider {
    fn read_source(&self, name: &str) -> Result<String> {
        let path = self.root.join(name);
        fs::read_to_string(&path).with_context(|| format!("Failed to read source: {:?}", path))
    }
}

/// In-memory sources, keyed by exact name.
#[derive(Debug, Default)]
pub struct MemoryFileProvider {
    files: RwLock<HashMap<String, String>>,
}

impl MemoryFileProvider {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with_file(self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(name, source);
        self
    }

    /// Add or replace a source.
    pub fn insert(&self, name: impl Into<String>, source: impl Into<String>) {
        self.files.write().insert(name.into(), source.into());
    }
}

impl FileProvider for MemoryFileProvider {
    fn read_source(&self, name: &str) -> Result<String> {
        self.files
            .read()
            .get(name)
            .cloned()
            .with_context(|| format!("No such source: {name}"))
    }
}

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync file")?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .with_context(|| format!("Failed to open directory: {:?}", parent))?;
        dir.sync_all().context("Failed to sync directory")?;
    }

    Ok(())
}

/// Write runtime configuration
pub fn write_config(path: &Path, config: &RuntimeConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(path, &json)
}

/// Load runtime configuration
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let data = fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    let config: RuntimeConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vclcore.json");

        let config = RuntimeConfig {
            max_frontend_retries: 2,
            default_ttl_secs: 30,
            health_checks: false,
            ..RuntimeConfig::default()
        };

        write_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();

        assert_eq!(loaded.max_frontend_retries, 2);
        assert_eq!(loaded.default_ttl_secs, 30);
        assert!(!loaded.health_checks);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_runtime_saves_housekeeping_settings() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("vclcore.json");
        fs::create_dir(temp.path().join("nested")).unwrap();

        let config = RuntimeConfig {
            cache_max_entries: 64,
            cache_sweep_ms: 0,
            dns_refresh_ms: 1_000,
            ..RuntimeConfig::default()
        };
        crate::runtime::Runtime::save_config(&path, &config).unwrap();
        assert_eq!(crate::runtime::Runtime::load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_config_reports_path() {
        let temp = TempDir::new().unwrap();
        let err = load_config(&temp.path().join("absent.json")).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }

    #[test]
    fn test_directory_provider() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("inc")).unwrap();
        fs::write(temp.path().join("inc/acl.vcl"), "acl a { \"10.0.0.1\"; }").unwrap();

        let provider = DirectoryFileProvider::new(temp.path());
        assert!(provider.read_source("inc/acl.vcl").unwrap().starts_with("acl"));
        assert!(provider.read_source("missing.vcl").is_err());
    }

    #[test]
    fn test_memory_provider() {
        let provider = MemoryFileProvider::new().with_file("main.vcl", "sub vcl_recv { }");
        assert_eq!(provider.read_source("main.vcl").unwrap(), "sub vcl_recv { }");
        assert!(provider.read_source("MAIN.vcl").is_err());
    }
}
