// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local `HuggingFace` model cache location and inspection.
//!
//! The hub cache lives at `$HF_HOME/hub` (default
//! `~/.cache/huggingface/hub`) and stores one directory per repository,
//! named `models--<org>--<name>`. [`ModelCache`] resolves that root and
//! answers presence/listing queries without ever touching the network.

use std::path::{Path, PathBuf};

/// Locator for the local `HuggingFace` hub cache.
///
/// # Example
///
/// ```
/// use candle_tap::ModelCache;
///
/// assert_eq!(ModelCache::cache_key("acme/tiny"), "models--acme--tiny");
/// ```
#[derive(Debug, Clone)]
pub struct ModelCache {
    /// The hub directory holding `models--*` entries.
    root: PathBuf,
}

impl ModelCache {
    /// Resolve the cache root from the environment.
    ///
    /// Uses `$HF_HOME/hub` when `HF_HOME` is set, otherwise
    /// `~/.cache/huggingface/hub` under `$HOME` (or `%USERPROFILE%` on
    /// Windows). Falls back to a relative `.cache/huggingface/hub` when
    /// no home directory is discoverable.
    #[must_use]
    pub fn from_env() -> Self {
        if let Ok(hf_home) = std::env::var("HF_HOME") {
            return Self {
                root: PathBuf::from(hf_home).join("hub"),
            };
        }
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_or_else(|_| PathBuf::new(), PathBuf::from);
        Self {
            root: home.join(".cache").join("huggingface").join("hub"),
        }
    }

    /// Use an explicit hub directory instead of the environment.
    #[must_use]
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The hub directory this locator points at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a `"org/model"` repository id to its cache directory name
    /// (`"models--org--model"`).
    ///
    /// This is a one-way transform used for membership checks; names that
    /// already contain `--` are not expected to round-trip.
    #[must_use]
    pub fn cache_key(model_name: &str) -> String {
        format!("models--{}", model_name.replace('/', "--"))
    }

    /// Directory a cached copy of `model_name` would occupy.
    #[must_use]
    pub fn model_path(&self, model_name: &str) -> PathBuf {
        self.root.join(Self::cache_key(model_name))
    }

    /// Whether `model_name` is present in the cache.
    #[must_use]
    pub fn contains(&self, model_name: &str) -> bool {
        self.model_path(model_name).exists()
    }

    /// List all cached model directories (`models--*`), sorted.
    ///
    /// An absent cache root yields an empty listing rather than an error.
    #[must_use]
    pub fn list_models(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut models: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with("models--"))
            .collect();
        models.sort();
        models
    }

    /// First snapshot directory for a cached model, if any.
    ///
    /// Snapshots live under `<key>/snapshots/<revision>/`; a freshly
    /// downloaded model has exactly one revision.
    #[must_use]
    pub fn snapshot_dir(&self, model_name: &str) -> Option<PathBuf> {
        let snapshots = self.model_path(model_name).join("snapshots");
        let entry = std::fs::read_dir(snapshots).ok()?.next()?.ok()?;
        Some(entry.path())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_transform() {
        assert_eq!(ModelCache::cache_key("acme/tiny"), "models--acme--tiny");
        assert_eq!(
            ModelCache::cache_key("meta-llama/Llama-3.2-1B"),
            "models--meta-llama--Llama-3.2-1B"
        );
        // No slash: passes through with the prefix only.
        assert_eq!(ModelCache::cache_key("plain"), "models--plain");
    }

    #[test]
    fn contains_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::with_root(dir.path());

        assert!(!cache.contains("acme/tiny"));
        assert!(cache.list_models().is_empty());

        std::fs::create_dir_all(dir.path().join("models--acme--tiny")).unwrap();
        std::fs::create_dir_all(dir.path().join("models--zeta--big")).unwrap();
        // Non-model entries are ignored.
        std::fs::create_dir_all(dir.path().join("datasets--acme--corpus")).unwrap();

        assert!(cache.contains("acme/tiny"));
        assert!(!cache.contains("acme/large"));
        assert_eq!(
            cache.list_models(),
            vec!["models--acme--tiny".to_string(), "models--zeta--big".to_string()]
        );
    }

    #[test]
    fn missing_root_lists_empty() {
        let cache = ModelCache::with_root("/nonexistent/candle-tap-test");
        assert!(cache.list_models().is_empty());
        assert!(!cache.contains("acme/tiny"));
    }

    #[test]
    fn snapshot_dir_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::with_root(dir.path());

        assert!(cache.snapshot_dir("acme/tiny").is_none());

        let snap = dir
            .path()
            .join("models--acme--tiny")
            .join("snapshots")
            .join("abc123");
        std::fs::create_dir_all(&snap).unwrap();
        assert_eq!(cache.snapshot_dir("acme/tiny").unwrap(), snap);
    }

    #[test]
    #[serial_test::serial]
    fn from_env_respects_hf_home() {
        let prev = std::env::var("HF_HOME").ok();
        std::env::set_var("HF_HOME", "/tmp/candle-tap-hf");
        let cache = ModelCache::from_env();
        assert_eq!(cache.root(), Path::new("/tmp/candle-tap-hf/hub"));
        match prev {
            Some(v) => std::env::set_var("HF_HOME", v),
            None => std::env::remove_var("HF_HOME"),
        }
    }
}
