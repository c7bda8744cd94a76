//! Server configuration and on-disk data layout.
//!
//! Settings load from `corpora.toml` (data root, then cwd) with defaults
//! matching the documented behavior. The layout module owns every path under
//! the data root so no other module concatenates directory names.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Config sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    /// Base URL of the local model runner (OpenAI-compatible JSON API).
    pub url: String,
    pub model: String,
    /// Dimension assigned to new KBs unless the caller overrides it.
    pub dimension: usize,
    /// Per-attempt HTTP timeout, seconds.
    pub attempt_timeout_secs: u64,
    /// Whole-batch budget, seconds.
    pub batch_budget_secs: u64,
    /// Grace period before a semantic batch fails on an unreachable backend.
    pub grace_secs: u64,
    /// Optional rerank endpoint model; empty disables reranking support.
    pub rerank_model: String,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        EmbedderSettings {
            url: "http://127.0.0.1:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 768,
            attempt_timeout_secs: 30,
            batch_budget_secs: 120,
            grace_secs: 60,
            rerank_model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RankSettings {
    /// Personalization boost for files explicitly in chat.
    pub chat_boost: f64,
    /// Boost for files with a git commit within `recent_days`.
    pub recent_boost: f64,
    pub recent_days: i64,
    /// Boost for files containing identifiers of 8+ characters.
    pub long_ident_boost: f64,
    /// Boost for files referenced by others but referencing few.
    pub hub_boost: f64,
}

impl Default for RankSettings {
    fn default() -> Self {
        RankSettings {
            chat_boost: 50.0,
            recent_boost: 10.0,
            recent_days: 30,
            long_ident_boost: 10.0,
            hub_boost: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkerSettings {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerSettings {
    fn default() -> Self {
        ChunkerSettings {
            max_tokens: 512,
            overlap_tokens: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    /// Per-file debounce window, milliseconds.
    pub debounce_ms: u64,
    /// Burst ceiling per project, tasks per second.
    pub max_tasks_per_sec: usize,
    /// Queue depth that pauses event accrual.
    pub high_water: usize,
    /// Queue depth that resumes it.
    pub low_water: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        WatcherSettings {
            debounce_ms: 2000,
            max_tasks_per_sec: 200,
            high_water: 10_000,
            low_water: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Worker threads for the job queue; 0 = min(4, cores).
    pub workers: usize,
    /// Soft deadline for a retrieval request, seconds; rerank is skipped
    /// once it passes.
    pub query_deadline_secs: u64,
    /// Bind 0.0.0.0 instead of loopback.
    pub bind_all: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            workers: 0,
            query_deadline_secs: 20,
            bind_all: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub embedder: EmbedderSettings,
    pub rank: RankSettings,
    pub chunker: ChunkerSettings,
    pub watcher: WatcherSettings,
}

impl Config {
    /// Load `corpora.toml` from the data root, then the working directory.
    /// Missing files fall back to defaults; malformed files are an error.
    pub fn load(data_root: &Path) -> CoreResult<Config> {
        for candidate in [data_root.join("corpora.toml"), PathBuf::from("corpora.toml")] {
            if candidate.exists() {
                let body = std::fs::read_to_string(&candidate)?;
                return toml::from_str(&body).map_err(|e| {
                    CoreError::validation(format!("{}: {e}", candidate.display()))
                });
            }
        }
        Ok(Config::default())
    }

    pub fn worker_count(&self) -> usize {
        if self.server.workers > 0 {
            return self.server.workers;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        cores.min(4)
    }
}

// ---------------------------------------------------------------------------
// Data layout
// ---------------------------------------------------------------------------

/// Every path under the data root.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
}

impl DataLayout {
    pub fn new(root: PathBuf) -> Self {
        DataLayout { root }
    }

    /// Resolve the data root: explicit flag, `CORPORA_DATA_ROOT`, then the
    /// platform data directory.
    pub fn resolve(explicit: Option<PathBuf>) -> DataLayout {
        let root = explicit
            .or_else(|| std::env::var_os("CORPORA_DATA_ROOT").map(PathBuf::from))
            .or_else(|| {
                std::env::var_os("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
                    .map(|base| base.join("corpora"))
            })
            .unwrap_or_else(|| PathBuf::from(".corpora"));
        DataLayout::new(root)
    }

    pub fn store_db(&self) -> PathBuf {
        self.root.join("store.db")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn parse_cache_db(&self) -> PathBuf {
        self.root.join("cache").join("tree_sitter.db")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.root.join("exports")
    }

    pub fn state_file(&self, project_id: i64) -> PathBuf {
        self.root.join("state").join(format!("{project_id}.json"))
    }

    pub fn hook_file(&self, project_id: i64) -> PathBuf {
        self.root.join("hooks").join(format!("{project_id}.json"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create every directory of the layout. Idempotent.
    pub fn ensure(&self) -> CoreResult<()> {
        for dir in [
            self.root.clone(),
            self.uploads_dir(),
            self.root.join("cache"),
            self.exports_dir(),
            self.root.join("state"),
            self.root.join("hooks"),
            self.logs_dir(),
        ] {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "Could not create data directory");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.chunker.max_tokens, 512);
        assert_eq!(cfg.chunker.overlap_tokens, 64);
        assert_eq!(cfg.watcher.debounce_ms, 2000);
        assert_eq!(cfg.watcher.high_water, 10_000);
        assert_eq!(cfg.rank.chat_boost, 50.0);
        assert_eq!(cfg.embedder.grace_secs, 60);
        assert!(cfg.worker_count() >= 1 && cfg.worker_count() <= 4);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("corpora.toml"),
            "[chunker]\nmax_tokens = 256\n\n[rank]\nrecent_days = 7\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.chunker.max_tokens, 256);
        assert_eq!(cfg.chunker.overlap_tokens, 64); // default preserved
        assert_eq!(cfg.rank.recent_days, 7);
    }

    #[test]
    fn test_load_malformed_toml_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("corpora.toml"), "chunker = [broken").unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_layout_paths() {
        let layout = DataLayout::new(PathBuf::from("/data"));
        assert_eq!(layout.store_db(), PathBuf::from("/data/store.db"));
        assert_eq!(
            layout.parse_cache_db(),
            PathBuf::from("/data/cache/tree_sitter.db")
        );
        assert_eq!(layout.state_file(3), PathBuf::from("/data/state/3.json"));
        assert_eq!(layout.hook_file(3), PathBuf::from("/data/hooks/3.json"));
    }
}
