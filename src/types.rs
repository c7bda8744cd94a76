//! Core entity types shared across the store, pipelines, and both API
//! surfaces: knowledge bases, projects, documents, chunks, symbol tags,
//! dependency edges, jobs, hooks, and session state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Files larger than this produce zero tags (with a warning) in the parser.
pub const MAX_PARSE_BYTES: u64 = 8 * 1024 * 1024;

/// Files larger than this are skipped by the semantic indexer.
pub const MAX_EMBED_BYTES: u64 = 2 * 1024 * 1024;

/// Leading window inspected for NUL bytes when detecting binary files.
pub const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Default token budget for repo-map rendering when none is requested.
pub const DEFAULT_MAP_BUDGET: usize = 4096;

// ---------------------------------------------------------------------------
// Knowledge bases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KbType {
    Generic,
    Code,
    Documentation,
    AgentOs,
    Structure,
}

impl KbType {
    pub fn label(&self) -> &'static str {
        match self {
            KbType::Generic => "generic",
            KbType::Code => "code",
            KbType::Documentation => "documentation",
            KbType::AgentOs => "agent-os",
            KbType::Structure => "structure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generic" => Some(KbType::Generic),
            "code" => Some(KbType::Code),
            "documentation" => Some(KbType::Documentation),
            "agent-os" => Some(KbType::AgentOs),
            "structure" => Some(KbType::Structure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBase {
    pub id: i64,
    pub name: String,
    /// Derived lower-kebab form of the name. Immutable for the KB's lifetime.
    pub slug: String,
    pub kb_type: KbType,
    pub description: String,
    /// Embedding dimension, fixed at creation. 0 until the first embedding
    /// backend handshake pins it.
    pub dimension: usize,
    pub created_at: String,
    pub updated_at: String,
}

/// Derive the stable slug for a KB name: lowercase, alphanumeric runs joined
/// by single hyphens, no leading/trailing hyphen. Same name → same slug.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Projects and hook roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KbRole {
    Memories,
    Index,
    Profile,
    Docs,
    Structure,
}

impl KbRole {
    pub const ALL: [KbRole; 5] = [
        KbRole::Memories,
        KbRole::Index,
        KbRole::Profile,
        KbRole::Docs,
        KbRole::Structure,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            KbRole::Memories => "memories",
            KbRole::Index => "index",
            KbRole::Profile => "profile",
            KbRole::Docs => "docs",
            KbRole::Structure => "structure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "memories" => Some(KbRole::Memories),
            "index" => Some(KbRole::Index),
            "profile" => Some(KbRole::Profile),
            "docs" => Some(KbRole::Docs),
            "structure" => Some(KbRole::Structure),
            _ => None,
        }
    }

    /// The KB type a role's auto-created KB gets.
    pub fn kb_type(&self) -> KbType {
        match self {
            KbRole::Memories => KbType::Generic,
            KbRole::Index => KbType::Code,
            KbRole::Profile => KbType::AgentOs,
            KbRole::Docs => KbType::Documentation,
            KbRole::Structure => KbType::Structure,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub path: PathBuf,
    pub description: String,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Documents, chunks, embeddings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DocumentMeta {
    pub id: i64,
    pub kb_id: i64,
    pub filename: String,
    pub source_path: Option<String>,
    pub size: u64,
    pub content_type: String,
    /// sha-256 of the raw bytes, hex-encoded.
    pub content_hash: String,
    pub metadata: HashMap<String, String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: i64,
    pub document_id: i64,
    /// Contiguous from 0 within the document.
    pub ordinal: usize,
    pub text: String,
    pub start_byte: usize,
    pub end_byte: usize,
    pub token_count: usize,
}

/// Pack a float vector into the on-disk embedding representation:
/// little-endian IEEE-754 f32, densely concatenated.
pub fn pack_embedding(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn unpack_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Symbols and dependency edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Class,
    Function,
    Method,
    Variable,
    Module,
    Other,
}

impl TagKind {
    pub fn label(&self) -> &'static str {
        match self {
            TagKind::Class => "class",
            TagKind::Function => "function",
            TagKind::Method => "method",
            TagKind::Variable => "variable",
            TagKind::Module => "module",
            TagKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "class" => Some(TagKind::Class),
            "function" => Some(TagKind::Function),
            "method" => Some(TagKind::Method),
            "variable" => Some(TagKind::Variable),
            "module" => Some(TagKind::Module),
            "other" => Some(TagKind::Other),
            _ => None,
        }
    }

    /// Definer kinds contribute nodes and names to the dependency graph.
    pub fn is_definer(&self) -> bool {
        matches!(
            self,
            TagKind::Class | TagKind::Function | TagKind::Method | TagKind::Module
        )
    }
}

/// A syntactic symbol extracted from one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    /// Repo-relative path, never empty.
    pub file: String,
    pub name: String,
    pub kind: TagKind,
    /// 1-based start line.
    pub line: usize,
    /// One-line signature, truncated at 200 chars.
    pub signature: String,
    pub language: String,
    /// Normalized identifier used as a graph key.
    pub identifier: String,
    /// File rank × (1 + ln(reference count)); filled by the ranker.
    #[serde(default)]
    pub importance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Defines,
    References,
    Imports,
    Extends,
}

impl EdgeKind {
    pub fn label(&self) -> &'static str {
        match self {
            EdgeKind::Defines => "defines",
            EdgeKind::References => "references",
            EdgeKind::Imports => "imports",
            EdgeKind::Extends => "extends",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "defines" => Some(EdgeKind::Defines),
            "references" => Some(EdgeKind::References),
            "imports" => Some(EdgeKind::Imports),
            "extends" => Some(EdgeKind::Extends),
            _ => None,
        }
    }
}

/// A directed weighted edge between two symbols of the same KB.
#[derive(Debug, Clone, Serialize)]
pub struct DepEdge {
    pub from_file: String,
    pub from_symbol: String,
    pub to_file: String,
    pub to_symbol: String,
    pub kind: EdgeKind,
    pub weight: f64,
}

/// Derived repo-map artifact for a structural KB. Regenerated, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct RepoMapArtifact {
    pub text: String,
    pub token_count: usize,
    pub budget: usize,
    pub overflow: bool,
    pub tag_count: usize,
    pub generated_at: String,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Filesystem event classification carried by sync tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsEventKind {
    Create,
    Modify,
    Delete,
    Rename,
}

/// One debounced filesystem change bound for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub kb_role: KbRole,
    pub project_id: i64,
    /// Path relative to the hook folder.
    pub path: String,
    pub event_kind: FsEventKind,
    pub observed_at: String,
}

impl SyncTask {
    /// Coalescing key: while one instance is queued or running, later events
    /// for the same tuple merge into it.
    pub fn coalesce_key(&self) -> String {
        format!("{}:{}:{}", self.kb_role.label(), self.project_id, self.path)
    }
}

/// Tagged job kinds; handlers dispatch on the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Structural {
        kb_slug: String,
        project_path: PathBuf,
        token_budget: usize,
    },
    Semantic {
        kb_slug: String,
        project_path: PathBuf,
        selective: bool,
        structure_kb_slug: Option<String>,
    },
    ChunkEmbed {
        kb_slug: String,
        filename: String,
    },
    ReindexFile {
        task: SyncTask,
    },
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::Structural { .. } => "structural",
            JobKind::Semantic { .. } => "semantic",
            JobKind::ChunkEmbed { .. } => "chunk_embed",
            JobKind::ReindexFile { .. } => "reindex_file",
        }
    }

    /// Resumable kinds restart from the persisted file-hash map after a
    /// process crash instead of being marked interrupted.
    pub fn is_resumable(&self) -> bool {
        matches!(self, JobKind::Structural { .. } | JobKind::Semantic { .. })
    }
}

/// Immutable view of a job at a point in time. `status` always returns the
/// latest snapshot; terminal snapshots never change again.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub kind: String,
    pub state: JobState,
    /// Percent progress in [0, 100].
    pub percent: u8,
    pub message: String,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Hooks and session state
// ---------------------------------------------------------------------------

/// Per (project, role) auto-sync binding, persisted so the watcher can
/// resume after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub project_id: i64,
    pub role: KbRole,
    pub enabled: bool,
    pub folder: PathBuf,
    /// Glob allow-list; files not matching are discarded before debounce.
    pub patterns: Vec<String>,
    pub last_sync_at: Option<String>,
    /// filename → last-seen content hash.
    pub synced_files: HashMap<String, String>,
}

impl Hook {
    pub fn new(project_id: i64, role: KbRole, folder: PathBuf, patterns: Vec<String>) -> Self {
        Hook {
            project_id,
            role,
            enabled: true,
            folder,
            patterns,
            last_sync_at: None,
            synced_files: HashMap::new(),
        }
    }
}

/// Small per-project cursor: which files have been synced and when the
/// structural index last ran. Rewritten atomically (temp file + rename).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub project_id: i64,
    pub synced_files: HashMap<String, String>,
    pub last_structural_at: Option<String>,
}

impl SessionState {
    /// Atomic rewrite: write to a temp sibling, then rename over the target.
    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> Option<Self> {
        let body = std::fs::read(path).ok()?;
        serde_json::from_slice(&body).ok()
    }
}

// ---------------------------------------------------------------------------
// Server context (composition root output, shared by both API surfaces)
// ---------------------------------------------------------------------------

/// Every service the handlers need, constructed once in main and passed by
/// reference. No ambient state.
pub struct ServerContext {
    pub store: std::sync::Arc<crate::store::Store>,
    pub jobs: std::sync::Arc<crate::jobs::JobQueue>,
    pub watcher: std::sync::Arc<crate::watch::WatchManager>,
    pub orchestrator: std::sync::Arc<crate::orchestrator::Orchestrator>,
    pub embedder: std::sync::Arc<dyn crate::embedder::EmbeddingClient>,
    pub tokenizer: std::sync::Arc<dyn crate::tokenizer::Tokenizer>,
    pub config: std::sync::Arc<crate::config::Config>,
    pub layout: crate::config::DataLayout,
}

impl Clone for ServerContext {
    fn clone(&self) -> Self {
        ServerContext {
            store: std::sync::Arc::clone(&self.store),
            jobs: std::sync::Arc::clone(&self.jobs),
            watcher: std::sync::Arc::clone(&self.watcher),
            orchestrator: std::sync::Arc::clone(&self.orchestrator),
            embedder: std::sync::Arc::clone(&self.embedder),
            tokenizer: std::sync::Arc::clone(&self.tokenizer),
            config: std::sync::Arc::clone(&self.config),
            layout: self.layout.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Binary detection: NUL byte anywhere in the leading window.
pub fn looks_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    window.contains(&0)
}

/// Hex-encoded sha-256 of raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// RFC 3339 UTC timestamp for row stamps and manifests.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_deterministic() {
        assert_eq!(slugify("My Project Docs"), "my-project-docs");
        assert_eq!(slugify("My Project Docs"), slugify("My Project Docs"));
    }

    #[test]
    fn test_slugify_collapses_separators() {
        assert_eq!(slugify("a  b--c__d"), "a-b-c-d");
        assert_eq!(slugify("  leading/trailing  "), "leading-trailing");
        assert_eq!(slugify("Ruby-Demo"), "ruby-demo");
    }

    #[test]
    fn test_embedding_roundtrip() {
        let v = vec![0.5f32, -1.25, 3.0, f32::MIN_POSITIVE];
        let blob = pack_embedding(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(unpack_embedding(&blob), v);
    }

    #[test]
    fn test_binary_detection() {
        assert!(looks_binary(b"abc\0def"));
        assert!(!looks_binary(b"plain text only"));
        let mut big = vec![b'a'; BINARY_SNIFF_BYTES + 10];
        big[BINARY_SNIFF_BYTES + 5] = 0; // NUL past the sniff window
        assert!(!looks_binary(&big));
    }

    #[test]
    fn test_coalesce_key_shape() {
        let task = SyncTask {
            kb_role: KbRole::Docs,
            project_id: 7,
            path: "guide/setup.md".to_string(),
            event_kind: FsEventKind::Modify,
            observed_at: now_ts(),
        };
        assert_eq!(task.coalesce_key(), "docs:7:guide/setup.md");
    }

    #[test]
    fn test_session_state_atomic_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("42.json");
        let mut state = SessionState {
            project_id: 42,
            ..Default::default()
        };
        state
            .synced_files
            .insert("a.md".to_string(), "deadbeef".to_string());
        state.save(&path).unwrap();

        let loaded = SessionState::load(&path).unwrap();
        assert_eq!(loaded.project_id, 42);
        assert_eq!(loaded.synced_files["a.md"], "deadbeef");
        // No temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_job_state_terminality() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }
}
