//! Indexing orchestrator: drives the structural and semantic pipelines end
//! to end and executes queued jobs.
//!
//! Structural: enumerate → parse → reference graph → PageRank → persist →
//! repo map. Semantic: select → chunk → embed → persist. Sync jobs from the
//! watcher dispatch on the hook role.

use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, DataLayout};
use crate::embedder::EmbeddingClient;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::graph::{self, FileGraph};
use crate::jobs::{JobCtx, JobRunner};
use crate::parser::{parse_path, ParseCache, ParserPool};
use crate::repomap;
use crate::semantic;
use crate::store::Store;
use crate::tokenizer::{text_class_for_ext, Tokenizer};
use crate::types::{
    content_hash, looks_binary, now_ts, JobKind, KbRole, KnowledgeBase, SessionState, SyncTask,
    Tag,
};

/// Directory names never enumerated, regardless of .gitignore.
const DENY_DIRS: [&str; 6] = ["node_modules", "dist", "build", ".venv", "target", ".git"];

#[derive(Debug, Clone, serde::Serialize)]
pub struct StructuralOutcome {
    pub files_enumerated: usize,
    pub files_parsed: usize,
    pub tag_count: usize,
    pub edge_count: usize,
    pub map_tokens: usize,
    pub map_overflow: bool,
}

pub struct Orchestrator {
    store: Arc<Store>,
    embedder: Arc<dyn EmbeddingClient>,
    tokenizer: Arc<dyn Tokenizer>,
    pool: Arc<ParserPool>,
    cache: Option<ParseCache>,
    config: Config,
    layout: DataLayout,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn EmbeddingClient>,
        tokenizer: Arc<dyn Tokenizer>,
        config: Config,
        layout: DataLayout,
    ) -> Arc<Orchestrator> {
        let cache = match ParseCache::open(&layout.parse_cache_db()) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(error = %e, "Parse cache unavailable, parsing without it");
                None
            }
        };
        Arc::new(Orchestrator {
            store,
            embedder,
            tokenizer,
            pool: ParserPool::new(2),
            cache,
            config,
            layout,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Structural pipeline
    // -----------------------------------------------------------------------

    pub fn run_structural(
        &self,
        kb_slug: &str,
        project_path: &Path,
        token_budget: usize,
        ctx: &JobCtx,
    ) -> CoreResult<StructuralOutcome> {
        let kb = self.store.resolve_kb(kb_slug)?;
        let files = enumerate_files(project_path)?;
        ctx.set_progress(5, &format!("parsing {} files", files.len()));

        // Parse fan-out; the pool hands each rayon task its own parser.
        let pool = &self.pool;
        let cache = self.cache.as_ref();
        let parsed: Vec<(String, PathBuf, Vec<Tag>)> = files
            .par_iter()
            .filter_map(|(rel, abs)| {
                if ctx.cancelled() {
                    return None;
                }
                match parse_path(pool, cache, abs, rel, None) {
                    Ok(tags) => Some((rel.clone(), abs.clone(), tags)),
                    Err(e) => {
                        debug!(file = rel.as_str(), error = %e, "Parse skipped");
                        None
                    }
                }
            })
            .collect();
        if ctx.cancelled() {
            return Err(CoreError::dependency("structural indexing cancelled"));
        }

        let files_parsed = parsed.iter().filter(|(_, _, t)| !t.is_empty()).count();
        let all_tags: Vec<Tag> = parsed.iter().flat_map(|(_, _, t)| t.clone()).collect();
        ctx.set_progress(40, "building dependency graph");

        // Contents for the reference scan (text files only).
        let contents: Vec<(String, String)> = parsed
            .iter()
            .filter_map(|(rel, abs, _)| {
                let bytes = std::fs::read(abs).ok()?;
                if looks_binary(&bytes) {
                    return None;
                }
                Some((rel.clone(), String::from_utf8_lossy(&bytes).into_owned()))
            })
            .collect();

        let scan = graph::scan_references(&contents, &all_tags);
        let file_names: Vec<String> = parsed.iter().map(|(rel, _, _)| rel.clone()).collect();
        let file_graph =
            FileGraph::build(file_names.iter().map(|f| f.as_str()), &scan.edges);

        ctx.set_progress(60, "ranking");
        let recent = self.recent_window(project_path, &files);
        let personalization = graph::build_personalization(
            &self.config.rank,
            &file_names,
            &HashSet::new(),
            &recent,
            &all_tags,
            &file_graph,
        );
        let ranks = file_graph.pagerank(Some(&personalization));
        let ranked = graph::rank_tags(all_tags, &ranks, &scan.symbol_refs);

        ctx.set_progress(80, "rendering repo map");
        let map = repomap::emit(&ranked, token_budget, self.tokenizer.as_ref());
        self.store
            .replace_structural_index(kb.id, &ranked, &scan.edges, &map)?;
        self.touch_session_structural(project_path)?;

        info!(
            kb = kb.slug.as_str(),
            files = files.len(),
            tags = ranked.len(),
            edges = scan.edges.len(),
            map_tokens = map.token_count,
            "Structural index complete"
        );
        Ok(StructuralOutcome {
            files_enumerated: files.len(),
            files_parsed,
            tag_count: ranked.len(),
            edge_count: scan.edges.len(),
            map_tokens: map.token_count,
            map_overflow: map.overflow,
        })
    }

    /// Union of git-recent and mtime-recent files for the personalization
    /// window.
    fn recent_window(&self, root: &Path, files: &[(String, PathBuf)]) -> HashSet<String> {
        let days = self.config.rank.recent_days;
        let mut recent = graph::recent_files(root, days);
        let cutoff = std::time::SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(days.max(0) as u64 * 86_400));
        if let Some(cutoff) = cutoff {
            for (rel, abs) in files {
                if let Ok(meta) = std::fs::metadata(abs) {
                    if let Ok(modified) = meta.modified() {
                        if modified >= cutoff {
                            recent.insert(rel.clone());
                        }
                    }
                }
            }
        }
        recent
    }

    fn touch_session_structural(&self, project_path: &Path) -> CoreResult<()> {
        let Some(project) = self
            .store
            .list_projects()?
            .into_iter()
            .find(|p| p.path == project_path)
        else {
            return Ok(());
        };
        let path = self.layout.state_file(project.id);
        let mut state = SessionState::load(&path).unwrap_or_default();
        state.project_id = project.id;
        state.last_structural_at = Some(now_ts());
        state.save(&path)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Semantic pipeline
    // -----------------------------------------------------------------------

    pub fn run_semantic(
        &self,
        kb_slug: &str,
        project_path: &Path,
        selective: bool,
        structure_kb_slug: Option<&str>,
        ctx: &JobCtx,
    ) -> CoreResult<semantic::SemanticOutcome> {
        let kb = self.store.resolve_kb(kb_slug)?;
        let files = enumerate_files(project_path)?;
        let structure_tags = match structure_kb_slug {
            Some(slug) => {
                let structure_kb = self.store.resolve_kb(slug)?;
                self.store.load_tags(structure_kb.id)?
            }
            None => Vec::new(),
        };
        if selective && structure_tags.is_empty() {
            debug!(kb = kb.slug.as_str(), "Selective mode without structural tags");
        }
        let recent = self.recent_window(project_path, &files);

        let outcome = semantic::run_semantic_index(
            &self.store,
            self.embedder.as_ref(),
            self.tokenizer.as_ref(),
            &self.config,
            &kb,
            &files,
            selective,
            &structure_tags,
            &recent,
            ctx,
        )?;
        self.refresh_hook_hashes(&kb)?;
        Ok(outcome)
    }

    /// After a semantic run, align the owning hook's content-hash map with
    /// the documents actually stored.
    fn refresh_hook_hashes(&self, kb: &KnowledgeBase) -> CoreResult<()> {
        for project in self.store.list_projects()? {
            let Some((role, _)) = self
                .store
                .project_kbs(project.id)?
                .into_iter()
                .find(|(_, candidate)| candidate.id == kb.id)
            else {
                continue;
            };
            let hooks = self.store.load_hooks(project.id)?;
            let Some(mut hook) = hooks.into_iter().find(|h| h.role == role) else {
                continue;
            };
            hook.synced_files = self
                .store
                .list_documents(kb.id)?
                .into_iter()
                .map(|d| (d.filename, d.content_hash))
                .collect();
            hook.last_sync_at = Some(now_ts());
            self.store.save_hook(&hook)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync jobs
    // -----------------------------------------------------------------------

    pub fn run_reindex_file(&self, task: &SyncTask, ctx: &JobCtx) -> CoreResult<()> {
        let project = self.store.get_project(task.project_id)?;
        let kb = self.store.kb_for_role(task.project_id, task.kb_role)?;
        let hook = self
            .store
            .load_hooks(task.project_id)?
            .into_iter()
            .find(|h| h.role == task.kb_role)
            .ok_or_else(|| {
                CoreError::not_found(format!(
                    "no hook for role '{}' on project {}",
                    task.kb_role.label(),
                    task.project_id
                ))
            })?;

        let abs = hook.folder.join(&task.path);
        if !abs.exists() {
            // Deleted (or renamed away): drop the document and the hash.
            match self.store.delete_document(kb.id, &task.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            self.store
                .update_hook_sync(task.project_id, task.kb_role, &task.path, None)?;
            self.update_session_file(project.id, &task.path, None)?;
            debug!(file = task.path.as_str(), kb = kb.slug.as_str(), "Synced deletion");
            return Ok(());
        }

        if task.kb_role == KbRole::Structure {
            // Structure role re-ranks the whole project; per-file patching of
            // a PageRank graph is not meaningful.
            self.run_structural(&kb.slug, &project.path, crate::types::DEFAULT_MAP_BUDGET, ctx)?;
            let bytes = std::fs::read(&abs)?;
            let hash = content_hash(&bytes);
            self.store
                .update_hook_sync(task.project_id, task.kb_role, &task.path, Some(&hash))?;
            self.update_session_file(project.id, &task.path, Some(&hash))?;
            return Ok(());
        }

        let bytes = std::fs::read(&abs)?;
        let hash = content_hash(&bytes);
        if self.store.document_hash(kb.id, &task.path)?.as_deref() == Some(hash.as_str()) {
            return Ok(());
        }
        if looks_binary(&bytes) {
            return Ok(());
        }
        if ctx.cancelled() {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let ext = task.path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        let class = text_class_for_ext(ext);
        let pieces = crate::chunker::chunk_document(
            &text,
            class,
            &[],
            &self.config.chunker,
            self.tokenizer.as_ref(),
        );
        if pieces.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts)?;
        self.store.upsert_document(
            kb.id,
            &task.path,
            Some(&abs.to_string_lossy()),
            "text/plain",
            &hash,
            bytes.len() as u64,
            &HashMap::new(),
            &pieces,
            Some(&embeddings),
        )?;
        self.store
            .update_hook_sync(task.project_id, task.kb_role, &task.path, Some(&hash))?;
        self.update_session_file(project.id, &task.path, Some(&hash))?;
        debug!(file = task.path.as_str(), kb = kb.slug.as_str(), "Synced file");
        Ok(())
    }

    fn update_session_file(
        &self,
        project_id: i64,
        rel: &str,
        hash: Option<&str>,
    ) -> CoreResult<()> {
        let path = self.layout.state_file(project_id);
        let mut state = SessionState::load(&path).unwrap_or_default();
        state.project_id = project_id;
        match hash {
            Some(h) => {
                state.synced_files.insert(rel.to_string(), h.to_string());
            }
            None => {
                state.synced_files.remove(rel);
            }
        }
        state.save(&path)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunk re-embedding
    // -----------------------------------------------------------------------

    /// Re-embed a document whose chunks were stored without vectors (e.g.
    /// uploaded while the backend was down).
    pub fn run_chunk_embed(&self, kb_slug: &str, filename: &str) -> CoreResult<()> {
        let kb = self.store.resolve_kb(kb_slug)?;
        let doc = self
            .store
            .list_documents(kb.id)?
            .into_iter()
            .find(|d| d.filename == filename)
            .ok_or_else(|| CoreError::not_found(format!("document '{filename}' not found")))?;

        let snapshot = self.store.snapshot()?;
        let rows: Vec<_> = snapshot
            .chunk_rows(kb.id)?
            .into_iter()
            .filter(|r| r.document_id == doc.id)
            .collect();
        if rows.is_empty() || rows.iter().all(|r| r.embedding.is_some()) {
            return Ok(());
        }

        let pieces: Vec<crate::chunker::ChunkPiece> = rows
            .iter()
            .map(|r| crate::chunker::ChunkPiece {
                text: r.text.clone(),
                start_byte: r.start_byte,
                end_byte: r.end_byte,
                token_count: r.token_count,
            })
            .collect();
        let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts)?;
        self.store.upsert_document(
            kb.id,
            filename,
            doc.source_path.as_deref(),
            &doc.content_type,
            &doc.content_hash,
            doc.size,
            &doc.metadata,
            &pieces,
            Some(&embeddings),
        )?;
        Ok(())
    }
}

impl JobRunner for Orchestrator {
    fn run(&self, kind: &JobKind, ctx: &JobCtx) -> CoreResult<()> {
        match kind {
            JobKind::Structural {
                kb_slug,
                project_path,
                token_budget,
            } => self
                .run_structural(kb_slug, project_path, *token_budget, ctx)
                .map(|_| ()),
            JobKind::Semantic {
                kb_slug,
                project_path,
                selective,
                structure_kb_slug,
            } => self
                .run_semantic(
                    kb_slug,
                    project_path,
                    *selective,
                    structure_kb_slug.as_deref(),
                    ctx,
                )
                .map(|_| ()),
            JobKind::ChunkEmbed { kb_slug, filename } => self.run_chunk_embed(kb_slug, filename),
            JobKind::ReindexFile { task } => self.run_reindex_file(task, ctx),
        }
    }
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// Walk a project root honoring .gitignore plus the built-in deny list.
/// Returns (rel_path, abs_path) pairs sorted by relative path.
pub fn enumerate_files(root: &Path) -> CoreResult<Vec<(String, PathBuf)>> {
    if !root.is_dir() {
        return Err(CoreError::validation(format!(
            "'{}' is not a directory",
            root.display()
        )));
    }
    let walker = ignore::WalkBuilder::new(root)
        .hidden(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !DENY_DIRS.contains(&name.as_ref())
        })
        .build();

    let mut files = Vec::new();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        files.push((
            rel.to_string_lossy().replace('\\', "/"),
            path.to_path_buf(),
        ));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_honors_deny_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rb"), "class Main\nend\n").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/out.rs"), "x").unwrap();

        let files = enumerate_files(dir.path()).unwrap();
        let names: Vec<&str> = files.iter().map(|(rel, _)| rel.as_str()).collect();
        assert_eq!(names, vec!["main.rb"]);
    }

    #[test]
    fn test_enumerate_honors_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        // .gitignore only applies inside a git work tree.
        git2::Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join(".gitignore"), "generated/\n").unwrap();
        std::fs::create_dir_all(dir.path().join("generated")).unwrap();
        std::fs::write(dir.path().join("generated/file.rb"), "x").unwrap();
        std::fs::write(dir.path().join("kept.rb"), "class Kept\nend\n").unwrap();

        let files = enumerate_files(dir.path()).unwrap();
        let names: Vec<&str> = files.iter().map(|(rel, _)| rel.as_str()).collect();
        assert!(names.contains(&"kept.rb"));
        assert!(!names.iter().any(|n| n.starts_with("generated/")));
    }

    #[test]
    fn test_enumerate_missing_root_is_validation() {
        let err = enumerate_files(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_enumerate_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("zeta.rb"), "x").unwrap();
        std::fs::write(dir.path().join("lib/alpha.rb"), "x").unwrap();
        let files = enumerate_files(dir.path()).unwrap();
        let names: Vec<&str> = files.iter().map(|(rel, _)| rel.as_str()).collect();
        assert_eq!(names, vec!["lib/alpha.rb", "zeta.rb"]);
    }
}
