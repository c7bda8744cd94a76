//! Selective semantic indexing: choose the files worth embedding, chunk
//! them, embed per chunk, and persist each file in one transaction.
//!
//! Selection in selective mode is the union of files owning top-20% symbols
//! by importance, documentation files, and recently modified files. A file
//! is re-embedded only when its content hash changed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::chunker;
use crate::config::Config;
use crate::embedder::EmbeddingClient;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::jobs::JobCtx;
use crate::store::Store;
use crate::tokenizer::{text_class_for_ext, TextClass, Tokenizer};
use crate::types::{content_hash, looks_binary, KnowledgeBase, Tag, MAX_EMBED_BYTES};

/// Fraction of top symbols whose files are selected in selective mode.
const TOP_SYMBOL_FRACTION: f64 = 0.20;

const DOC_EXTENSIONS: [&str; 3] = ["md", "txt", "rst"];

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SemanticOutcome {
    pub files_selected: usize,
    pub files_embedded: usize,
    pub files_skipped: usize,
    pub chunks_written: usize,
    /// (file, reason) for per-file failures that did not abort the batch.
    pub failures: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// File selection
// ---------------------------------------------------------------------------

fn file_ext(rel_path: &str) -> &str {
    rel_path.rsplit_once('.').map(|(_, e)| e).unwrap_or("")
}

fn is_doc_file(rel_path: &str) -> bool {
    DOC_EXTENSIONS.contains(&file_ext(rel_path))
}

/// Deterministic selective union: top-20%-symbol files ∪ documentation
/// files ∪ recently modified files, in path order.
pub fn select_files(
    files: &[(String, PathBuf)],
    selective: bool,
    structure_tags: &[Tag],
    recent: &HashSet<String>,
) -> Vec<(String, PathBuf)> {
    if !selective {
        return files.to_vec();
    }

    let mut chosen: BTreeSet<&str> = BTreeSet::new();

    // (i) files whose best symbol sits in the top 20% by importance.
    if !structure_tags.is_empty() {
        let mut by_importance: Vec<&Tag> = structure_tags.iter().collect();
        by_importance.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file.cmp(&b.file))
                .then_with(|| a.line.cmp(&b.line))
        });
        let take = ((by_importance.len() as f64 * TOP_SYMBOL_FRACTION).ceil() as usize).max(1);
        for tag in by_importance.into_iter().take(take) {
            chosen.insert(tag.file.as_str());
        }
    }

    // (ii) documentation patterns.
    for (rel, _) in files {
        if is_doc_file(rel) {
            chosen.insert(rel.as_str());
        }
    }

    // (iii) personalization window.
    for rel in recent {
        chosen.insert(rel.as_str());
    }

    let selected: Vec<(String, PathBuf)> = files
        .iter()
        .filter(|(rel, _)| chosen.contains(rel.as_str()))
        .cloned()
        .collect();
    info!(
        candidates = files.len(),
        selected = selected.len(),
        "Selective embedding file set"
    );
    selected
}

// ---------------------------------------------------------------------------
// Indexing run
// ---------------------------------------------------------------------------

/// Run the semantic pipeline over an enumerated file list.
///
/// Per-file failures are recorded and skipped; the batch only fails when the
/// embedding backend stays unreachable past the configured grace period.
/// Nothing is persisted for a file whose embedding did not complete.
#[allow(clippy::too_many_arguments)]
pub fn run_semantic_index(
    store: &Store,
    embedder: &dyn EmbeddingClient,
    tok: &dyn Tokenizer,
    cfg: &Config,
    kb: &KnowledgeBase,
    files: &[(String, PathBuf)],
    selective: bool,
    structure_tags: &[Tag],
    recent: &HashSet<String>,
    ctx: &JobCtx,
) -> CoreResult<SemanticOutcome> {
    let selected = select_files(files, selective, structure_tags, recent);

    // Tags per file feed the code chunker's boundary detection.
    let mut tags_by_file: HashMap<&str, Vec<Tag>> = HashMap::new();
    for tag in structure_tags {
        tags_by_file
            .entry(tag.file.as_str())
            .or_default()
            .push(tag.clone());
    }

    let mut outcome = SemanticOutcome {
        files_selected: selected.len(),
        ..Default::default()
    };
    let grace = Duration::from_secs(cfg.embedder.grace_secs);
    let mut unreachable_since: Option<Instant> = None;

    for (done, (rel, abs)) in selected.iter().enumerate() {
        if ctx.cancelled() {
            info!(kb = kb.slug.as_str(), "Semantic indexing cancelled");
            return Ok(outcome);
        }
        let percent = (done * 100 / selected.len().max(1)) as u8;
        ctx.set_progress(percent, &format!("embedding {rel}"));

        match index_one_file(store, embedder, tok, cfg, kb, rel, abs, &tags_by_file) {
            Ok(FileResult::Embedded { chunks }) => {
                outcome.files_embedded += 1;
                outcome.chunks_written += chunks;
                unreachable_since = None;
            }
            Ok(FileResult::Skipped) => {
                outcome.files_skipped += 1;
            }
            Err(e) if e.kind() == ErrorKind::Dependency => {
                let since = *unreachable_since.get_or_insert_with(Instant::now);
                warn!(file = rel.as_str(), error = %e, "Embedding backend trouble");
                if since.elapsed() >= grace {
                    return Err(CoreError::dependency(format!(
                        "embedding backend unreachable for {}s: {e}",
                        grace.as_secs()
                    )));
                }
                outcome.failures.push((rel.clone(), e.to_string()));
            }
            Err(e) => {
                debug!(file = rel.as_str(), error = %e, "Skipping file after error");
                outcome.failures.push((rel.clone(), e.to_string()));
            }
        }
    }

    ctx.set_progress(100, "semantic index complete");
    info!(
        kb = kb.slug.as_str(),
        embedded = outcome.files_embedded,
        skipped = outcome.files_skipped,
        chunks = outcome.chunks_written,
        failures = outcome.failures.len(),
        "Semantic indexing finished"
    );
    Ok(outcome)
}

enum FileResult {
    Embedded { chunks: usize },
    Skipped,
}

#[allow(clippy::too_many_arguments)]
fn index_one_file(
    store: &Store,
    embedder: &dyn EmbeddingClient,
    tok: &dyn Tokenizer,
    cfg: &Config,
    kb: &KnowledgeBase,
    rel: &str,
    abs: &Path,
    tags_by_file: &HashMap<&str, Vec<Tag>>,
) -> CoreResult<FileResult> {
    let meta = std::fs::metadata(abs)?;
    if meta.len() > MAX_EMBED_BYTES {
        debug!(file = rel, size = meta.len(), "Skipping oversized file");
        return Ok(FileResult::Skipped);
    }
    let bytes = std::fs::read(abs)?;
    if bytes.is_empty() || looks_binary(&bytes) {
        return Ok(FileResult::Skipped);
    }

    // Idempotence: unchanged content embeds nothing.
    let hash = content_hash(&bytes);
    if store.document_hash(kb.id, rel)?.as_deref() == Some(hash.as_str()) {
        return Ok(FileResult::Skipped);
    }

    let text = String::from_utf8_lossy(&bytes).into_owned();
    let class = text_class_for_ext(file_ext(rel));
    let empty = Vec::new();
    let tags = tags_by_file.get(rel).unwrap_or(&empty);
    let pieces = chunker::chunk_document(&text, class, tags, &cfg.chunker, tok);
    if pieces.is_empty() {
        return Ok(FileResult::Skipped);
    }

    // All chunks embed before anything persists; a failure here leaves no
    // partial rows for this file.
    let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
    let embeddings = embedder.embed(&texts)?;

    let chunks = pieces.len();
    store.upsert_document(
        kb.id,
        rel,
        Some(&abs.to_string_lossy()),
        content_type_for(class),
        &hash,
        meta.len(),
        &HashMap::new(),
        &pieces,
        Some(&embeddings),
    )?;
    Ok(FileResult::Embedded { chunks })
}

fn content_type_for(class: TextClass) -> &'static str {
    match class {
        TextClass::Prose => "text/markdown",
        TextClass::Code => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TagKind;

    fn tag(file: &str, name: &str, importance: f64) -> Tag {
        Tag {
            file: file.to_string(),
            name: name.to_string(),
            kind: TagKind::Function,
            line: 1,
            signature: format!("def {name}"),
            language: "ruby".to_string(),
            identifier: name.to_string(),
            importance,
        }
    }

    fn file_list(names: &[&str]) -> Vec<(String, PathBuf)> {
        names
            .iter()
            .map(|n| (n.to_string(), PathBuf::from(format!("/repo/{n}"))))
            .collect()
    }

    #[test]
    fn test_full_mode_selects_everything() {
        let files = file_list(&["a.rb", "b.rb", "c.md"]);
        let selected = select_files(&files, false, &[], &HashSet::new());
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_selective_takes_top_symbol_files() {
        let files = file_list(&["hot.rb", "cold.rb", "lukewarm.rb"]);
        // 10 symbols; top 20% = 2, both in hot.rb.
        let mut tags = vec![tag("hot.rb", "alpha", 0.9), tag("hot.rb", "beta", 0.8)];
        for i in 0..8 {
            tags.push(tag("cold.rb", &format!("minor{i}"), 0.01));
        }
        let selected = select_files(&files, true, &tags, &HashSet::new());
        let names: Vec<&str> = selected.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["hot.rb"]);
    }

    #[test]
    fn test_selective_includes_docs_and_recent() {
        let files = file_list(&["core.rb", "notes.md", "guide.rst", "old.rb"]);
        let tags = vec![tag("core.rb", "main", 0.5)];
        let mut recent = HashSet::new();
        recent.insert("old.rb".to_string());
        let selected = select_files(&files, true, &tags, &recent);
        let names: Vec<&str> = selected.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["core.rb", "guide.rst", "notes.md", "old.rb"]);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let files = file_list(&["z.rb", "a.rb", "m.md"]);
        let tags = vec![tag("z.rb", "zeta", 0.9), tag("a.rb", "alpha", 0.9)];
        let first = select_files(&files, true, &tags, &HashSet::new());
        let second = select_files(&files, true, &tags, &HashSet::new());
        let names = |v: &Vec<(String, PathBuf)>| {
            v.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn test_small_corpus_selects_all_definer_files() {
        // Two files, four symbols: the top-20% cut keeps at least one symbol,
        // and docs keep nothing extra. With equal importance the tie-break
        // keeps selection stable.
        let files = file_list(&["user.rb", "session.rb"]);
        let tags = vec![
            tag("user.rb", "User", 0.4),
            tag("user.rb", "authenticate", 0.4),
            tag("session.rb", "Session", 0.2),
            tag("session.rb", "user", 0.2),
        ];
        let selected = select_files(&files, true, &tags, &HashSet::new());
        assert!(!selected.is_empty());
        assert_eq!(selected[0].0, "user.rb");
    }
}
