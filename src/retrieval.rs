//! Retrieval engine: dense vector scoring, BM25, hybrid fusion, and an
//! optional cross-encoder rerank of the leading candidates.
//!
//! Queries run against a store snapshot taken at query start; ingestion
//! committed afterwards does not affect an in-flight query.

use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

use crate::embedder::{EmbeddingClient, RERANK_WINDOW};
use crate::error::{CoreError, CoreResult};
use crate::store::{ChunkRow, Snapshot};
use crate::types::KnowledgeBase;

pub const DEFAULT_K: usize = 5;
pub const MAX_K: usize = 200;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub k: usize,
    pub use_vector: bool,
    pub use_bm25: bool,
    pub use_rerank: bool,
    /// Every key must match the document metadata exactly.
    pub filter: Option<HashMap<String, String>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            k: DEFAULT_K,
            use_vector: true,
            use_bm25: false,
            use_rerank: false,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredChunk {
    pub chunk_id: i64,
    pub document_id: i64,
    pub filename: String,
    pub ordinal: usize,
    pub text: String,
    pub score: f64,
    pub vector_score: Option<f64>,
    pub bm25_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Lowercased alphanumeric terms of length ≥ 2. Shared with the store's
/// incremental document-frequency maintenance so index- and query-time
/// tokenization agree.
pub fn tokenize_terms(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            if current.chars().count() >= 2 {
                terms.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.chars().count() >= 2 {
        terms.push(current);
    }
    terms
}

/// Cosine similarity over normalized copies; range [-1, 1].
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let norm_a: f64 = a.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| *x as f64 * *y as f64)
        .sum();
    dot / (norm_a * norm_b)
}

fn bm25_term_score(tf: f64, df: f64, n_chunks: f64, dl: f64, avgdl: f64) -> f64 {
    if tf <= 0.0 {
        return 0.0;
    }
    let idf = (((n_chunks - df + 0.5) / (df + 0.5)) + 1.0).ln().max(0.0);
    let denom_len = if avgdl > 0.0 { dl / avgdl } else { 1.0 };
    idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * denom_len))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

struct Candidate {
    row_idx: usize,
    vector: Option<f64>,
    bm25: Option<f64>,
    score: f64,
}

/// Run a retrieval query against a snapshot.
///
/// `deadline` is the soft budget: once passed, the rerank stage is skipped
/// and whatever scored list exists is returned.
pub fn query(
    snapshot: &Snapshot,
    kb: &KnowledgeBase,
    text: &str,
    opts: &QueryOptions,
    embedder: &dyn EmbeddingClient,
    deadline: Instant,
) -> CoreResult<Vec<ScoredChunk>> {
    if opts.k == 0 {
        return Ok(Vec::new());
    }
    if !opts.use_vector && !opts.use_bm25 {
        return Err(CoreError::validation(
            "at least one of use_vector/use_bm25 must be enabled",
        ));
    }
    let k = opts.k.min(MAX_K);

    let mut rows = snapshot.chunk_rows(kb.id)?;
    if let Some(filter) = &opts.filter {
        rows.retain(|row| {
            filter
                .iter()
                .all(|(key, want)| row.metadata.get(key).map(|v| v == want).unwrap_or(false))
        });
    }
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    // Dense scores.
    let vector_scores: Option<Vec<Option<f64>>> = if opts.use_vector {
        let query_vec = embedder.embed_one(text)?;
        if kb.dimension != 0 && query_vec.len() != kb.dimension {
            return Err(CoreError::validation(format!(
                "query embedding dimension {} does not match KB dimension {}",
                query_vec.len(),
                kb.dimension
            )));
        }
        Some(
            rows.iter()
                .map(|row| {
                    row.embedding.as_ref().map(|emb| {
                        if emb.len() != query_vec.len() {
                            return f64::NEG_INFINITY;
                        }
                        cosine(&query_vec, emb)
                    })
                })
                .collect(),
        )
    } else {
        None
    };
    if let Some(scores) = &vector_scores {
        if scores
            .iter()
            .any(|s| matches!(s, Some(v) if v.is_infinite()))
        {
            return Err(CoreError::validation(format!(
                "stored embedding dimension differs from KB dimension {}",
                kb.dimension
            )));
        }
    }

    // Lexical scores.
    let bm25_scores: Option<Vec<Option<f64>>> = if opts.use_bm25 {
        let terms = tokenize_terms(text);
        let stats = snapshot.bm_stats(kb.id)?;
        let dfs = snapshot.term_df(kb.id, &terms)?;
        Some(
            rows.iter()
                .map(|row| Some(score_bm25_row(row, &terms, &dfs, stats.chunk_count, stats.avg_tokens())))
                .collect(),
        )
    } else {
        None
    };

    // Candidate pool and fusion.
    let pool_size = 50usize.max(10 * k);
    let mut candidates = build_candidates(&rows, &vector_scores, &bm25_scores, pool_size);

    sort_candidates(&mut candidates, &rows);

    // Optional rerank of the leading window, skipped past the deadline.
    if opts.use_rerank {
        if Instant::now() >= deadline {
            warn!("Query deadline passed, skipping rerank");
        } else {
            let window = candidates.len().min(RERANK_WINDOW);
            let texts: Vec<String> = candidates[..window]
                .iter()
                .map(|c| rows[c.row_idx].text.clone())
                .collect();
            match embedder.rerank(text, &texts) {
                Ok(scores) => {
                    for (candidate, score) in candidates[..window].iter_mut().zip(scores) {
                        candidate.score = score as f64;
                    }
                    candidates.truncate(window);
                    sort_candidates(&mut candidates, &rows);
                }
                Err(e) => {
                    debug!(error = %e, "Rerank unavailable, keeping fused order");
                }
            }
        }
    }

    candidates.truncate(k);
    Ok(candidates
        .into_iter()
        .map(|c| {
            let row = &rows[c.row_idx];
            ScoredChunk {
                chunk_id: row.chunk_id,
                document_id: row.document_id,
                filename: row.filename.clone(),
                ordinal: row.ordinal,
                text: row.text.clone(),
                score: c.score,
                vector_score: c.vector,
                bm25_score: c.bm25,
            }
        })
        .collect())
}

fn score_bm25_row(
    row: &ChunkRow,
    terms: &[String],
    dfs: &HashMap<String, i64>,
    n_chunks: i64,
    avgdl: f64,
) -> f64 {
    if terms.is_empty() || n_chunks == 0 {
        return 0.0;
    }
    let row_terms = tokenize_terms(&row.text);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in &row_terms {
        *counts.entry(t.as_str()).or_default() += 1;
    }
    let dl = row.token_count as f64;
    terms
        .iter()
        .map(|term| {
            let tf = counts.get(term.as_str()).copied().unwrap_or(0) as f64;
            let df = dfs.get(term).copied().unwrap_or(0) as f64;
            bm25_term_score(tf, df, n_chunks as f64, dl, avgdl)
        })
        .sum()
}

/// Min-max fuse vector and BM25 scores over the candidate pool.
fn build_candidates(
    rows: &[ChunkRow],
    vector_scores: &Option<Vec<Option<f64>>>,
    bm25_scores: &Option<Vec<Option<f64>>>,
    pool_size: usize,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = (0..rows.len())
        .map(|i| Candidate {
            row_idx: i,
            vector: vector_scores.as_ref().and_then(|v| v[i]),
            bm25: bm25_scores.as_ref().and_then(|v| v[i]),
            score: 0.0,
        })
        .filter(|c| c.vector.is_some() || c.bm25.is_some())
        .collect();

    let hybrid = vector_scores.is_some() && bm25_scores.is_some();
    if hybrid {
        // Pool = the strongest `pool_size` by either signal.
        let mut keep: Vec<bool> = vec![false; rows.len()];
        let mut by_vec: Vec<&Candidate> =
            candidates.iter().filter(|c| c.vector.is_some()).collect();
        by_vec.sort_by(|a, b| b.vector.partial_cmp(&a.vector).unwrap_or(std::cmp::Ordering::Equal));
        for c in by_vec.into_iter().take(pool_size) {
            keep[c.row_idx] = true;
        }
        let mut by_bm: Vec<&Candidate> = candidates.iter().filter(|c| c.bm25.is_some()).collect();
        by_bm.sort_by(|a, b| b.bm25.partial_cmp(&a.bm25).unwrap_or(std::cmp::Ordering::Equal));
        for c in by_bm.into_iter().take(pool_size) {
            keep[c.row_idx] = true;
        }
        candidates.retain(|c| keep[c.row_idx]);

        let norm = |values: Vec<Option<f64>>| -> Vec<f64> {
            let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
            let min = present.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = present.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            values
                .into_iter()
                .map(|v| match v {
                    Some(v) if max > min => (v - min) / (max - min),
                    Some(_) => 1.0,
                    None => 0.0,
                })
                .collect()
        };
        let vec_norm = norm(candidates.iter().map(|c| c.vector).collect());
        let bm_norm = norm(candidates.iter().map(|c| c.bm25).collect());
        for (i, candidate) in candidates.iter_mut().enumerate() {
            candidate.score = 0.5 * vec_norm[i] + 0.5 * bm_norm[i];
        }
    } else {
        for candidate in &mut candidates {
            candidate.score = candidate.vector.or(candidate.bm25).unwrap_or(0.0);
        }
    }
    candidates
}

/// Higher score first, then filename, then ordinal.
fn sort_candidates(candidates: &mut [Candidate], rows: &[ChunkRow]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rows[a.row_idx].filename.cmp(&rows[b.row_idx].filename))
            .then_with(|| rows[a.row_idx].ordinal.cmp(&rows[b.row_idx].ordinal))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use crate::store::Store;
    use crate::types::KbType;
    use std::time::Duration;

    fn seeded_store() -> (tempfile::TempDir, Store, KnowledgeBase) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("store.db")).unwrap();
        let kb = store.create_kb("kb", KbType::Code, "", 0).unwrap();
        let embedder = HashEmbedder::new(32);

        let docs: &[(&str, &str)] = &[
            ("user.rb", "class User\n  def authenticate\n    check_password\n  end\nend"),
            ("session.rb", "class Session\n  def user\n    User.authenticate\n  end\nend"),
            ("readme.md", "This project manages walrus habitats and nothing else."),
        ];
        for (name, body) in docs {
            let pieces = vec![crate::chunker::ChunkPiece {
                text: body.to_string(),
                start_byte: 0,
                end_byte: body.len(),
                token_count: body.len() / 3 + 1,
            }];
            let embs = embedder
                .embed(&pieces.iter().map(|p| p.text.clone()).collect::<Vec<_>>())
                .unwrap();
            store
                .upsert_document(
                    kb.id,
                    name,
                    None,
                    "text/plain",
                    &crate::types::content_hash(body.as_bytes()),
                    body.len() as u64,
                    &HashMap::new(),
                    &pieces,
                    Some(&embs),
                )
                .unwrap();
        }
        let kb = store.resolve_kb("kb").unwrap();
        (dir, store, kb)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(20)
    }

    #[test]
    fn test_tokenize_terms() {
        assert_eq!(
            tokenize_terms("User.authenticate(password)!"),
            vec!["user", "authenticate", "password"]
        );
        assert!(tokenize_terms("a ! b").is_empty());
    }

    #[test]
    fn test_cosine_range() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_k_zero_returns_empty() {
        let (_dir, store, kb) = seeded_store();
        let snap = store.snapshot().unwrap();
        let embedder = HashEmbedder::new(32);
        let opts = QueryOptions {
            k: 0,
            ..Default::default()
        };
        let hits = query(&snap, &kb, "anything", &opts, &embedder, far_deadline()).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_vector_query_ranks_relevant_chunk_first() {
        let (_dir, store, kb) = seeded_store();
        let snap = store.snapshot().unwrap();
        let embedder = HashEmbedder::new(32);
        let hits = query(
            &snap,
            &kb,
            "authenticate",
            &QueryOptions::default(),
            &embedder,
            far_deadline(),
        )
        .unwrap();
        assert!(!hits.is_empty());
        assert_ne!(hits[0].filename, "readme.md");
    }

    #[test]
    fn test_hybrid_query_prefers_exact_term() {
        let (_dir, store, kb) = seeded_store();
        let snap = store.snapshot().unwrap();
        let embedder = HashEmbedder::new(32);
        let opts = QueryOptions {
            k: 3,
            use_vector: true,
            use_bm25: true,
            ..Default::default()
        };
        let hits = query(&snap, &kb, "authenticate", &opts, &embedder, far_deadline()).unwrap();
        assert_eq!(hits[0].filename, "user.rb", "hits: {:?}",
            hits.iter().map(|h| (&h.filename, h.score)).collect::<Vec<_>>());
        assert!(hits[0].bm25_score.unwrap() > 0.0);
    }

    #[test]
    fn test_bm25_only_scores_lexically() {
        let (_dir, store, kb) = seeded_store();
        let snap = store.snapshot().unwrap();
        let embedder = HashEmbedder::new(32);
        let opts = QueryOptions {
            use_vector: false,
            use_bm25: true,
            ..Default::default()
        };
        let hits = query(&snap, &kb, "walrus habitats", &opts, &embedder, far_deadline()).unwrap();
        assert_eq!(hits[0].filename, "readme.md");
    }

    #[test]
    fn test_no_scoring_mode_is_validation() {
        let (_dir, store, kb) = seeded_store();
        let snap = store.snapshot().unwrap();
        let embedder = HashEmbedder::new(32);
        let opts = QueryOptions {
            use_vector: false,
            use_bm25: false,
            ..Default::default()
        };
        let err = query(&snap, &kb, "x", &opts, &embedder, far_deadline()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_dimension_mismatch_detected() {
        let (_dir, store, kb) = seeded_store();
        let snap = store.snapshot().unwrap();
        // Query embedder disagrees with the stored dimension of 32.
        let embedder = HashEmbedder::new(16);
        let err = query(
            &snap,
            &kb,
            "authenticate",
            &QueryOptions::default(),
            &embedder,
            far_deadline(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_metadata_filter_narrows_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("store.db")).unwrap();
        let kb = store.create_kb("kb", KbType::Generic, "", 0).unwrap();
        let embedder = HashEmbedder::new(16);
        for (name, team) in [("a.md", "core"), ("b.md", "infra")] {
            let text = format!("shared words about deployment in {name}");
            let mut meta = HashMap::new();
            meta.insert("team".to_string(), team.to_string());
            let pieces = vec![crate::chunker::ChunkPiece {
                text: text.clone(),
                start_byte: 0,
                end_byte: text.len(),
                token_count: 8,
            }];
            let embs = embedder.embed(&[text]).unwrap();
            store
                .upsert_document(kb.id, name, None, "text/markdown", name, 1,
                    &meta, &pieces, Some(&embs))
                .unwrap();
        }
        let kb = store.resolve_kb("kb").unwrap();
        let snap = store.snapshot().unwrap();
        let mut filter = HashMap::new();
        filter.insert("team".to_string(), "infra".to_string());
        let opts = QueryOptions {
            filter: Some(filter),
            ..Default::default()
        };
        let hits = query(&snap, &kb, "deployment", &opts, &embedder, far_deadline()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filename, "b.md");
    }

    #[test]
    fn test_tiebreak_filename_then_ordinal() {
        let row = |chunk_id: i64, document_id: i64, filename: &str, ordinal: usize| ChunkRow {
            chunk_id,
            document_id,
            filename: filename.to_string(),
            ordinal,
            text: String::new(),
            start_byte: 0,
            end_byte: 0,
            token_count: 1,
            embedding: None,
            metadata: HashMap::new(),
        };
        let mut rows = vec![row(1, 1, "b.md", 0), row(2, 2, "a.md", 1), row(3, 2, "a.md", 0)];
        rows.sort_by_key(|r| r.chunk_id);
        let mut candidates: Vec<Candidate> = (0..3)
            .map(|i| Candidate {
                row_idx: i,
                vector: None,
                bm25: Some(1.0),
                score: 1.0,
            })
            .collect();
        sort_candidates(&mut candidates, &rows);
        let order: Vec<(&str, usize)> = candidates
            .iter()
            .map(|c| (rows[c.row_idx].filename.as_str(), rows[c.row_idx].ordinal))
            .collect();
        assert_eq!(order, vec![("a.md", 0), ("a.md", 1), ("b.md", 0)]);
    }

    #[test]
    fn test_rerank_reorders_top_candidates() {
        let (_dir, store, kb) = seeded_store();
        let snap = store.snapshot().unwrap();
        let embedder = HashEmbedder::new(32);
        let opts = QueryOptions {
            k: 2,
            use_rerank: true,
            ..Default::default()
        };
        // HashEmbedder's rerank is its own similarity, so this mostly checks
        // the plumbing: no error, k respected, scores replaced.
        let hits = query(&snap, &kb, "authenticate", &opts, &embedder, far_deadline()).unwrap();
        assert!(hits.len() <= 2);
    }
}
