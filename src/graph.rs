//! File dependency graph and weighted PageRank ranking.
//!
//! Nodes are files. Reference edges come from occurrences of known definer
//! names in other files' token streams. Rank mass flows from referrer to
//! definer, so heavily referenced files rise.

use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::config::RankSettings;
use crate::types::{DepEdge, EdgeKind, Tag};

const DAMPING: f64 = 0.85;
const TOLERANCE: f64 = 1e-6;
const MAX_ITERATIONS: usize = 100;

/// Identifiers shorter than this are ignored by the reference scanner.
const MIN_IDENT_CHARS: usize = 3;

/// Identifier length that marks a file as carrying long identifiers for the
/// personalization boost.
const LONG_IDENT_CHARS: usize = 8;

// ---------------------------------------------------------------------------
// Reference scanning
// ---------------------------------------------------------------------------

/// Result of scanning file contents for definer-name occurrences.
pub struct ReferenceScan {
    /// Collapsed edges: one weighted edge per (definer_file, referrer_file).
    pub edges: Vec<DepEdge>,
    /// (file, symbol name) → number of references from other files.
    pub symbol_refs: HashMap<(String, String), usize>,
}

/// Scan `files` (rel_path, content) for occurrences of definer names taken
/// from `tags`. Self-references are dropped; multi-edges collapse to one
/// weighted edge per ordered pair.
pub fn scan_references(files: &[(String, String)], tags: &[Tag]) -> ReferenceScan {
    // Definer name → files defining it.
    let mut definers: HashMap<&str, Vec<&Tag>> = HashMap::new();
    for tag in tags.iter().filter(|t| t.kind.is_definer()) {
        if tag.name.chars().count() >= MIN_IDENT_CHARS {
            definers.entry(tag.name.as_str()).or_default().push(tag);
        }
    }

    let ident_re = Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}").unwrap();

    let mut collapsed: HashMap<(String, String), (String, String, f64)> = HashMap::new();
    let mut symbol_refs: HashMap<(String, String), usize> = HashMap::new();

    for (referrer, content) in files {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for m in ident_re.find_iter(content) {
            let word = m.as_str();
            if definers.contains_key(word) {
                *counts.entry(word).or_default() += 1;
            }
        }

        for (name, count) in counts {
            for def_tag in &definers[name] {
                if def_tag.file == *referrer {
                    continue;
                }
                *symbol_refs
                    .entry((def_tag.file.clone(), def_tag.name.clone()))
                    .or_default() += count;
                let key = (def_tag.file.clone(), referrer.clone());
                let entry = collapsed.entry(key).or_insert_with(|| {
                    (def_tag.name.clone(), referrer.clone(), 0.0)
                });
                entry.2 += count as f64;
            }
        }
    }

    let mut edges: Vec<DepEdge> = collapsed
        .into_iter()
        .map(|((definer_file, referrer_file), (symbol, _, weight))| DepEdge {
            from_file: definer_file,
            from_symbol: symbol,
            to_file: referrer_file,
            to_symbol: String::new(),
            kind: EdgeKind::References,
            weight,
        })
        .collect();
    edges.sort_by(|a, b| {
        (&a.from_file, &a.to_file).cmp(&(&b.from_file, &b.to_file))
    });

    ReferenceScan { edges, symbol_refs }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Directed file graph. Edge direction here is referrer → definer: rank
/// flows toward the files that define what others use.
pub struct FileGraph {
    graph: DiGraph<String, f64>,
    index: HashMap<String, NodeIndex>,
}

impl FileGraph {
    pub fn build<'a>(files: impl IntoIterator<Item = &'a str>, edges: &[DepEdge]) -> FileGraph {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for file in files {
            if !index.contains_key(file) {
                let idx = graph.add_node(file.to_string());
                index.insert(file.to_string(), idx);
            }
        }

        // Aggregate per ordered pair; the stored edge is definer → referrer,
        // the rank edge is the reverse. BTreeMap keeps edge insertion (and so
        // the floating-point accumulation order) deterministic across runs.
        let mut weights: std::collections::BTreeMap<(usize, usize), f64> =
            std::collections::BTreeMap::new();
        for edge in edges {
            let (Some(&definer), Some(&referrer)) =
                (index.get(&edge.from_file), index.get(&edge.to_file))
            else {
                continue;
            };
            if definer == referrer {
                continue;
            }
            *weights
                .entry((referrer.index(), definer.index()))
                .or_default() += edge.weight.max(0.0);
        }
        for ((src, dst), w) in weights {
            graph.add_edge(NodeIndex::new(src), NodeIndex::new(dst), w);
        }

        FileGraph { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Weighted PageRank with optional personalization. Absent
    /// personalization, teleportation is uniform.
    pub fn pagerank(&self, personalization: Option<&HashMap<String, f64>>) -> HashMap<String, f64> {
        let n = self.graph.node_count();
        if n == 0 {
            return HashMap::new();
        }

        // Normalized teleport vector.
        let mut teleport = vec![1.0 / n as f64; n];
        if let Some(pers) = personalization {
            let mut raw = vec![1.0f64; n];
            for (file, boost) in pers {
                if let Some(&idx) = self.index.get(file) {
                    raw[idx.index()] = boost.max(0.0);
                }
            }
            let total: f64 = raw.iter().sum();
            if total > 0.0 {
                for (t, r) in teleport.iter_mut().zip(raw.iter()) {
                    *t = r / total;
                }
            }
        }

        // Per-node outgoing weight sums.
        let mut out_weight = vec![0.0f64; n];
        for edge in self.graph.edge_indices() {
            let (src, _) = self.graph.edge_endpoints(edge).unwrap();
            out_weight[src.index()] += self.graph[edge];
        }

        let mut ranks = teleport.clone();
        let mut next = vec![0.0f64; n];

        for iteration in 0..MAX_ITERATIONS {
            let mut dangling = 0.0;
            for i in 0..n {
                if out_weight[i] == 0.0 {
                    dangling += ranks[i];
                }
            }

            for i in 0..n {
                next[i] = (1.0 - DAMPING + DAMPING * dangling) * teleport[i];
            }

            for edge in self.graph.edge_indices() {
                let (src, dst) = self.graph.edge_endpoints(edge).unwrap();
                let w = self.graph[edge];
                if out_weight[src.index()] > 0.0 {
                    next[dst.index()] +=
                        DAMPING * ranks[src.index()] * w / out_weight[src.index()];
                }
            }

            let delta: f64 = ranks
                .iter()
                .zip(next.iter())
                .map(|(a, b)| (a - b).abs())
                .sum();
            std::mem::swap(&mut ranks, &mut next);
            if delta < TOLERANCE {
                debug!(iterations = iteration + 1, "PageRank converged");
                break;
            }
        }

        self.index
            .iter()
            .map(|(file, idx)| (file.clone(), ranks[idx.index()]))
            .collect()
    }

    /// Files referenced by others while referencing few themselves
    /// (in-degree ≥ 1 as definer, out-degree ≤ 2 as referrer).
    pub fn hub_files(&self) -> HashSet<String> {
        let mut hubs = HashSet::new();
        for (file, &idx) in &self.index {
            let incoming = self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Incoming)
                .count();
            let outgoing = self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Outgoing)
                .count();
            if incoming >= 1 && outgoing <= 2 {
                hubs.insert(file.clone());
            }
        }
        hubs
    }
}

// ---------------------------------------------------------------------------
// Personalization
// ---------------------------------------------------------------------------

/// Multiplicative per-file boosts feeding the teleport vector. Weights are
/// configurable; defaults are chat ×50, recent ×10, long identifiers ×10,
/// hub ×5.
pub fn build_personalization(
    settings: &RankSettings,
    all_files: &[String],
    chat_files: &HashSet<String>,
    recent_files: &HashSet<String>,
    tags: &[Tag],
    graph: &FileGraph,
) -> HashMap<String, f64> {
    let mut long_ident_files: HashSet<&str> = HashSet::new();
    for tag in tags {
        if tag.name.chars().count() >= LONG_IDENT_CHARS {
            long_ident_files.insert(tag.file.as_str());
        }
    }
    let hubs = graph.hub_files();

    let mut boosts = HashMap::with_capacity(all_files.len());
    for file in all_files {
        let mut boost = 1.0;
        if chat_files.contains(file) {
            boost *= settings.chat_boost;
        }
        if recent_files.contains(file) {
            boost *= settings.recent_boost;
        }
        if long_ident_files.contains(file.as_str()) {
            boost *= settings.long_ident_boost;
        }
        if hubs.contains(file) {
            boost *= settings.hub_boost;
        }
        boosts.insert(file.clone(), boost);
    }
    boosts
}

/// Files with a git commit within the personalization window. Returns an
/// empty set when the root is not a repository.
pub fn recent_files(root: &Path, days: i64) -> HashSet<String> {
    let repo = match git2::Repository::open(root) {
        Ok(r) => r,
        Err(_) => return HashSet::new(),
    };
    let mut revwalk = match repo.revwalk() {
        Ok(w) => w,
        Err(_) => return HashSet::new(),
    };
    if revwalk.push_head().is_err() {
        return HashSet::new();
    }
    let _ = revwalk.set_sorting(git2::Sort::TIME);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let cutoff = now - days * 86_400;

    let mut touched = HashSet::new();
    for oid in revwalk {
        let Ok(oid) = oid else { continue };
        let Ok(commit) = repo.find_commit(oid) else {
            continue;
        };
        if commit.time().seconds() < cutoff {
            break;
        }
        let Ok(tree) = commit.tree() else { continue };
        let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());
        let Ok(diff) = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None) else {
            continue;
        };
        let _ = diff.foreach(
            &mut |delta, _| {
                if let Some(path) = delta.new_file().path().and_then(|p| p.to_str()) {
                    touched.insert(path.to_string());
                }
                true
            },
            None,
            None,
            None,
        );
    }
    touched
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Assign importance (file rank × (1 + ln(references))) and return tags in
/// rank order. Tie-break: higher score, then (file, line) ascending.
pub fn rank_tags(
    mut tags: Vec<Tag>,
    ranks: &HashMap<String, f64>,
    symbol_refs: &HashMap<(String, String), usize>,
) -> Vec<Tag> {
    for tag in &mut tags {
        let file_rank = ranks.get(&tag.file).copied().unwrap_or(0.0);
        let refs = symbol_refs
            .get(&(tag.file.clone(), tag.name.clone()))
            .copied()
            .unwrap_or(0);
        tag.importance = file_rank * (1.0 + (refs as f64).max(0.0).ln_1p());
    }
    tags.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.file.cmp(&b.file))
            .then_with(|| a.line.cmp(&b.line))
    });
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TagKind;

    fn tag(file: &str, name: &str, kind: TagKind, line: usize) -> Tag {
        Tag {
            file: file.to_string(),
            name: name.to_string(),
            kind,
            line,
            signature: name.to_string(),
            language: "ruby".to_string(),
            identifier: name.to_ascii_lowercase(),
            importance: 0.0,
        }
    }

    fn ruby_fixture() -> (Vec<(String, String)>, Vec<Tag>) {
        let files = vec![
            (
                "user.rb".to_string(),
                "class User\n  def authenticate\n  end\nend\n".to_string(),
            ),
            (
                "session.rb".to_string(),
                "class Session\n  def user\n    User.authenticate\n  end\nend\n".to_string(),
            ),
        ];
        let tags = vec![
            tag("user.rb", "User", TagKind::Class, 1),
            tag("user.rb", "authenticate", TagKind::Method, 2),
            tag("session.rb", "Session", TagKind::Class, 1),
            tag("session.rb", "user", TagKind::Method, 2),
        ];
        (files, tags)
    }

    #[test]
    fn test_reference_scan_collapses_edges() {
        let (files, tags) = ruby_fixture();
        let scan = scan_references(&files, &tags);

        // Both `User` and `authenticate` occur in session.rb, collapsed to a
        // single weighted edge user.rb → session.rb.
        assert_eq!(scan.edges.len(), 1);
        let edge = &scan.edges[0];
        assert_eq!(edge.from_file, "user.rb");
        assert_eq!(edge.to_file, "session.rb");
        assert!(edge.weight >= 2.0);
        assert_eq!(edge.kind, EdgeKind::References);
    }

    #[test]
    fn test_self_references_dropped() {
        let files = vec![(
            "solo.rb".to_string(),
            "class Solo\n  def run\n    Solo.run\n  end\nend\n".to_string(),
        )];
        let tags = vec![
            tag("solo.rb", "Solo", TagKind::Class, 1),
            tag("solo.rb", "run", TagKind::Method, 2),
        ];
        let scan = scan_references(&files, &tags);
        assert!(scan.edges.is_empty());
    }

    #[test]
    fn test_pagerank_favors_definer() {
        let (files, tags) = ruby_fixture();
        let scan = scan_references(&files, &tags);
        let graph = FileGraph::build(files.iter().map(|(f, _)| f.as_str()), &scan.edges);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);

        let ranks = graph.pagerank(None);
        assert!(
            ranks["user.rb"] > ranks["session.rb"],
            "definer should outrank referrer: {ranks:?}"
        );
    }

    #[test]
    fn test_pagerank_empty_graph() {
        let graph = FileGraph::build(std::iter::empty::<&str>(), &[]);
        assert!(graph.pagerank(None).is_empty());
    }

    #[test]
    fn test_pagerank_sums_to_one() {
        let (files, tags) = ruby_fixture();
        let scan = scan_references(&files, &tags);
        let graph = FileGraph::build(files.iter().map(|(f, _)| f.as_str()), &scan.edges);
        let total: f64 = graph.pagerank(None).values().sum();
        assert!((total - 1.0).abs() < 1e-6, "ranks should sum to 1, got {total}");
    }

    #[test]
    fn test_personalization_boost_shifts_rank() {
        let files: Vec<(String, String)> = vec![
            ("a.rb".to_string(), "class Alpha\nend\n".to_string()),
            ("b.rb".to_string(), "class Beta\nend\n".to_string()),
        ];
        let tags = vec![
            tag("a.rb", "Alpha", TagKind::Class, 1),
            tag("b.rb", "Beta", TagKind::Class, 1),
        ];
        let scan = scan_references(&files, &tags);
        let graph = FileGraph::build(files.iter().map(|(f, _)| f.as_str()), &scan.edges);

        let mut boosts = HashMap::new();
        boosts.insert("a.rb".to_string(), 50.0);
        let ranks = graph.pagerank(Some(&boosts));
        assert!(ranks["a.rb"] > ranks["b.rb"]);
    }

    #[test]
    fn test_rank_tags_tiebreak_is_stable() {
        let tags = vec![
            tag("b.rb", "Two", TagKind::Class, 5),
            tag("a.rb", "One", TagKind::Class, 9),
            tag("a.rb", "Zero", TagKind::Class, 2),
        ];
        // Identical file ranks → order by (file, line).
        let mut ranks = HashMap::new();
        ranks.insert("a.rb".to_string(), 0.5);
        ranks.insert("b.rb".to_string(), 0.5);
        let ranked = rank_tags(tags, &ranks, &HashMap::new());
        let order: Vec<(&str, usize)> = ranked.iter().map(|t| (t.file.as_str(), t.line)).collect();
        assert_eq!(order, vec![("a.rb", 2), ("a.rb", 9), ("b.rb", 5)]);
    }

    #[test]
    fn test_symbol_importance_grows_with_references() {
        let (files, tags) = ruby_fixture();
        let scan = scan_references(&files, &tags);
        let graph = FileGraph::build(files.iter().map(|(f, _)| f.as_str()), &scan.edges);
        let ranks = graph.pagerank(None);
        let ranked = rank_tags(tags, &ranks, &scan.symbol_refs);

        let user = ranked.iter().find(|t| t.name == "User").unwrap();
        let session = ranked.iter().find(|t| t.name == "Session").unwrap();
        assert!(user.importance > session.importance);
    }

    #[test]
    fn test_recent_files_non_repo_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(recent_files(dir.path(), 30).is_empty());
    }
}
