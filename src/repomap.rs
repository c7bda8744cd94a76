//! Repo-map rendering: fit the largest prefix of ranked tags into a token
//! budget via binary search.
//!
//! Rendering groups tags by file in rank order; each file is headed by its
//! path and followed by `  <line>: <signature>` lines sorted ascending.

use std::collections::BTreeMap;

use crate::tokenizer::{TextClass, Tokenizer};
use crate::types::{now_ts, RepoMapArtifact, Tag};

/// Accept a prefix whose token count is within this fraction of the budget.
const FIT_SLACK: f64 = 0.15;

/// Render the first `k` ranked tags.
pub fn render_prefix(ranked: &[Tag], k: usize) -> String {
    let prefix = &ranked[..k.min(ranked.len())];

    // Files appear in the order their best tag ranks; lines sort ascending
    // within a file.
    let mut file_order: Vec<&str> = Vec::new();
    let mut per_file: BTreeMap<&str, Vec<&Tag>> = BTreeMap::new();
    for tag in prefix {
        if !per_file.contains_key(tag.file.as_str()) {
            file_order.push(tag.file.as_str());
        }
        per_file.entry(tag.file.as_str()).or_default().push(tag);
    }

    let mut out = String::new();
    for file in file_order {
        let mut tags = per_file.remove(file).unwrap_or_default();
        tags.sort_by_key(|t| t.line);
        out.push_str(file);
        out.push('\n');
        for tag in tags {
            out.push_str(&format!("  {}: {}\n", tag.line, tag.signature));
        }
        out.push('\n');
    }
    // Single trailing newline.
    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

/// Fit ranked tags into `budget` tokens. Binary-searches the prefix size;
/// when even the single best file header does not fit, emits it anyway and
/// flags overflow.
pub fn emit(ranked: &[Tag], budget: usize, tok: &dyn Tokenizer) -> RepoMapArtifact {
    if ranked.is_empty() {
        return RepoMapArtifact {
            text: String::new(),
            token_count: 0,
            budget,
            overflow: false,
            tag_count: 0,
            generated_at: now_ts(),
        };
    }

    let count = |k: usize| -> usize { tok.count(&render_prefix(ranked, k), TextClass::Code) };

    // Largest k with count(k) <= budget.
    let mut lo = 0usize;
    let mut hi = ranked.len();
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if count(mid) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let mut best = lo;

    // Within-slack acceptance: one more tag that lands within 15% of the
    // budget still fits.
    if best < ranked.len() {
        let next = count(best + 1);
        if next as f64 <= budget as f64 * (1.0 + FIT_SLACK) {
            best += 1;
        }
    }

    if best == 0 {
        // Nothing fits: emit the highest-ranked file header alone.
        let header = format!("{}\n", ranked[0].file);
        let tokens = tok.count(&header, TextClass::Code);
        return RepoMapArtifact {
            text: header,
            token_count: tokens,
            budget,
            overflow: true,
            tag_count: 0,
            generated_at: now_ts(),
        };
    }

    let text = render_prefix(ranked, best);
    let token_count = tok.count(&text, TextClass::Code);
    RepoMapArtifact {
        text,
        token_count,
        budget,
        overflow: false,
        tag_count: best,
        generated_at: now_ts(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::EstimateTokenizer;
    use crate::types::TagKind;

    fn tag(file: &str, name: &str, line: usize, importance: f64) -> Tag {
        Tag {
            file: file.to_string(),
            name: name.to_string(),
            kind: TagKind::Function,
            line,
            signature: format!("def {name}"),
            language: "ruby".to_string(),
            identifier: name.to_ascii_lowercase(),
            importance,
        }
    }

    #[test]
    fn test_empty_corpus_renders_empty() {
        let tok = EstimateTokenizer;
        let map = emit(&[], 1024, &tok);
        assert_eq!(map.text, "");
        assert_eq!(map.token_count, 0);
        assert!(!map.overflow);
    }

    #[test]
    fn test_render_groups_by_file_lines_ascending() {
        let ranked = vec![
            tag("user.rb", "authenticate", 2, 0.9),
            tag("user.rb", "User", 1, 0.8),
            tag("session.rb", "Session", 1, 0.5),
        ];
        let text = render_prefix(&ranked, 3);
        let user_pos = text.find("user.rb").unwrap();
        let session_pos = text.find("session.rb").unwrap();
        assert!(user_pos < session_pos, "rank order decides file order");

        let line1 = text.find("  1: ").unwrap();
        let line2 = text.find("  2: ").unwrap();
        assert!(line1 < line2, "lines ascend within a file");
    }

    #[test]
    fn test_emit_fits_budget() {
        let tok = EstimateTokenizer;
        let ranked: Vec<Tag> = (0..200)
            .map(|i| tag(&format!("file_{i:03}.rb"), &format!("method_{i}"), 1, 1.0 / (i + 1) as f64))
            .collect();
        let map = emit(&ranked, 100, &tok);
        assert!(map.token_count <= (100.0 * 1.15) as usize);
        assert!(!map.overflow);
        assert!(map.tag_count > 0);
        assert!(map.tag_count < 200);
    }

    #[test]
    fn test_emit_large_budget_takes_everything() {
        let tok = EstimateTokenizer;
        let ranked = vec![
            tag("user.rb", "User", 1, 0.9),
            tag("session.rb", "Session", 1, 0.5),
        ];
        let map = emit(&ranked, 1024, &tok);
        assert_eq!(map.tag_count, 2);
        assert!(map.text.contains("user.rb"));
        assert!(map.text.contains("session.rb"));
        assert!(map.text.find("user.rb").unwrap() < map.text.find("session.rb").unwrap());
    }

    #[test]
    fn test_emit_overflow_single_header() {
        let tok = EstimateTokenizer;
        let ranked = vec![tag(
            "deeply/nested/path/to/some/important/module_file.rb",
            "very_long_method_name_indeed",
            1,
            0.9,
        )];
        let map = emit(&ranked, 2, &tok);
        assert!(map.overflow);
        assert_eq!(map.text, "deeply/nested/path/to/some/important/module_file.rb\n");
        assert!(map.token_count > 2);
    }

    #[test]
    fn test_emit_deterministic() {
        let tok = EstimateTokenizer;
        let ranked = vec![
            tag("a.rb", "alpha", 1, 0.9),
            tag("b.rb", "beta", 1, 0.8),
            tag("c.rb", "gamma", 1, 0.7),
        ];
        let first = emit(&ranked, 64, &tok);
        let second = emit(&ranked, 64, &tok);
        assert_eq!(first.text, second.text);
        assert_eq!(first.token_count, second.token_count);
    }
}
