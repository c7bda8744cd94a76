//! Document chunking for the semantic pipeline.
//!
//! Splits text into chunks of at most T tokens with O tokens of overlap.
//! Code splits on top-level symbol boundaries first (from the structural tag
//! set when available); prose splits on paragraphs, then sentences, then
//! hard windows. Concatenating chunk texts in ordinal order and stripping
//! overlaps reproduces the original text.

use crate::config::ChunkerSettings;
use crate::tokenizer::{TextClass, Tokenizer};
use crate::types::Tag;

/// One chunk ready for embedding. `start_byte..end_byte` is the stored span;
/// the overlap prefix length of chunk i equals `end_byte(i-1) - start_byte(i)`.
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub text: String,
    pub start_byte: usize,
    pub end_byte: usize,
    pub token_count: usize,
}

// ---------------------------------------------------------------------------
// Boundary discovery
// ---------------------------------------------------------------------------

/// Byte offsets of line starts, 0-based line index → offset.
fn line_offsets(text: &str) -> Vec<usize> {
    let mut offsets = vec![0usize];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' && i + 1 < text.len() {
            offsets.push(i + 1);
        }
    }
    offsets
}

/// Split points at the start lines of definer tags (class/function ends are
/// where the next construct begins).
fn tag_boundaries(text: &str, tags: &[Tag]) -> Vec<usize> {
    let offsets = line_offsets(text);
    let mut cuts: Vec<usize> = tags
        .iter()
        .filter(|t| t.kind.is_definer() && t.line > 1)
        .filter_map(|t| offsets.get(t.line - 1).copied())
        .collect();
    cuts.sort_unstable();
    cuts.dedup();
    cuts
}

/// Paragraph boundaries: the offset just past each blank-line run.
fn paragraph_boundaries(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut cuts = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j] == b'\n' {
                j += 1;
            }
            if j < bytes.len() {
                cuts.push(j);
            }
            i = j;
        } else {
            i += 1;
        }
    }
    cuts
}

/// Sentence boundaries inside [start, end): offsets just past `. `, `! `,
/// `? `, or a terminator followed by newline.
fn sentence_boundaries(text: &str, start: usize, end: usize) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut cuts = Vec::new();
    let mut i = start;
    while i + 1 < end {
        if matches!(bytes[i], b'.' | b'!' | b'?')
            && matches!(bytes[i + 1], b' ' | b'\n')
            && i + 2 < end
        {
            cuts.push(i + 2);
            i += 2;
        } else {
            i += 1;
        }
    }
    cuts
}

/// Hard byte windows inside [start, end), each at most `max_tokens` tokens,
/// cut on char boundaries.
fn hard_window_boundaries(
    text: &str,
    start: usize,
    end: usize,
    max_tokens: usize,
    class: TextClass,
    tok: &dyn Tokenizer,
) -> Vec<usize> {
    let mut cuts = Vec::new();
    // Approximate window in bytes from the estimator's ratio, then shrink
    // until the window actually fits the budget.
    let approx = match class {
        TextClass::Code => (max_tokens as f64 * 3.3) as usize,
        TextClass::Prose => (max_tokens as f64 * 3.8) as usize,
    }
    .max(16);

    let mut pos = start;
    while pos < end {
        let mut cut = (pos + approx).min(end);
        while cut > pos && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        while cut > pos && tok.count(&text[pos..cut], class) > max_tokens {
            let mut next = cut.saturating_sub(8).max(pos);
            while next > pos && !text.is_char_boundary(next) {
                next -= 1;
            }
            if next == cut {
                break;
            }
            cut = next;
        }
        if cut <= pos {
            break;
        }
        if cut < end {
            cuts.push(cut);
        }
        pos = cut;
    }
    cuts
}

// ---------------------------------------------------------------------------
// Packing
// ---------------------------------------------------------------------------

/// Greedily pack contiguous segments into core spans of at most `max_core`
/// tokens. A segment larger than the budget is refined first (sentences for
/// prose, hard windows for both).
fn pack_spans(
    text: &str,
    mut cuts: Vec<usize>,
    max_core: usize,
    class: TextClass,
    tok: &dyn Tokenizer,
) -> Vec<(usize, usize)> {
    cuts.retain(|&c| c > 0 && c < text.len());
    cuts.sort_unstable();
    cuts.dedup();
    cuts.push(text.len());

    // Refine oversized segments.
    let mut segments: Vec<(usize, usize)> = Vec::new();
    let mut prev = 0usize;
    for cut in cuts {
        if cut <= prev {
            continue;
        }
        if tok.count(&text[prev..cut], class) <= max_core {
            segments.push((prev, cut));
        } else {
            let mut inner: Vec<usize> = if class == TextClass::Prose {
                sentence_boundaries(text, prev, cut)
            } else {
                Vec::new()
            };
            inner.push(cut);
            let mut sub_prev = prev;
            for sub_cut in inner {
                if sub_cut <= sub_prev {
                    continue;
                }
                if tok.count(&text[sub_prev..sub_cut], class) <= max_core {
                    segments.push((sub_prev, sub_cut));
                } else {
                    let windows =
                        hard_window_boundaries(text, sub_prev, sub_cut, max_core, class, tok);
                    let mut w_prev = sub_prev;
                    for w in windows.into_iter().chain(std::iter::once(sub_cut)) {
                        if w > w_prev {
                            segments.push((w_prev, w));
                            w_prev = w;
                        }
                    }
                }
                sub_prev = sub_cut;
            }
        }
        prev = cut;
    }

    // Greedy accumulation into core spans.
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut cur_start: Option<usize> = None;
    let mut cur_tokens = 0usize;
    for (s, e) in segments {
        let seg_tokens = tok.count(&text[s..e], class);
        match cur_start {
            None => {
                cur_start = Some(s);
                cur_tokens = seg_tokens;
            }
            Some(start) => {
                if cur_tokens + seg_tokens > max_core {
                    spans.push((start, s));
                    cur_start = Some(s);
                    cur_tokens = seg_tokens;
                } else {
                    cur_tokens += seg_tokens;
                }
            }
        }
    }
    if let Some(start) = cur_start {
        if start < text.len() {
            spans.push((start, text.len()));
        }
    }
    spans
}

/// Extend each core span backwards by up to `overlap_tokens` of context from
/// the previous chunk and materialize the pieces.
fn attach_overlap(
    text: &str,
    spans: &[(usize, usize)],
    overlap_tokens: usize,
    class: TextClass,
    tok: &dyn Tokenizer,
) -> Vec<ChunkPiece> {
    let overlap_bytes = match class {
        TextClass::Code => (overlap_tokens as f64 * 3.3) as usize,
        TextClass::Prose => (overlap_tokens as f64 * 3.8) as usize,
    };

    let mut pieces = Vec::with_capacity(spans.len());
    for (i, &(core_start, core_end)) in spans.iter().enumerate() {
        let mut start = core_start;
        if i > 0 && overlap_tokens > 0 {
            let prev_start = spans[i - 1].0;
            start = core_start.saturating_sub(overlap_bytes).max(prev_start);
            while start < core_start && !text.is_char_boundary(start) {
                start += 1;
            }
        }
        let body = &text[start..core_end];
        if body.is_empty() {
            continue;
        }
        pieces.push(ChunkPiece {
            text: body.to_string(),
            start_byte: start,
            end_byte: core_end,
            token_count: tok.count(body, class),
        });
    }
    pieces
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Chunk a document. `tags` supplies top-level boundaries for code; pass an
/// empty slice when no structural index covers the file.
pub fn chunk_document(
    text: &str,
    class: TextClass,
    tags: &[Tag],
    settings: &ChunkerSettings,
    tok: &dyn Tokenizer,
) -> Vec<ChunkPiece> {
    if text.is_empty() {
        return Vec::new();
    }
    let max_core = settings
        .max_tokens
        .saturating_sub(settings.overlap_tokens)
        .max(1);

    let cuts = match class {
        TextClass::Code => tag_boundaries(text, tags),
        TextClass::Prose => paragraph_boundaries(text),
    };
    let spans = pack_spans(text, cuts, max_core, class, tok);
    attach_overlap(text, &spans, settings.overlap_tokens, class, tok)
}

/// Reassemble the original text from pieces by stripping each piece's
/// overlap prefix. Used by tests and the export integrity check.
pub fn reassemble(pieces: &[ChunkPiece]) -> String {
    let mut out = String::new();
    let mut prev_end = 0usize;
    for (i, piece) in pieces.iter().enumerate() {
        if i == 0 {
            out.push_str(&piece.text);
        } else {
            let overlap = prev_end.saturating_sub(piece.start_byte);
            out.push_str(&piece.text[overlap.min(piece.text.len())..]);
        }
        prev_end = piece.end_byte;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkerSettings;
    use crate::tokenizer::EstimateTokenizer;
    use crate::types::TagKind;

    fn settings(max: usize, overlap: usize) -> ChunkerSettings {
        ChunkerSettings {
            max_tokens: max,
            overlap_tokens: overlap,
        }
    }

    fn tag(file: &str, name: &str, kind: TagKind, line: usize) -> Tag {
        Tag {
            file: file.to_string(),
            name: name.to_string(),
            kind,
            line,
            signature: format!("def {name}"),
            language: "ruby".to_string(),
            identifier: name.to_lowercase(),
            importance: 0.0,
        }
    }

    #[test]
    fn test_empty_document_yields_no_chunks() {
        let tok = EstimateTokenizer;
        let pieces = chunk_document("", TextClass::Prose, &[], &settings(512, 64), &tok);
        assert!(pieces.is_empty());
    }

    #[test]
    fn test_small_document_is_one_chunk() {
        let tok = EstimateTokenizer;
        let text = "short paragraph of prose.";
        let pieces = chunk_document(text, TextClass::Prose, &[], &settings(512, 64), &tok);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].text, text);
        assert_eq!(pieces[0].start_byte, 0);
        assert_eq!(pieces[0].end_byte, text.len());
    }

    #[test]
    fn test_prose_roundtrip() {
        let tok = EstimateTokenizer;
        let text = (0..40)
            .map(|i| format!("Paragraph number {i} with several words of filler text in it."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let pieces = chunk_document(&text, TextClass::Prose, &[], &settings(64, 8), &tok);
        assert!(pieces.len() > 1);
        assert_eq!(reassemble(&pieces), text);
    }

    #[test]
    fn test_chunks_respect_token_budget() {
        let tok = EstimateTokenizer;
        let text = "word ".repeat(2000);
        let pieces = chunk_document(&text, TextClass::Prose, &[], &settings(128, 16), &tok);
        for p in &pieces {
            assert!(p.token_count <= 128 + 2, "chunk of {} tokens", p.token_count);
            assert!(!p.text.is_empty());
        }
        assert_eq!(reassemble(&pieces).trim_end(), text.trim_end());
    }

    #[test]
    fn test_code_splits_at_tag_boundaries() {
        let tok = EstimateTokenizer;
        let text = "\
def alpha\n  1\nend\n\
def beta\n  2\nend\n\
def gamma\n  3\nend\n";
        let tags = vec![
            tag("x.rb", "alpha", TagKind::Method, 1),
            tag("x.rb", "beta", TagKind::Method, 4),
            tag("x.rb", "gamma", TagKind::Method, 7),
        ];
        // Budget small enough that each method lands in its own chunk.
        let pieces = chunk_document(text, TextClass::Code, &tags, &settings(8, 0), &tok);
        assert_eq!(pieces.len(), 3);
        assert!(pieces[0].text.starts_with("def alpha"));
        assert!(pieces[1].text.starts_with("def beta"));
        assert!(pieces[2].text.starts_with("def gamma"));
        assert_eq!(reassemble(&pieces), text);
    }

    #[test]
    fn test_oversized_unit_falls_back_to_windows() {
        let tok = EstimateTokenizer;
        // One giant line with no boundaries at all.
        let text = "x".repeat(10_000);
        let pieces = chunk_document(&text, TextClass::Code, &[], &settings(64, 8), &tok);
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(!p.text.is_empty());
        }
        assert_eq!(reassemble(&pieces), text);
    }

    #[test]
    fn test_overlap_prefix_present() {
        let tok = EstimateTokenizer;
        let text = (0..40)
            .map(|i| format!("Sentence {i} filling out the paragraph nicely."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let pieces = chunk_document(&text, TextClass::Prose, &[], &settings(64, 16), &tok);
        assert!(pieces.len() > 1);
        for pair in pieces.windows(2) {
            // Each later chunk starts at or before the previous core end.
            assert!(pair[1].start_byte <= pair[0].end_byte);
        }
    }

    #[test]
    fn test_ordinals_contiguous_spans() {
        let tok = EstimateTokenizer;
        let text = "line one.\n\nline two.\n\nline three.\n\nline four.";
        let pieces = chunk_document(text, TextClass::Prose, &[], &settings(8, 2), &tok);
        // Core spans tile the document: each end matches the next core start
        // when overlap is stripped.
        assert_eq!(reassemble(&pieces), text);
        assert_eq!(pieces.last().unwrap().end_byte, text.len());
    }
}
