//! Deterministic token counting shared by indexing and query time.
//!
//! Provides a `Tokenizer` trait with a single deterministic estimator
//! implementation: byte length / 3.3 for code, UTF-8 codepoints / 3.8 for
//! prose. Repo-map fitting and chunk accounting must use the same counts at
//! index and query time, so the estimator never depends on a model's BPE
//! vocabulary.

use std::sync::Arc;

/// Broad classification of text for estimation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextClass {
    Code,
    Prose,
}

/// Extensions treated as prose for chunking and token estimation.
pub fn text_class_for_ext(ext: &str) -> TextClass {
    match ext {
        "md" | "markdown" | "txt" | "rst" | "adoc" => TextClass::Prose,
        _ => TextClass::Code,
    }
}

pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str, class: TextClass) -> usize;
    fn name(&self) -> &str;

    fn count_code(&self, text: &str) -> usize {
        self.count(text, TextClass::Code)
    }

    fn count_prose(&self, text: &str) -> usize {
        self.count(text, TextClass::Prose)
    }
}

/// Default estimator: bytes/3.3 for code, codepoints/3.8 for prose.
pub struct EstimateTokenizer;

impl Tokenizer for EstimateTokenizer {
    fn count(&self, text: &str, class: TextClass) -> usize {
        if text.is_empty() {
            return 0;
        }
        match class {
            TextClass::Code => (text.len() as f64 / 3.3).ceil() as usize,
            TextClass::Prose => (text.chars().count() as f64 / 3.8).ceil() as usize,
        }
    }

    fn name(&self) -> &str {
        "estimate"
    }
}

pub fn create_tokenizer() -> Arc<dyn Tokenizer> {
    Arc::new(EstimateTokenizer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        let t = EstimateTokenizer;
        assert_eq!(t.count_code(""), 0);
        assert_eq!(t.count_prose(""), 0);
    }

    #[test]
    fn test_code_uses_bytes() {
        let t = EstimateTokenizer;
        // 33 ASCII bytes / 3.3 = 10 tokens exactly
        let text = "a".repeat(33);
        assert_eq!(t.count_code(&text), 10);
    }

    #[test]
    fn test_prose_uses_codepoints() {
        let t = EstimateTokenizer;
        // 38 codepoints / 3.8 = 10, regardless of byte width
        let ascii = "b".repeat(38);
        let wide: String = "é".repeat(38);
        assert_eq!(t.count_prose(&ascii), 10);
        assert_eq!(t.count_prose(&wide), 10);
        assert!(wide.len() > ascii.len());
    }

    #[test]
    fn test_determinism() {
        let t = EstimateTokenizer;
        let text = "fn main() { println!(\"hello\"); }";
        assert_eq!(t.count_code(text), t.count_code(text));
    }

    #[test]
    fn test_class_for_ext() {
        assert_eq!(text_class_for_ext("md"), TextClass::Prose);
        assert_eq!(text_class_for_ext("rst"), TextClass::Prose);
        assert_eq!(text_class_for_ext("rs"), TextClass::Code);
        assert_eq!(text_class_for_ext("rb"), TextClass::Code);
    }
}
