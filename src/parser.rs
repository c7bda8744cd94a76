//! Tree-sitter parsing: language dispatch, symbol tag extraction, a rented
//! parser pool, and the file-backed parse cache.
//!
//! Parsers are not thread-safe, so they are rented from a bounded pool
//! rather than shared. Tags are cached keyed by content identity
//! (sha256(path) || mtime_ns || size); the cache is a local file and never
//! authoritative.

use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tree_sitter::{Language, Node, Parser};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::{content_hash, looks_binary, Tag, TagKind, MAX_PARSE_BYTES};

/// Signatures are truncated to this many characters.
const MAX_SIGNATURE_CHARS: usize = 200;

/// Parse-cache bounds.
const CACHE_MAX_ENTRIES: usize = 50_000;
const CACHE_MAX_BYTES: u64 = 256 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Language dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LangId {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Ruby,
    Java,
}

impl LangId {
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "rs" => Some(LangId::Rust),
            "py" | "pyi" => Some(LangId::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(LangId::JavaScript),
            "ts" | "tsx" => Some(LangId::TypeScript),
            "go" => Some(LangId::Go),
            "rb" | "rake" => Some(LangId::Ruby),
            "java" => Some(LangId::Java),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "rust" => Some(LangId::Rust),
            "python" => Some(LangId::Python),
            "javascript" => Some(LangId::JavaScript),
            "typescript" => Some(LangId::TypeScript),
            "go" => Some(LangId::Go),
            "ruby" => Some(LangId::Ruby),
            "java" => Some(LangId::Java),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LangId::Rust => "rust",
            LangId::Python => "python",
            LangId::JavaScript => "javascript",
            LangId::TypeScript => "typescript",
            LangId::Go => "go",
            LangId::Ruby => "ruby",
            LangId::Java => "java",
        }
    }

    fn grammar(&self) -> Language {
        match self {
            LangId::Rust => tree_sitter_rust::LANGUAGE.into(),
            LangId::Python => tree_sitter_python::LANGUAGE.into(),
            LangId::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            LangId::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            LangId::Go => tree_sitter_go::LANGUAGE.into(),
            LangId::Ruby => tree_sitter_ruby::LANGUAGE.into(),
            LangId::Java => tree_sitter_java::LANGUAGE.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rented parser pool
// ---------------------------------------------------------------------------

/// Bounded per-language pool. One renter at a time per parser; rented
/// parsers return on drop.
pub struct ParserPool {
    shelves: Mutex<HashMap<LangId, Vec<Parser>>>,
    cap_per_lang: usize,
}

impl ParserPool {
    pub fn new(cap_per_lang: usize) -> Arc<Self> {
        Arc::new(ParserPool {
            shelves: Mutex::new(HashMap::new()),
            cap_per_lang: cap_per_lang.max(1),
        })
    }

    pub fn rent(self: &Arc<Self>, lang: LangId) -> CoreResult<RentedParser> {
        let existing = {
            let mut shelves = self.shelves.lock().unwrap();
            shelves.get_mut(&lang).and_then(|v| v.pop())
        };
        let parser = match existing {
            Some(p) => p,
            None => {
                let mut p = Parser::new();
                p.set_language(&lang.grammar()).map_err(|e| {
                    CoreError::Dependency(format!("grammar for {} failed to load: {e}", lang.label()))
                })?;
                p
            }
        };
        Ok(RentedParser {
            parser: Some(parser),
            lang,
            pool: Arc::clone(self),
        })
    }

    fn give_back(&self, lang: LangId, parser: Parser) {
        let mut shelves = self.shelves.lock().unwrap();
        let shelf = shelves.entry(lang).or_default();
        if shelf.len() < self.cap_per_lang {
            shelf.push(parser);
        }
    }
}

pub struct RentedParser {
    parser: Option<Parser>,
    lang: LangId,
    pool: Arc<ParserPool>,
}

impl Deref for RentedParser {
    type Target = Parser;
    fn deref(&self) -> &Parser {
        self.parser.as_ref().unwrap()
    }
}

impl DerefMut for RentedParser {
    fn deref_mut(&mut self) -> &mut Parser {
        self.parser.as_mut().unwrap()
    }
}

impl Drop for RentedParser {
    fn drop(&mut self) {
        if let Some(parser) = self.parser.take() {
            self.pool.give_back(self.lang, parser);
        }
    }
}

// ---------------------------------------------------------------------------
// Tag extraction
// ---------------------------------------------------------------------------

/// Map a tree-sitter node kind to a tag kind for the given language.
/// `None` means descend without emitting.
fn classify_node(kind: &str, lang: LangId) -> Option<TagKind> {
    match lang {
        LangId::Rust => match kind {
            "function_item" => Some(TagKind::Function),
            "struct_item" | "enum_item" | "trait_item" => Some(TagKind::Class),
            "mod_item" => Some(TagKind::Module),
            "const_item" | "static_item" => Some(TagKind::Variable),
            _ => None,
        },
        LangId::Python => match kind {
            "function_definition" => Some(TagKind::Function),
            "class_definition" => Some(TagKind::Class),
            _ => None,
        },
        LangId::JavaScript | LangId::TypeScript => match kind {
            "function_declaration" | "generator_function_declaration" => Some(TagKind::Function),
            "class_declaration" => Some(TagKind::Class),
            "method_definition" => Some(TagKind::Method),
            "interface_declaration" => Some(TagKind::Class),
            "lexical_declaration" | "variable_declaration" => Some(TagKind::Variable),
            _ => None,
        },
        LangId::Go => match kind {
            "function_declaration" => Some(TagKind::Function),
            "method_declaration" => Some(TagKind::Method),
            "type_spec" => Some(TagKind::Class),
            "const_declaration" | "var_declaration" => Some(TagKind::Variable),
            _ => None,
        },
        LangId::Ruby => match kind {
            "class" => Some(TagKind::Class),
            "module" => Some(TagKind::Module),
            "method" | "singleton_method" => Some(TagKind::Method),
            _ => None,
        },
        LangId::Java => match kind {
            "class_declaration" | "interface_declaration" | "enum_declaration" => {
                Some(TagKind::Class)
            }
            "method_declaration" => Some(TagKind::Method),
            "field_declaration" => Some(TagKind::Variable),
            _ => None,
        },
    }
}

/// Extract a node's canonical name via field names, with per-language
/// fallbacks for declaration lists.
fn extract_name(node: &Node<'_>, source: &[u8]) -> Option<String> {
    for field in ["name", "declarator"] {
        if let Some(child) = node.child_by_field_name(field) {
            if let Ok(text) = child.utf8_text(source) {
                let name = text.trim();
                if !name.is_empty() {
                    // Declaration lists: take the identifier before any '='
                    let name = name.split('=').next().unwrap_or(name).trim();
                    return Some(name.to_string());
                }
            }
        }
    }
    // let/const/var lists: first identifier inside the first declarator.
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind().contains("declarator") || child.kind() == "variable_declarator" {
            if let Some(name_node) = child.child_by_field_name("name") {
                if let Ok(text) = name_node.utf8_text(source) {
                    return Some(text.trim().to_string());
                }
            }
        }
    }
    None
}

/// One-line signature: first line, body opener stripped, truncated.
fn extract_signature(node: &Node<'_>, source: &[u8], lang: LangId) -> String {
    let text = node.utf8_text(source).unwrap_or("");
    let first_line = text.lines().next().unwrap_or("").trim();

    let sig = match lang {
        LangId::Python => match first_line.find(':') {
            Some(colon) => &first_line[..=colon],
            None => first_line,
        },
        LangId::Ruby => first_line,
        _ => match first_line.find('{') {
            Some(brace) => first_line[..brace].trim_end(),
            None => first_line,
        },
    };

    if sig.chars().count() > MAX_SIGNATURE_CHARS {
        let mut end = sig
            .char_indices()
            .nth(MAX_SIGNATURE_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(sig.len());
        while end > 0 && !sig.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &sig[..end])
    } else {
        sig.to_string()
    }
}

/// Normalized identifier used as a graph key.
fn normalize_identifier(name: &str) -> String {
    name.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .to_ascii_lowercase()
}

fn walk_node(
    node: &Node<'_>,
    source: &[u8],
    lang: LangId,
    rel_path: &str,
    inside_container: bool,
    tags: &mut Vec<Tag>,
) {
    let kind = classify_node(node.kind(), lang);

    if let Some(tag_kind) = kind {
        if let Some(name) = extract_name(node, source) {
            // Functions nested inside a class/impl body are methods.
            let final_kind = if inside_container && tag_kind == TagKind::Function {
                TagKind::Method
            } else {
                tag_kind
            };
            let line = node.start_position().row + 1;
            tags.push(Tag {
                file: rel_path.to_string(),
                name: name.clone(),
                kind: final_kind,
                line,
                signature: extract_signature(node, source, lang),
                language: lang.label().to_string(),
                identifier: normalize_identifier(&name),
                importance: 0.0,
            });
        }

        // Only class-like containers turn nested functions into methods;
        // modules and namespaces do not.
        let container = matches!(kind, Some(TagKind::Class)) || inside_container;
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk_node(&child, source, lang, rel_path, container, tags);
        }
    } else {
        // Rust impl blocks are unnamed containers: functions inside are methods.
        let container = inside_container || node.kind() == "impl_item";
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk_node(&child, source, lang, rel_path, container, tags);
        }
    }
}

/// Parse source text and extract tags. Exposed for tests and for callers
/// that already hold content in memory.
pub fn extract_tags(
    pool: &Arc<ParserPool>,
    content: &str,
    lang: LangId,
    rel_path: &str,
) -> CoreResult<Vec<Tag>> {
    let mut parser = pool.rent(lang)?;
    let tree = parser.parse(content, None).ok_or_else(|| {
        CoreError::Dependency(format!("parse failed for {rel_path} ({})", lang.label()))
    })?;
    let root = tree.root_node();
    let source = content.as_bytes();

    let mut tags = Vec::new();
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        walk_node(&child, source, lang, rel_path, false, &mut tags);
    }
    Ok(tags)
}

// ---------------------------------------------------------------------------
// Parse cache
// ---------------------------------------------------------------------------

/// File-backed LRU tag cache keyed by content identity. Never authoritative:
/// a miss re-parses, a corrupt row is dropped.
pub struct ParseCache {
    conn: Mutex<Connection>,
    max_entries: usize,
    max_bytes: u64,
}

impl ParseCache {
    pub fn open(path: &Path) -> CoreResult<ParseCache> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS parse_cache (
                key         TEXT PRIMARY KEY,
                tags        TEXT NOT NULL,
                bytes       INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL
            );",
        )?;
        Ok(ParseCache {
            conn: Mutex::new(conn),
            max_entries: CACHE_MAX_ENTRIES,
            max_bytes: CACHE_MAX_BYTES,
        })
    }

    #[cfg(test)]
    pub fn with_bounds(path: &Path, max_entries: usize, max_bytes: u64) -> CoreResult<ParseCache> {
        let mut cache = ParseCache::open(path)?;
        cache.max_entries = max_entries;
        cache.max_bytes = max_bytes;
        Ok(cache)
    }

    pub fn cache_key(path: &Path, mtime_ns: u128, size: u64) -> String {
        let path_hash = content_hash(path.to_string_lossy().as_bytes());
        format!("{path_hash}:{mtime_ns}:{size}")
    }

    pub fn get(&self, key: &str) -> Option<Vec<Tag>> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT tags FROM parse_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .ok();
        let body = body?;
        let now = now_epoch();
        let _ = conn.execute(
            "UPDATE parse_cache SET accessed_at = ?1 WHERE key = ?2",
            params![now, key],
        );
        serde_json::from_str(&body).ok()
    }

    pub fn put(&self, key: &str, tags: &[Tag]) {
        let body = match serde_json::to_string(tags) {
            Ok(b) => b,
            Err(_) => return,
        };
        let bytes = body.len() as i64;
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute(
            "INSERT OR REPLACE INTO parse_cache (key, tags, bytes, accessed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, body, bytes, now_epoch()],
        );
        self.evict(&conn);
    }

    fn evict(&self, conn: &Connection) {
        loop {
            let (count, total): (i64, i64) = match conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(bytes), 0) FROM parse_cache",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ) {
                Ok(v) => v,
                Err(_) => return,
            };
            let over_entries = (count as usize).saturating_sub(self.max_entries);
            let over_bytes = total as u64 > self.max_bytes;
            if over_entries == 0 && !over_bytes {
                return;
            }
            // Drop just the excess (plus a small batch for the bytes bound),
            // oldest access first.
            let limit = if over_entries > 0 { over_entries.min(256) } else { 64 };
            let evicted = conn
                .execute(
                    &format!(
                        "DELETE FROM parse_cache WHERE key IN (
                            SELECT key FROM parse_cache ORDER BY accessed_at ASC LIMIT {limit}
                         )"
                    ),
                    [],
                )
                .unwrap_or(0);
            if evicted == 0 {
                return;
            }
        }
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// File-level entry point
// ---------------------------------------------------------------------------

/// Parse one file into tags, going through the cache.
///
/// Empty files produce zero tags. Binary files and unknown extensions are
/// skipped without error. Files over the size cap produce zero tags with a
/// warning.
pub fn parse_path(
    pool: &Arc<ParserPool>,
    cache: Option<&ParseCache>,
    abs_path: &Path,
    rel_path: &str,
    lang_override: Option<LangId>,
) -> CoreResult<Vec<Tag>> {
    let meta = std::fs::metadata(abs_path)?;
    if meta.len() > MAX_PARSE_BYTES {
        warn!(file = rel_path, size = meta.len(), "File exceeds parse size cap, skipping");
        return Ok(Vec::new());
    }

    let lang = match lang_override.or_else(|| {
        rel_path
            .rsplit_once('.')
            .and_then(|(_, ext)| LangId::from_ext(ext))
    }) {
        Some(l) => l,
        None => return Ok(Vec::new()),
    };

    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let key = ParseCache::cache_key(abs_path, mtime_ns, meta.len());

    if let Some(cache) = cache {
        if let Some(tags) = cache.get(&key) {
            return Ok(tags);
        }
    }

    let bytes = std::fs::read(abs_path)?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if looks_binary(&bytes) {
        return Ok(Vec::new());
    }
    let content = String::from_utf8_lossy(&bytes);

    let tags = extract_tags(pool, &content, lang, rel_path)?;
    debug!(file = rel_path, tags = tags.len(), lang = lang.label(), "Parsed");

    if let Some(cache) = cache {
        cache.put(&key, &tags);
    }
    Ok(tags)
}
