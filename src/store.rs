//! SQLite-backed knowledge store.
//!
//! One database file with WAL journaling. A single in-process writer holds
//! the connection mutex; readers open short-lived read-only snapshot
//! connections against the same WAL file, so queries observe the store as of
//! query start. Fatal storage errors flip the store into read-only mode.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::chunker::ChunkPiece;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::retrieval::tokenize_terms;
use crate::types::{
    now_ts, pack_embedding, slugify, unpack_embedding, DepEdge, DocumentMeta, EdgeKind, Hook,
    JobSnapshot, JobState, KbRole, KbType, KnowledgeBase, Project, RepoMapArtifact, Tag, TagKind,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Forward-only migrations; index = version - 1. Applied idempotently on
/// startup inside one transaction each.
const MIGRATIONS: &[&str] = &[
    // v1: full base schema
    "
    CREATE TABLE knowledge_bases (
        id          INTEGER PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        slug        TEXT NOT NULL UNIQUE,
        kb_type     TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        dimension   INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE TABLE documents (
        id           INTEGER PRIMARY KEY,
        kb_id        INTEGER NOT NULL REFERENCES knowledge_bases(id) ON DELETE CASCADE,
        filename     TEXT NOT NULL,
        source_path  TEXT,
        size         INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        metadata     TEXT NOT NULL DEFAULT '{}',
        created_at   TEXT NOT NULL,
        UNIQUE (kb_id, filename)
    );
    CREATE INDEX idx_documents_hash ON documents (kb_id, content_hash);

    CREATE TABLE chunks (
        id          INTEGER PRIMARY KEY,
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        ordinal     INTEGER NOT NULL,
        text        TEXT NOT NULL,
        start_byte  INTEGER NOT NULL,
        end_byte    INTEGER NOT NULL,
        token_count INTEGER NOT NULL,
        embedding   BLOB,
        UNIQUE (document_id, ordinal)
    );

    CREATE TABLE symbols (
        id         INTEGER PRIMARY KEY,
        kb_id      INTEGER NOT NULL REFERENCES knowledge_bases(id) ON DELETE CASCADE,
        file       TEXT NOT NULL,
        name       TEXT NOT NULL,
        kind       TEXT NOT NULL,
        line       INTEGER NOT NULL CHECK (line >= 1),
        signature  TEXT NOT NULL,
        language   TEXT NOT NULL,
        identifier TEXT NOT NULL,
        importance REAL NOT NULL DEFAULT 0,
        UNIQUE (kb_id, file, name, kind, line)
    );
    CREATE INDEX idx_symbols_lang ON symbols (kb_id, language);

    CREATE TABLE dependency_edges (
        id          INTEGER PRIMARY KEY,
        kb_id       INTEGER NOT NULL REFERENCES knowledge_bases(id) ON DELETE CASCADE,
        from_file   TEXT NOT NULL,
        from_symbol TEXT NOT NULL,
        to_file     TEXT NOT NULL,
        to_symbol   TEXT NOT NULL,
        kind        TEXT NOT NULL,
        weight      REAL NOT NULL DEFAULT 1
    );

    CREATE TABLE repo_maps (
        kb_id        INTEGER PRIMARY KEY REFERENCES knowledge_bases(id) ON DELETE CASCADE,
        text         TEXT NOT NULL,
        token_count  INTEGER NOT NULL,
        budget       INTEGER NOT NULL,
        overflow     INTEGER NOT NULL,
        tag_count    INTEGER NOT NULL,
        generated_at TEXT NOT NULL
    );

    CREATE TABLE projects (
        id          INTEGER PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        path        TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at  TEXT NOT NULL
    );

    CREATE TABLE project_kbs (
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        role       TEXT NOT NULL,
        kb_id      INTEGER NOT NULL UNIQUE REFERENCES knowledge_bases(id) ON DELETE CASCADE,
        UNIQUE (project_id, role)
    );

    CREATE TABLE hooks (
        project_id   INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        role         TEXT NOT NULL,
        enabled      INTEGER NOT NULL DEFAULT 1,
        folder       TEXT NOT NULL,
        patterns     TEXT NOT NULL DEFAULT '[]',
        last_sync_at TEXT,
        synced_files TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (project_id, role)
    );

    CREATE TABLE jobs_snapshot (
        id           TEXT PRIMARY KEY,
        kind         TEXT NOT NULL,
        params       TEXT,
        state        TEXT NOT NULL,
        percent      INTEGER NOT NULL DEFAULT 0,
        message      TEXT NOT NULL DEFAULT '',
        error        TEXT,
        created_at   TEXT NOT NULL,
        started_at   TEXT,
        completed_at TEXT
    );

    CREATE TABLE kb_term_stats (
        kb_id INTEGER NOT NULL REFERENCES knowledge_bases(id) ON DELETE CASCADE,
        term  TEXT NOT NULL,
        df    INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (kb_id, term)
    );

    CREATE TABLE kb_doc_stats (
        kb_id        INTEGER PRIMARY KEY REFERENCES knowledge_bases(id) ON DELETE CASCADE,
        chunk_count  INTEGER NOT NULL DEFAULT 0,
        total_tokens INTEGER NOT NULL DEFAULT 0
    );
    ",
];

// ---------------------------------------------------------------------------
// Row views
// ---------------------------------------------------------------------------

/// Everything the retrieval engine and exporter need per chunk.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: i64,
    pub document_id: i64,
    pub filename: String,
    pub ordinal: usize,
    pub text: String,
    pub start_byte: usize,
    pub end_byte: usize,
    pub token_count: usize,
    pub embedding: Option<Vec<f32>>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct KbStats {
    pub documents: i64,
    pub chunks: i64,
    pub embedded_chunks: i64,
    pub symbols: i64,
    pub edges: i64,
    pub last_updated: Option<String>,
    pub languages: BTreeMap<String, i64>,
}

/// BM25 corpus statistics for one KB.
#[derive(Debug, Clone, Copy)]
pub struct BmStats {
    pub chunk_count: i64,
    pub total_tokens: i64,
}

impl BmStats {
    pub fn avg_tokens(&self) -> f64 {
        if self.chunk_count == 0 {
            0.0
        } else {
            self.total_tokens as f64 / self.chunk_count as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    read_only: AtomicBool,
}

impl Store {
    pub fn open(path: &Path) -> CoreResult<Store> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Store {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
            read_only: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Open a read-only snapshot connection. Queries against it see the
    /// store as of this call: a deferred read transaction is pinned
    /// immediately, so later commits by the writer stay invisible.
    pub fn snapshot(&self) -> CoreResult<Snapshot> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("BEGIN")?;
        let _pin: i64 = conn.query_row("SELECT version FROM schema_version", [], |r| r.get(0))?;
        Ok(Snapshot { conn })
    }

    /// Run a write closure under the single-writer lock, demoting the store
    /// to read-only when a fatal storage error surfaces.
    fn write<T>(&self, f: impl FnOnce(&mut Connection) -> CoreResult<T>) -> CoreResult<T> {
        if self.is_read_only() {
            return Err(CoreError::Fatal("store is in read-only mode".to_string()));
        }
        let mut conn = self.writer.lock().unwrap();
        match f(&mut conn) {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.kind() == ErrorKind::Fatal {
                    error!(error = %e, "Fatal storage error, entering read-only mode");
                    self.read_only.store(true, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.writer.lock().unwrap();
        f(&conn)
    }

    // -----------------------------------------------------------------------
    // Knowledge bases
    // -----------------------------------------------------------------------

    pub fn create_kb(
        &self,
        name: &str,
        kb_type: KbType,
        description: &str,
        dimension: usize,
    ) -> CoreResult<KnowledgeBase> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("knowledge base name must not be empty"));
        }
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(CoreError::validation(format!(
                "name '{name}' yields an empty slug"
            )));
        }

        self.write(|conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM knowledge_bases WHERE name = ?1 OR slug = ?2",
                    params![name, slug],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(CoreError::conflict(format!(
                    "knowledge base '{name}' already exists"
                )));
            }
            let now = now_ts();
            conn.execute(
                "INSERT INTO knowledge_bases (name, slug, kb_type, description, dimension, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![name, slug, kb_type.label(), description, dimension as i64, now],
            )?;
            let id = conn.last_insert_rowid();
            info!(kb = slug.as_str(), kb_type = kb_type.label(), "Created knowledge base");
            Ok(KnowledgeBase {
                id,
                name: name.to_string(),
                slug,
                kb_type,
                description: description.to_string(),
                dimension,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Resolve by slug first, then by exact name.
    pub fn resolve_kb(&self, name_or_slug: &str) -> CoreResult<KnowledgeBase> {
        self.read(|conn| resolve_kb_with(conn, name_or_slug))
    }

    pub fn list_kbs(&self) -> CoreResult<Vec<KnowledgeBase>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, slug, kb_type, description, dimension, created_at, updated_at
                 FROM knowledge_bases ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], kb_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete a KB and every descendant row in one transaction.
    pub fn delete_kb(&self, name_or_slug: &str) -> CoreResult<()> {
        self.write(|conn| {
            let kb = resolve_kb_with(conn, name_or_slug)?;
            let tx = conn.transaction()?;
            // Foreign keys cascade, but the explicit order documents the
            // ownership chain and keeps the delete observable in one place.
            tx.execute(
                "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE kb_id = ?1)",
                params![kb.id],
            )?;
            tx.execute("DELETE FROM documents WHERE kb_id = ?1", params![kb.id])?;
            tx.execute("DELETE FROM symbols WHERE kb_id = ?1", params![kb.id])?;
            tx.execute("DELETE FROM dependency_edges WHERE kb_id = ?1", params![kb.id])?;
            tx.execute("DELETE FROM repo_maps WHERE kb_id = ?1", params![kb.id])?;
            tx.execute("DELETE FROM kb_term_stats WHERE kb_id = ?1", params![kb.id])?;
            tx.execute("DELETE FROM kb_doc_stats WHERE kb_id = ?1", params![kb.id])?;
            tx.execute("DELETE FROM project_kbs WHERE kb_id = ?1", params![kb.id])?;
            tx.execute("DELETE FROM knowledge_bases WHERE id = ?1", params![kb.id])?;
            tx.commit()?;
            info!(kb = kb.slug.as_str(), "Deleted knowledge base and descendants");
            Ok(())
        })
    }

    pub fn kb_stats(&self, name_or_slug: &str) -> CoreResult<KbStats> {
        self.read(|conn| {
            let kb = resolve_kb_with(conn, name_or_slug)?;
            kb_stats_with(conn, kb.id)
        })
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Transactional op 1: upsert a document with its chunks and embeddings.
    /// Replaces any previous version and keeps the BM25 statistics and the
    /// KB's embedding dimension consistent.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_document(
        &self,
        kb_id: i64,
        filename: &str,
        source_path: Option<&str>,
        content_type: &str,
        content_hash: &str,
        size: u64,
        metadata: &HashMap<String, String>,
        pieces: &[ChunkPiece],
        embeddings: Option<&[Vec<f32>]>,
    ) -> CoreResult<i64> {
        if filename.is_empty() {
            return Err(CoreError::validation("document filename must not be empty"));
        }
        if let Some(embs) = embeddings {
            if embs.len() != pieces.len() {
                return Err(CoreError::validation(format!(
                    "{} chunks but {} embeddings",
                    pieces.len(),
                    embs.len()
                )));
            }
        }

        self.write(|conn| {
            let dimension: i64 = conn.query_row(
                "SELECT dimension FROM knowledge_bases WHERE id = ?1",
                params![kb_id],
                |row| row.get(0),
            )?;
            if let Some(embs) = embeddings {
                if let Some(first) = embs.first() {
                    if dimension != 0 && first.len() as i64 != dimension {
                        return Err(CoreError::validation(format!(
                            "embedding dimension {} does not match KB dimension {}",
                            first.len(),
                            dimension
                        )));
                    }
                    if embs.iter().any(|e| e.len() != first.len()) {
                        return Err(CoreError::validation(
                            "embeddings in one document differ in dimension",
                        ));
                    }
                }
            }

            let tx = conn.transaction()?;

            // Remove the previous version's chunks and statistics.
            let old_doc: Option<i64> = tx
                .query_row(
                    "SELECT id FROM documents WHERE kb_id = ?1 AND filename = ?2",
                    params![kb_id, filename],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(doc_id) = old_doc {
                retire_chunk_stats(&tx, kb_id, doc_id)?;
                tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![doc_id])?;
                tx.execute("DELETE FROM documents WHERE id = ?1", params![doc_id])?;
            }

            let now = now_ts();
            tx.execute(
                "INSERT INTO documents (kb_id, filename, source_path, size, content_type, content_hash, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    kb_id,
                    filename,
                    source_path,
                    size as i64,
                    content_type,
                    content_hash,
                    serde_json::to_string(metadata)?,
                    now
                ],
            )?;
            let doc_id = tx.last_insert_rowid();

            for (ordinal, piece) in pieces.iter().enumerate() {
                let blob = embeddings.map(|embs| pack_embedding(&embs[ordinal]));
                tx.execute(
                    "INSERT INTO chunks (document_id, ordinal, text, start_byte, end_byte, token_count, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        doc_id,
                        ordinal as i64,
                        piece.text,
                        piece.start_byte as i64,
                        piece.end_byte as i64,
                        piece.token_count as i64,
                        blob
                    ],
                )?;
                accrue_chunk_stats(&tx, kb_id, &piece.text, piece.token_count)?;
            }

            // Pin the KB dimension on first embedded write.
            if let Some(embs) = embeddings {
                if let Some(first) = embs.first() {
                    if dimension == 0 {
                        tx.execute(
                            "UPDATE knowledge_bases SET dimension = ?1 WHERE id = ?2",
                            params![first.len() as i64, kb_id],
                        )?;
                    }
                }
            }
            tx.execute(
                "UPDATE knowledge_bases SET updated_at = ?1 WHERE id = ?2",
                params![now, kb_id],
            )?;
            tx.commit()?;
            Ok(doc_id)
        })
    }

    pub fn document_hash(&self, kb_id: i64, filename: &str) -> CoreResult<Option<String>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT content_hash FROM documents WHERE kb_id = ?1 AND filename = ?2",
                    params![kb_id, filename],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn list_documents(&self, kb_id: i64) -> CoreResult<Vec<DocumentMeta>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kb_id, filename, source_path, size, content_type, content_hash, metadata, created_at
                 FROM documents WHERE kb_id = ?1 ORDER BY filename",
            )?;
            let rows = stmt
                .query_map(params![kb_id], document_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete_document(&self, kb_id: i64, filename: &str) -> CoreResult<()> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let doc_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM documents WHERE kb_id = ?1 AND filename = ?2",
                    params![kb_id, filename],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(doc_id) = doc_id else {
                return Err(CoreError::not_found(format!("document '{filename}' not found")));
            };
            retire_chunk_stats(&tx, kb_id, doc_id)?;
            tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![doc_id])?;
            tx.execute("DELETE FROM documents WHERE id = ?1", params![doc_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Structural index
    // -----------------------------------------------------------------------

    /// Transactional op 2: replace a KB's symbols, edges, and repo map
    /// atomically.
    pub fn replace_structural_index(
        &self,
        kb_id: i64,
        tags: &[Tag],
        edges: &[DepEdge],
        map: &RepoMapArtifact,
    ) -> CoreResult<()> {
        for tag in tags {
            if tag.file.is_empty() || tag.line < 1 {
                return Err(CoreError::Integrity(format!(
                    "symbol '{}' has empty file or line {}",
                    tag.name, tag.line
                )));
            }
        }

        self.write(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM symbols WHERE kb_id = ?1", params![kb_id])?;
            tx.execute("DELETE FROM dependency_edges WHERE kb_id = ?1", params![kb_id])?;
            tx.execute("DELETE FROM repo_maps WHERE kb_id = ?1", params![kb_id])?;

            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO symbols (kb_id, file, name, kind, line, signature, language, identifier, importance)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for tag in tags {
                    stmt.execute(params![
                        kb_id,
                        tag.file,
                        tag.name,
                        tag.kind.label(),
                        tag.line as i64,
                        tag.signature,
                        tag.language,
                        tag.identifier,
                        tag.importance
                    ])?;
                }
            }
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO dependency_edges (kb_id, from_file, from_symbol, to_file, to_symbol, kind, weight)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for edge in edges {
                    stmt.execute(params![
                        kb_id,
                        edge.from_file,
                        edge.from_symbol,
                        edge.to_file,
                        edge.to_symbol,
                        edge.kind.label(),
                        edge.weight
                    ])?;
                }
            }
            tx.execute(
                "INSERT INTO repo_maps (kb_id, text, token_count, budget, overflow, tag_count, generated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    kb_id,
                    map.text,
                    map.token_count as i64,
                    map.budget as i64,
                    map.overflow as i64,
                    map.tag_count as i64,
                    map.generated_at
                ],
            )?;
            tx.execute(
                "UPDATE knowledge_bases SET updated_at = ?1 WHERE id = ?2",
                params![now_ts(), kb_id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn load_tags(&self, kb_id: i64) -> CoreResult<Vec<Tag>> {
        self.read(|conn| load_tags_with(conn, kb_id))
    }

    pub fn load_edges(&self, kb_id: i64) -> CoreResult<Vec<DepEdge>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT from_file, from_symbol, to_file, to_symbol, kind, weight
                 FROM dependency_edges WHERE kb_id = ?1 ORDER BY from_file, to_file",
            )?;
            let rows = stmt
                .query_map(params![kb_id], |row| {
                    Ok(DepEdge {
                        from_file: row.get(0)?,
                        from_symbol: row.get(1)?,
                        to_file: row.get(2)?,
                        to_symbol: row.get(3)?,
                        kind: EdgeKind::parse(&row.get::<_, String>(4)?)
                            .unwrap_or(EdgeKind::References),
                        weight: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn load_repo_map(&self, kb_id: i64) -> CoreResult<Option<RepoMapArtifact>> {
        self.read(|conn| load_repo_map_with(conn, kb_id))
    }

    // -----------------------------------------------------------------------
    // Projects and hooks
    // -----------------------------------------------------------------------

    /// Create a project and its five role KBs in one transaction.
    pub fn create_project(
        &self,
        name: &str,
        path: &Path,
        description: &str,
        dimension: usize,
    ) -> CoreResult<(Project, Vec<(KbRole, KnowledgeBase)>)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("project name must not be empty"));
        }
        if !path.is_absolute() {
            return Err(CoreError::validation("project path must be absolute"));
        }

        self.write(|conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM projects WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(CoreError::conflict(format!("project '{name}' already exists")));
            }

            let tx = conn.transaction()?;
            let now = now_ts();
            tx.execute(
                "INSERT INTO projects (name, path, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, path.to_string_lossy(), description, now],
            )?;
            let project_id = tx.last_insert_rowid();

            let mut role_kbs = Vec::with_capacity(KbRole::ALL.len());
            for role in KbRole::ALL {
                let kb_name = format!("{name} {}", role.label());
                let slug = slugify(&kb_name);
                let taken: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM knowledge_bases WHERE name = ?1 OR slug = ?2",
                        params![kb_name, slug],
                        |row| row.get(0),
                    )
                    .optional()?;
                if taken.is_some() {
                    return Err(CoreError::conflict(format!(
                        "knowledge base '{kb_name}' already exists"
                    )));
                }
                tx.execute(
                    "INSERT INTO knowledge_bases (name, slug, kb_type, description, dimension, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        kb_name,
                        slug,
                        role.kb_type().label(),
                        format!("{} KB for project {name}", role.label()),
                        dimension as i64,
                        now
                    ],
                )?;
                let kb_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO project_kbs (project_id, role, kb_id) VALUES (?1, ?2, ?3)",
                    params![project_id, role.label(), kb_id],
                )?;
                role_kbs.push((
                    role,
                    KnowledgeBase {
                        id: kb_id,
                        name: kb_name,
                        slug,
                        kb_type: role.kb_type(),
                        description: String::new(),
                        dimension,
                        created_at: now.clone(),
                        updated_at: now.clone(),
                    },
                ));
            }
            tx.commit()?;
            info!(project = name, kbs = role_kbs.len(), "Created project with role KBs");
            Ok((
                Project {
                    id: project_id,
                    name: name.to_string(),
                    path: path.to_path_buf(),
                    description: description.to_string(),
                    created_at: now,
                },
                role_kbs,
            ))
        })
    }

    pub fn get_project(&self, project_id: i64) -> CoreResult<Project> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, name, path, description, created_at FROM projects WHERE id = ?1",
                params![project_id],
                project_from_row,
            )
            .optional()?
            .ok_or_else(|| CoreError::not_found(format!("project {project_id} not found")))
        })
    }

    pub fn list_projects(&self) -> CoreResult<Vec<Project>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, path, description, created_at FROM projects ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], project_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn project_kbs(&self, project_id: i64) -> CoreResult<Vec<(KbRole, KnowledgeBase)>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pk.role, kb.id, kb.name, kb.slug, kb.kb_type, kb.description, kb.dimension, kb.created_at, kb.updated_at
                 FROM project_kbs pk JOIN knowledge_bases kb ON kb.id = pk.kb_id
                 WHERE pk.project_id = ?1 ORDER BY pk.role",
            )?;
            let rows = stmt
                .query_map(params![project_id], |row| {
                    let role: String = row.get(0)?;
                    Ok((
                        role,
                        KnowledgeBase {
                            id: row.get(1)?,
                            name: row.get(2)?,
                            slug: row.get(3)?,
                            kb_type: KbType::parse(&row.get::<_, String>(4)?)
                                .unwrap_or(KbType::Generic),
                            description: row.get(5)?,
                            dimension: row.get::<_, i64>(6)? as usize,
                            created_at: row.get(7)?,
                            updated_at: row.get(8)?,
                        },
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(role, kb)| KbRole::parse(&role).map(|r| (r, kb)))
                .collect())
        })
    }

    pub fn kb_for_role(&self, project_id: i64, role: KbRole) -> CoreResult<KnowledgeBase> {
        self.project_kbs(project_id)?
            .into_iter()
            .find(|(r, _)| *r == role)
            .map(|(_, kb)| kb)
            .ok_or_else(|| {
                CoreError::not_found(format!(
                    "project {project_id} has no '{}' knowledge base",
                    role.label()
                ))
            })
    }

    pub fn save_hook(&self, hook: &Hook) -> CoreResult<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO hooks (project_id, role, enabled, folder, patterns, last_sync_at, synced_files)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (project_id, role) DO UPDATE SET
                    enabled = excluded.enabled,
                    folder = excluded.folder,
                    patterns = excluded.patterns,
                    last_sync_at = excluded.last_sync_at,
                    synced_files = excluded.synced_files",
                params![
                    hook.project_id,
                    hook.role.label(),
                    hook.enabled as i64,
                    hook.folder.to_string_lossy(),
                    serde_json::to_string(&hook.patterns)?,
                    hook.last_sync_at,
                    serde_json::to_string(&hook.synced_files)?
                ],
            )?;
            Ok(())
        })
    }

    pub fn load_hooks(&self, project_id: i64) -> CoreResult<Vec<Hook>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project_id, role, enabled, folder, patterns, last_sync_at, synced_files
                 FROM hooks WHERE project_id = ?1 ORDER BY role",
            )?;
            let rows = stmt
                .query_map(params![project_id], hook_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().flatten().collect())
        })
    }

    pub fn load_all_hooks(&self) -> CoreResult<Vec<Hook>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project_id, role, enabled, folder, patterns, last_sync_at, synced_files
                 FROM hooks ORDER BY project_id, role",
            )?;
            let rows = stmt
                .query_map([], hook_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().flatten().collect())
        })
    }

    /// Record a successful per-file sync on the hook.
    pub fn update_hook_sync(
        &self,
        project_id: i64,
        role: KbRole,
        rel_path: &str,
        hash: Option<&str>,
    ) -> CoreResult<()> {
        self.write(|conn| {
            let row: Option<String> = conn
                .query_row(
                    "SELECT synced_files FROM hooks WHERE project_id = ?1 AND role = ?2",
                    params![project_id, role.label()],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(body) = row else {
                return Err(CoreError::not_found(format!(
                    "hook ({project_id}, {}) not found",
                    role.label()
                )));
            };
            let mut synced: HashMap<String, String> =
                serde_json::from_str(&body).unwrap_or_default();
            match hash {
                Some(h) => {
                    synced.insert(rel_path.to_string(), h.to_string());
                }
                None => {
                    synced.remove(rel_path);
                }
            }
            conn.execute(
                "UPDATE hooks SET synced_files = ?1, last_sync_at = ?2
                 WHERE project_id = ?3 AND role = ?4",
                params![
                    serde_json::to_string(&synced)?,
                    now_ts(),
                    project_id,
                    role.label()
                ],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Job snapshots
    // -----------------------------------------------------------------------

    pub fn flush_job(&self, snap: &JobSnapshot, kind: Option<&crate::types::JobKind>) -> CoreResult<()> {
        let payload = match kind {
            Some(kind) => Some(serde_json::to_string(kind)?),
            None => None,
        };
        self.write(|conn| {
            conn.execute(
                "INSERT INTO jobs_snapshot (id, kind, params, state, percent, message, error, created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (id) DO UPDATE SET
                    params = COALESCE(excluded.params, params),
                    state = excluded.state,
                    percent = excluded.percent,
                    message = excluded.message,
                    error = excluded.error,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at",
                params![
                    snap.id,
                    snap.kind,
                    payload,
                    snap.state.label(),
                    snap.percent as i64,
                    snap.message,
                    snap.error,
                    snap.created_at,
                    snap.started_at,
                    snap.completed_at
                ],
            )?;
            Ok(())
        })
    }

    /// Startup pass: non-terminal snapshots from a previous process become
    /// `failed("interrupted")` unless their kind opted into resumption.
    /// Returns the resumable kind payloads for re-submission (they restart
    /// from the persisted file-hash map).
    pub fn mark_interrupted(&self) -> CoreResult<Vec<crate::types::JobKind>> {
        self.write(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, params FROM jobs_snapshot WHERE state IN ('queued', 'running')",
            )?;
            let stale = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut resumable = Vec::new();
            for (id, kind_label, payload) in stale {
                let kind: Option<crate::types::JobKind> = payload
                    .as_deref()
                    .and_then(|p| serde_json::from_str(p).ok());
                match kind {
                    Some(kind) if kind.is_resumable() => {
                        conn.execute(
                            "UPDATE jobs_snapshot SET state = 'failed', error = 'superseded by resume', completed_at = ?1
                             WHERE id = ?2",
                            params![now_ts(), id],
                        )?;
                        resumable.push(kind);
                    }
                    _ => {
                        warn!(job = id.as_str(), kind = kind_label.as_str(), "Marking interrupted job failed");
                        conn.execute(
                            "UPDATE jobs_snapshot SET state = 'failed', error = 'interrupted', completed_at = ?1
                             WHERE id = ?2",
                            params![now_ts(), id],
                        )?;
                    }
                }
            }
            Ok(resumable)
        })
    }

    pub fn list_job_snapshots(&self) -> CoreResult<Vec<JobSnapshot>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, state, percent, message, error, created_at, started_at, completed_at
                 FROM jobs_snapshot ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([], job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

// ---------------------------------------------------------------------------
// Snapshot (read-only view)
// ---------------------------------------------------------------------------

/// A read-only connection opened at query start. Writes committed later do
/// not affect reads through this handle.
pub struct Snapshot {
    conn: Connection,
}

impl Snapshot {
    pub fn resolve_kb(&self, name_or_slug: &str) -> CoreResult<KnowledgeBase> {
        resolve_kb_with(&self.conn, name_or_slug)
    }

    pub fn kb_stats(&self, kb_id: i64) -> CoreResult<KbStats> {
        kb_stats_with(&self.conn, kb_id)
    }

    pub fn load_tags(&self, kb_id: i64) -> CoreResult<Vec<Tag>> {
        load_tags_with(&self.conn, kb_id)
    }

    pub fn load_repo_map(&self, kb_id: i64) -> CoreResult<Option<RepoMapArtifact>> {
        load_repo_map_with(&self.conn, kb_id)
    }

    /// All chunk rows of a KB with their embeddings and document metadata.
    pub fn chunk_rows(&self, kb_id: i64) -> CoreResult<Vec<ChunkRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.document_id, d.filename, c.ordinal, c.text, c.start_byte, c.end_byte,
                    c.token_count, c.embedding, d.metadata
             FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE d.kb_id = ?1 ORDER BY d.filename, c.ordinal",
        )?;
        let rows = stmt
            .query_map(params![kb_id], |row| {
                let blob: Option<Vec<u8>> = row.get(8)?;
                let meta: String = row.get(9)?;
                Ok(ChunkRow {
                    chunk_id: row.get(0)?,
                    document_id: row.get(1)?,
                    filename: row.get(2)?,
                    ordinal: row.get::<_, i64>(3)? as usize,
                    text: row.get(4)?,
                    start_byte: row.get::<_, i64>(5)? as usize,
                    end_byte: row.get::<_, i64>(6)? as usize,
                    token_count: row.get::<_, i64>(7)? as usize,
                    embedding: blob.map(|b| unpack_embedding(&b)),
                    metadata: serde_json::from_str(&meta).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn bm_stats(&self, kb_id: i64) -> CoreResult<BmStats> {
        let row = self
            .conn
            .query_row(
                "SELECT chunk_count, total_tokens FROM kb_doc_stats WHERE kb_id = ?1",
                params![kb_id],
                |row| {
                    Ok(BmStats {
                        chunk_count: row.get(0)?,
                        total_tokens: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or(BmStats {
            chunk_count: 0,
            total_tokens: 0,
        }))
    }

    pub fn term_df(&self, kb_id: i64, terms: &[String]) -> CoreResult<HashMap<String, i64>> {
        let mut out = HashMap::with_capacity(terms.len());
        let mut stmt = self
            .conn
            .prepare("SELECT df FROM kb_term_stats WHERE kb_id = ?1 AND term = ?2")?;
        for term in terms {
            let df: Option<i64> = stmt
                .query_row(params![kb_id, term], |row| row.get(0))
                .optional()?;
            out.insert(term.clone(), df.unwrap_or(0));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Shared row mappers and helpers
// ---------------------------------------------------------------------------

fn migrate(conn: &Connection) -> CoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let current: Option<i64> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()?;
    let mut version = match current {
        Some(v) => v,
        None => {
            conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
            0
        }
    };
    while (version as usize) < MIGRATIONS.len() {
        let next = version + 1;
        conn.execute_batch(&format!(
            "BEGIN;\n{}\nUPDATE schema_version SET version = {next};\nCOMMIT;",
            MIGRATIONS[version as usize]
        ))?;
        info!(version = next, "Applied store migration");
        version = next;
    }
    Ok(())
}

fn resolve_kb_with(conn: &Connection, name_or_slug: &str) -> CoreResult<KnowledgeBase> {
    conn.query_row(
        "SELECT id, name, slug, kb_type, description, dimension, created_at, updated_at
         FROM knowledge_bases WHERE slug = ?1 OR name = ?1",
        params![name_or_slug],
        kb_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found(format!("knowledge base '{name_or_slug}' not found")))
}

fn kb_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeBase> {
    Ok(KnowledgeBase {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        kb_type: KbType::parse(&row.get::<_, String>(3)?).unwrap_or(KbType::Generic),
        description: row.get(4)?,
        dimension: row.get::<_, i64>(5)? as usize,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn document_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentMeta> {
    let metadata: String = row.get(7)?;
    Ok(DocumentMeta {
        id: row.get(0)?,
        kb_id: row.get(1)?,
        filename: row.get(2)?,
        source_path: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        content_type: row.get(5)?,
        content_hash: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: row.get(8)?,
    })
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn hook_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Hook>> {
    let role: String = row.get(1)?;
    let patterns: String = row.get(4)?;
    let synced: String = row.get(6)?;
    Ok(KbRole::parse(&role).map(|role| Hook {
        project_id: row.get(0).unwrap_or(0),
        role,
        enabled: row.get::<_, i64>(2).unwrap_or(0) != 0,
        folder: PathBuf::from(row.get::<_, String>(3).unwrap_or_default()),
        patterns: serde_json::from_str(&patterns).unwrap_or_default(),
        last_sync_at: row.get(5).unwrap_or(None),
        synced_files: serde_json::from_str(&synced).unwrap_or_default(),
    }))
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobSnapshot> {
    let state: String = row.get(2)?;
    Ok(JobSnapshot {
        id: row.get(0)?,
        kind: row.get(1)?,
        state: JobState::parse(&state).unwrap_or(JobState::Failed),
        percent: row.get::<_, i64>(3)? as u8,
        message: row.get(4)?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

fn load_tags_with(conn: &Connection, kb_id: i64) -> CoreResult<Vec<Tag>> {
    let mut stmt = conn.prepare(
        "SELECT file, name, kind, line, signature, language, identifier, importance
         FROM symbols WHERE kb_id = ?1 ORDER BY importance DESC, file, line",
    )?;
    let rows = stmt
        .query_map(params![kb_id], |row| {
            Ok(Tag {
                file: row.get(0)?,
                name: row.get(1)?,
                kind: TagKind::parse(&row.get::<_, String>(2)?).unwrap_or(TagKind::Other),
                line: row.get::<_, i64>(3)? as usize,
                signature: row.get(4)?,
                language: row.get(5)?,
                identifier: row.get(6)?,
                importance: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_repo_map_with(conn: &Connection, kb_id: i64) -> CoreResult<Option<RepoMapArtifact>> {
    Ok(conn
        .query_row(
            "SELECT text, token_count, budget, overflow, tag_count, generated_at
             FROM repo_maps WHERE kb_id = ?1",
            params![kb_id],
            |row| {
                Ok(RepoMapArtifact {
                    text: row.get(0)?,
                    token_count: row.get::<_, i64>(1)? as usize,
                    budget: row.get::<_, i64>(2)? as usize,
                    overflow: row.get::<_, i64>(3)? != 0,
                    tag_count: row.get::<_, i64>(4)? as usize,
                    generated_at: row.get(5)?,
                })
            },
        )
        .optional()?)
}

fn kb_stats_with(conn: &Connection, kb_id: i64) -> CoreResult<KbStats> {
    let documents: i64 = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE kb_id = ?1",
        params![kb_id],
        |r| r.get(0),
    )?;
    let (chunks, embedded): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COUNT(embedding) FROM chunks c
         JOIN documents d ON d.id = c.document_id WHERE d.kb_id = ?1",
        params![kb_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let symbols: i64 = conn.query_row(
        "SELECT COUNT(*) FROM symbols WHERE kb_id = ?1",
        params![kb_id],
        |r| r.get(0),
    )?;
    let edges: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dependency_edges WHERE kb_id = ?1",
        params![kb_id],
        |r| r.get(0),
    )?;
    let last_updated: Option<String> = conn.query_row(
        "SELECT updated_at FROM knowledge_bases WHERE id = ?1",
        params![kb_id],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT language, COUNT(*) FROM symbols WHERE kb_id = ?1 GROUP BY language",
    )?;
    let languages = stmt
        .query_map(params![kb_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(KbStats {
        documents,
        chunks,
        embedded_chunks: embedded,
        symbols,
        edges,
        last_updated,
        languages,
    })
}

/// Add one chunk's terms and tokens to the incremental BM25 statistics.
fn accrue_chunk_stats(tx: &Transaction<'_>, kb_id: i64, text: &str, tokens: usize) -> CoreResult<()> {
    let terms: HashSet<String> = tokenize_terms(text).into_iter().collect();
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO kb_term_stats (kb_id, term, df) VALUES (?1, ?2, 1)
             ON CONFLICT (kb_id, term) DO UPDATE SET df = df + 1",
        )?;
        for term in terms {
            stmt.execute(params![kb_id, term])?;
        }
    }
    tx.execute(
        "INSERT INTO kb_doc_stats (kb_id, chunk_count, total_tokens) VALUES (?1, 1, ?2)
         ON CONFLICT (kb_id) DO UPDATE SET
            chunk_count = chunk_count + 1,
            total_tokens = total_tokens + excluded.total_tokens",
        params![kb_id, tokens as i64],
    )?;
    Ok(())
}

/// Remove a document's chunks from the BM25 statistics before deletion.
fn retire_chunk_stats(tx: &Transaction<'_>, kb_id: i64, doc_id: i64) -> CoreResult<()> {
    let mut stmt = tx.prepare("SELECT text, token_count FROM chunks WHERE document_id = ?1")?;
    let rows = stmt
        .query_map(params![doc_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    for (text, tokens) in rows {
        let terms: HashSet<String> = tokenize_terms(&text).into_iter().collect();
        {
            let mut dec = tx.prepare_cached(
                "UPDATE kb_term_stats SET df = df - 1 WHERE kb_id = ?1 AND term = ?2",
            )?;
            for term in terms {
                dec.execute(params![kb_id, term])?;
            }
        }
        tx.execute(
            "UPDATE kb_doc_stats SET chunk_count = chunk_count - 1, total_tokens = total_tokens - ?2
             WHERE kb_id = ?1",
            params![kb_id, tokens],
        )?;
    }
    tx.execute(
        "DELETE FROM kb_term_stats WHERE kb_id = ?1 AND df <= 0",
        params![kb_id],
    )?;
    Ok(())
}
