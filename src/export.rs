//! Read-only snapshot export and restore.
//!
//! An export is a standalone SQLite file (format version 1.0) plus a JSON
//! manifest. The relational layout is fixed so other tools can read it; the
//! manifest carries provenance and per-KB statistics.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::chunker;
use crate::config::DataLayout;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::store::Store;
use crate::tokenizer::Tokenizer;
use crate::types::{now_ts, pack_embedding, KbType};

pub const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub db: PathBuf,
    pub manifest: PathBuf,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RestoreOutcome {
    pub knowledge_bases: usize,
    pub documents: usize,
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Export a project's KBs into `<out>/<project>_<ts>.db` + manifest.
pub fn export_project(
    store: &Store,
    layout: &DataLayout,
    project_name: &str,
    output: Option<&Path>,
) -> CoreResult<ExportPaths> {
    let project = store
        .list_projects()?
        .into_iter()
        .find(|p| p.name == project_name)
        .ok_or_else(|| CoreError::not_found(format!("project '{project_name}' not found")))?;
    let role_kbs = store.project_kbs(project.id)?;

    let out_dir = output
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| layout.exports_dir());
    std::fs::create_dir_all(&out_dir)?;

    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let slug = crate::types::slugify(project_name);
    let db_path = out_dir.join(format!("{slug}_{stamp}.db"));
    let manifest_path = out_dir.join(format!("{slug}_{stamp}.manifest.json"));

    let export = Connection::open(&db_path)?;
    export.execute_batch(
        "
        CREATE TABLE knowledge_bases (
            id          INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            slug        TEXT NOT NULL,
            kb_type     TEXT NOT NULL,
            description TEXT NOT NULL,
            dimension   INTEGER NOT NULL
        );
        CREATE TABLE documents (
            id          INTEGER PRIMARY KEY,
            kb_id       INTEGER NOT NULL,
            kb_name     TEXT NOT NULL,
            title       TEXT NOT NULL,
            content     TEXT NOT NULL,
            source_file TEXT,
            metadata    TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE TABLE embeddings (
            id          INTEGER PRIMARY KEY,
            document_id INTEGER NOT NULL,
            embedding   BLOB NOT NULL,
            model       TEXT NOT NULL,
            dimensions  INTEGER NOT NULL
        );
        CREATE TABLE export_metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;

    let exported_at = now_ts();
    for (key, value) in [
        ("format_version", FORMAT_VERSION),
        ("exported_at", exported_at.as_str()),
        ("project_name", project_name),
    ] {
        export.execute(
            "INSERT INTO export_metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }

    let snapshot = store.snapshot()?;
    let mut total_documents = 0i64;
    let mut total_chunks = 0i64;
    let mut kb_names = Vec::new();

    for (_, kb) in &role_kbs {
        export.execute(
            "INSERT INTO knowledge_bases (id, name, slug, kb_type, description, dimension)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                kb.id,
                kb.name,
                kb.slug,
                kb.kb_type.label(),
                kb.description,
                kb.dimension as i64
            ],
        )?;
        kb_names.push(kb.name.clone());

        // Rebuild document bodies from chunk spans (overlap-stripped).
        let rows = snapshot.chunk_rows(kb.id)?;
        let mut by_doc: HashMap<i64, Vec<&crate::store::ChunkRow>> = HashMap::new();
        for row in &rows {
            by_doc.entry(row.document_id).or_default().push(row);
        }
        for doc in store.list_documents(kb.id)? {
            let content = match by_doc.get(&doc.id) {
                Some(doc_rows) => {
                    let mut sorted: Vec<_> = doc_rows.to_vec();
                    sorted.sort_by_key(|r| r.ordinal);
                    let pieces: Vec<chunker::ChunkPiece> = sorted
                        .iter()
                        .map(|r| chunker::ChunkPiece {
                            text: r.text.clone(),
                            start_byte: r.start_byte,
                            end_byte: r.end_byte,
                            token_count: r.token_count,
                        })
                        .collect();
                    chunker::reassemble(&pieces)
                }
                None => String::new(),
            };
            export.execute(
                "INSERT INTO documents (id, kb_id, kb_name, title, content, source_file, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    doc.id,
                    kb.id,
                    kb.name,
                    doc.filename,
                    content,
                    doc.source_path,
                    serde_json::to_string(&doc.metadata)?,
                    doc.created_at
                ],
            )?;
            total_documents += 1;

            if let Some(doc_rows) = by_doc.get(&doc.id) {
                total_chunks += doc_rows.len() as i64;
                for row in doc_rows {
                    if let Some(embedding) = &row.embedding {
                        export.execute(
                            "INSERT INTO embeddings (document_id, embedding, model, dimensions)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![
                                doc.id,
                                pack_embedding(embedding),
                                "local",
                                embedding.len() as i64
                            ],
                        )?;
                    }
                }
            }
        }
    }

    let manifest = json!({
        "format_version": FORMAT_VERSION,
        "exported_at": exported_at,
        "project_name": project_name,
        "knowledge_bases": kb_names,
        "stats": {
            "documents": total_documents,
            "chunks": total_chunks,
        },
        "schema": {
            "tables": ["knowledge_bases", "documents", "embeddings", "export_metadata"],
        },
    });
    std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

    info!(
        project = project_name,
        documents = total_documents,
        db = %db_path.display(),
        "Export complete"
    );
    Ok(ExportPaths {
        db: db_path,
        manifest: manifest_path,
    })
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// Resolve a backup id (export file stem) to its database path.
pub fn find_export(layout: &DataLayout, backup_id: &str) -> CoreResult<PathBuf> {
    let direct = layout.exports_dir().join(format!("{backup_id}.db"));
    if direct.exists() {
        return Ok(direct);
    }
    let as_path = PathBuf::from(backup_id);
    if as_path.exists() {
        return Ok(as_path);
    }
    Err(CoreError::not_found(format!("backup '{backup_id}' not found")))
}

/// Import an export file: missing KBs are recreated, their documents
/// re-chunked with current settings. Embeddings are not restored (the
/// current backend re-embeds on the next semantic run).
pub fn restore_export(
    store: &Store,
    db_path: &Path,
    tok: &dyn Tokenizer,
    chunker_settings: &crate::config::ChunkerSettings,
) -> CoreResult<RestoreOutcome> {
    let export = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let version: Option<String> = export
        .query_row(
            "SELECT value FROM export_metadata WHERE key = 'format_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match version.as_deref() {
        Some(FORMAT_VERSION) => {}
        Some(other) => {
            return Err(CoreError::validation(format!(
                "unsupported export format version '{other}' (expected {FORMAT_VERSION})"
            )));
        }
        None => {
            return Err(CoreError::validation(
                "not a corpora export: missing export_metadata",
            ));
        }
    }

    let mut outcome = RestoreOutcome::default();

    let mut kb_stmt = export.prepare(
        "SELECT id, name, kb_type, description, dimension FROM knowledge_bases ORDER BY id",
    )?;
    let kbs = kb_stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut id_map: HashMap<i64, i64> = HashMap::new();
    for (old_id, name, kb_type, description, dimension) in kbs {
        let kb_type = KbType::parse(&kb_type).unwrap_or(KbType::Generic);
        let kb = match store.resolve_kb(&name) {
            Ok(existing) => {
                warn!(kb = name.as_str(), "Restore target exists, merging documents");
                existing
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                outcome.knowledge_bases += 1;
                store.create_kb(&name, kb_type, &description, dimension as usize)?
            }
            Err(e) => return Err(e),
        };
        id_map.insert(old_id, kb.id);
    }

    let mut doc_stmt = export.prepare(
        "SELECT kb_id, title, content, source_file, metadata, created_at FROM documents ORDER BY id",
    )?;
    let docs = doc_stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (old_kb_id, title, content, source_file, metadata, _created_at) in docs {
        let Some(&kb_id) = id_map.get(&old_kb_id) else {
            continue;
        };
        let ext = title.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        let class = crate::tokenizer::text_class_for_ext(ext);
        let pieces = chunker::chunk_document(&content, class, &[], chunker_settings, tok);
        if pieces.is_empty() {
            continue;
        }
        let metadata: HashMap<String, String> = serde_json::from_str(&metadata).unwrap_or_default();
        store.upsert_document(
            kb_id,
            &title,
            source_file.as_deref(),
            "text/plain",
            &crate::types::content_hash(content.as_bytes()),
            content.len() as u64,
            &metadata,
            &pieces,
            None,
        )?;
        outcome.documents += 1;
    }

    info!(
        kbs = outcome.knowledge_bases,
        documents = outcome.documents,
        "Restore complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkerSettings;
    use crate::tokenizer::EstimateTokenizer;

    fn seeded() -> (tempfile::TempDir, Store, DataLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path().join("data"));
        layout.ensure().unwrap();
        let store = Store::open(&layout.store_db()).unwrap();
        let (project, kbs) = store
            .create_project("demo", dir.path(), "demo project", 4)
            .unwrap();
        let docs_kb = kbs
            .iter()
            .find(|(r, _)| *r == crate::types::KbRole::Docs)
            .map(|(_, kb)| kb.clone())
            .unwrap();
        let body = "Getting started guide.\n\nInstall and run the server.";
        let pieces = vec![chunker::ChunkPiece {
            text: body.to_string(),
            start_byte: 0,
            end_byte: body.len(),
            token_count: 14,
        }];
        store
            .upsert_document(
                docs_kb.id,
                "guide.md",
                None,
                "text/markdown",
                &crate::types::content_hash(body.as_bytes()),
                body.len() as u64,
                &HashMap::new(),
                &pieces,
                Some(&[vec![0.5f32, 0.5, 0.0, 0.0]]),
            )
            .unwrap();
        let _ = project;
        (dir, store, layout)
    }

    #[test]
    fn test_export_writes_db_and_manifest() {
        let (_dir, store, layout) = seeded();
        let paths = export_project(&store, &layout, "demo", None).unwrap();
        assert!(paths.db.exists());
        assert!(paths.manifest.exists());

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&paths.manifest).unwrap()).unwrap();
        assert_eq!(manifest["format_version"], "1.0");
        assert_eq!(manifest["project_name"], "demo");
        assert_eq!(manifest["stats"]["documents"], 1);
        assert_eq!(manifest["knowledge_bases"].as_array().unwrap().len(), 5);

        let export = Connection::open_with_flags(&paths.db, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .unwrap();
        let content: String = export
            .query_row("SELECT content FROM documents WHERE title = 'guide.md'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(content.contains("Getting started"));
        let emb_count: i64 = export
            .query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(emb_count, 1);
    }

    #[test]
    fn test_restore_roundtrip_into_fresh_store() {
        let (_dir, store, layout) = seeded();
        let paths = export_project(&store, &layout, "demo", None).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let fresh = Store::open(&dir2.path().join("store.db")).unwrap();
        let tok = EstimateTokenizer;
        let outcome =
            restore_export(&fresh, &paths.db, &tok, &ChunkerSettings::default()).unwrap();
        assert_eq!(outcome.knowledge_bases, 5);
        assert_eq!(outcome.documents, 1);

        let kb = fresh.resolve_kb("demo docs").unwrap();
        let docs = fresh.list_documents(kb.id).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].filename, "guide.md");
    }

    #[test]
    fn test_restore_rejects_wrong_version() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("old.db");
        let conn = Connection::open(&bogus).unwrap();
        conn.execute_batch(
            "CREATE TABLE export_metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             INSERT INTO export_metadata VALUES ('format_version', '0.9');",
        )
        .unwrap();
        drop(conn);

        let store = Store::open(&dir.path().join("store.db")).unwrap();
        let tok = EstimateTokenizer;
        let err = restore_export(&store, &bogus, &tok, &ChunkerSettings::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_find_export_by_id_and_path() {
        let (_dir, store, layout) = seeded();
        let paths = export_project(&store, &layout, "demo", None).unwrap();
        let stem = paths.db.file_stem().unwrap().to_string_lossy().to_string();
        assert_eq!(find_export(&layout, &stem).unwrap(), paths.db);
        assert_eq!(
            find_export(&layout, &paths.db.to_string_lossy()).unwrap(),
            paths.db
        );
        assert!(find_export(&layout, "nope").is_err());
    }
}
