//! HTTP resource API: CRUD on knowledge bases, documents, projects, and
//! hooks; indexing triggers; queries; job status; repo-map fetch.
//!
//! Handlers are thin adapters: validate, call the core, map errors to
//! `{"detail": message}`. Store and embedding work runs on the blocking
//! pool so serving tasks are never starved by ingestion.

use axum::{
    extract::{Multipart, Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::CoreError;
use crate::jobs::JobCtx;
use crate::retrieval::{self, QueryOptions};
use crate::semantic;
use crate::types::{
    content_hash, JobKind, KbRole, KbType, ServerContext, DEFAULT_MAP_BUDGET,
};

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(serde_json::json!({ "detail": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run blocking core work off the serving task.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, CoreError> + Send + 'static,
) -> ApiResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(CoreError::Fatal(format!("worker panicked: {e}"))))?
        .map_err(ApiError)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(ctx: ServerContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/kb", post(create_kb).get(list_kbs))
        .route("/api/kb/{name}", axum::routing::delete(delete_kb))
        .route("/api/kb/{name}/stats", get(kb_stats))
        .route("/api/kb/{name}/upload", post(upload))
        .route("/api/kb/{name}/import", post(import_directory))
        .route("/api/kb/{name}/index-structural", post(index_structural))
        .route("/api/kb/{name}/index-semantic", post(index_semantic))
        .route("/api/kb/{name}/repo-map", get(repo_map))
        .route("/api/kb/{name}/documents", get(list_documents))
        .route("/api/kb/{name}/query", post(query_kb))
        .route("/api/kb/{name}/chat", post(chat))
        .route("/api/projects", post(create_project).get(list_projects))
        .route(
            "/api/projects/{id}/hooks/{role}/enable",
            post(enable_hook),
        )
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(job_status))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(ctx): State<ServerContext>) -> impl IntoResponse {
    let store_ok = !ctx.store.is_read_only();
    let embedder_ready = {
        let embedder = ctx.embedder.clone();
        tokio::task::spawn_blocking(move || embedder.ready())
            .await
            .unwrap_or(false)
    };
    let status = if !store_ok {
        "critical"
    } else if !embedder_ready {
        "degraded"
    } else {
        "ok"
    };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "store": if store_ok { "ok" } else { "read-only" },
        "embedder": embedder_ready,
        "queue_depth": ctx.jobs.depth(),
    }))
}

// ---------------------------------------------------------------------------
// Knowledge bases
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateKbBody {
    name: String,
    #[serde(default)]
    kb_type: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dimension: Option<usize>,
}

async fn create_kb(
    State(ctx): State<ServerContext>,
    Json(body): Json<CreateKbBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let kb = blocking(move || {
        let kb_type = match body.kb_type.as_deref() {
            None | Some("") => KbType::Generic,
            Some(raw) => KbType::parse(raw)
                .ok_or_else(|| CoreError::validation(format!("unknown kb_type '{raw}'")))?,
        };
        let dimension = body.dimension.unwrap_or(0);
        ctx.store
            .create_kb(&body.name, kb_type, &body.description, dimension)
    })
    .await?;
    Ok(Json(serde_json::json!({
        "id": kb.id,
        "name": kb.name,
        "slug": kb.slug,
        "kb_type": kb.kb_type.label(),
    })))
}

async fn list_kbs(State(ctx): State<ServerContext>) -> ApiResult<Json<serde_json::Value>> {
    let kbs = blocking(move || ctx.store.list_kbs()).await?;
    Ok(Json(serde_json::json!({ "knowledge_bases": kbs })))
}

async fn delete_kb(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    blocking(move || ctx.store.delete_kb(&name)).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn kb_stats(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Json<crate::store::KbStats>> {
    let stats = blocking(move || ctx.store.kb_stats(&name)).await?;
    Ok(Json(stats))
}

async fn list_documents(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let docs = blocking(move || {
        let kb = ctx.store.resolve_kb(&name)?;
        ctx.store.list_documents(kb.id)
    })
    .await?;
    Ok(Json(serde_json::json!({ "documents": docs })))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Chunk + embed one in-memory document; fall back to unembedded chunks
/// (plus a re-embed job) when the backend is down.
pub(crate) fn ingest_bytes(
    ctx: &ServerContext,
    kb_slug: &str,
    filename: &str,
    bytes: &[u8],
    source_path: Option<&str>,
) -> Result<usize, CoreError> {
    let kb = ctx.store.resolve_kb(kb_slug)?;
    if bytes.is_empty() {
        return Err(CoreError::validation("empty file"));
    }
    if crate::types::looks_binary(bytes) {
        return Err(CoreError::validation("binary content is not ingestible"));
    }
    let text = String::from_utf8_lossy(bytes).into_owned();
    let ext = filename.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    let class = crate::tokenizer::text_class_for_ext(ext);
    let pieces = crate::chunker::chunk_document(
        &text,
        class,
        &[],
        &ctx.config.chunker,
        ctx.tokenizer.as_ref(),
    );
    if pieces.is_empty() {
        return Err(CoreError::validation("document produced no chunks"));
    }
    let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
    let embeddings = match ctx.embedder.embed(&texts) {
        Ok(embs) => Some(embs),
        Err(e) => {
            warn!(file = filename, error = %e, "Embedding unavailable, storing chunks only");
            None
        }
    };
    let chunks = pieces.len();
    ctx.store.upsert_document(
        kb.id,
        filename,
        source_path,
        if class == crate::tokenizer::TextClass::Prose {
            "text/markdown"
        } else {
            "text/plain"
        },
        &content_hash(bytes),
        bytes.len() as u64,
        &HashMap::new(),
        &pieces,
        embeddings.as_deref(),
    )?;
    if embeddings.is_none() {
        ctx.jobs.submit(JobKind::ChunkEmbed {
            kb_slug: kb.slug.clone(),
            filename: filename.to_string(),
        });
    }
    Ok(chunks)
}

async fn upload(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut ingested = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(CoreError::validation(format!("bad multipart body: {e}"))))?
    {
        let filename = field
            .file_name()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "upload.txt".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError(CoreError::validation(format!("bad multipart body: {e}"))))?
            .to_vec();

        let ctx = ctx.clone();
        let kb_name = name.clone();
        let (filename, chunks) = blocking(move || {
            // Content-addressed copy of the raw upload.
            let hash = content_hash(&bytes);
            let upload_path = ctx
                .layout
                .uploads_dir()
                .join(format!("{}-{filename}", &hash[..16]));
            std::fs::create_dir_all(ctx.layout.uploads_dir())?;
            std::fs::write(&upload_path, &bytes)?;
            let chunks = ingest_bytes(
                &ctx,
                &kb_name,
                &filename,
                &bytes,
                Some(&upload_path.to_string_lossy()),
            )?;
            Ok((filename, chunks))
        })
        .await?;
        ingested.push(serde_json::json!({ "filename": filename, "chunks": chunks }));
    }
    if ingested.is_empty() {
        return Err(ApiError(CoreError::validation("no files in upload")));
    }
    Ok(Json(serde_json::json!({ "ingested": ingested })))
}

#[derive(Deserialize)]
struct ImportBody {
    directory_path: PathBuf,
    #[serde(default)]
    file_types: Vec<String>,
}

async fn import_directory(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
    Json(body): Json<ImportBody>,
) -> ApiResult<Json<semantic::SemanticOutcome>> {
    let outcome = blocking(move || {
        let kb = ctx.store.resolve_kb(&name)?;
        let mut files = crate::orchestrator::enumerate_files(&body.directory_path)?;
        if !body.file_types.is_empty() {
            let wanted: HashSet<String> = body
                .file_types
                .iter()
                .map(|t| t.trim_start_matches('.').to_ascii_lowercase())
                .collect();
            files.retain(|(rel, _)| {
                rel.rsplit_once('.')
                    .map(|(_, ext)| wanted.contains(&ext.to_ascii_lowercase()))
                    .unwrap_or(false)
            });
        }
        let ctx_job = JobCtx::detached();
        semantic::run_semantic_index(
            &ctx.store,
            ctx.embedder.as_ref(),
            ctx.tokenizer.as_ref(),
            &ctx.config,
            &kb,
            &files,
            false,
            &[],
            &HashSet::new(),
            &ctx_job,
        )
    })
    .await?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Indexing triggers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StructuralBody {
    project_path: PathBuf,
    #[serde(default)]
    token_budget: Option<usize>,
    /// Run inline instead of enqueueing.
    #[serde(default)]
    sync: bool,
}

async fn index_structural(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
    Json(body): Json<StructuralBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let budget = body.token_budget.unwrap_or(DEFAULT_MAP_BUDGET);
    if body.sync {
        let outcome = blocking(move || {
            let job_ctx = JobCtx::detached();
            ctx.orchestrator
                .run_structural(&name, &body.project_path, budget, &job_ctx)
        })
        .await?;
        return Ok(Json(serde_json::to_value(outcome).map_err(CoreError::from)?));
    }
    let job_id = blocking(move || {
        ctx.store.resolve_kb(&name)?;
        Ok(ctx.jobs.submit(JobKind::Structural {
            kb_slug: name,
            project_path: body.project_path,
            token_budget: budget,
        }))
    })
    .await?;
    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

#[derive(Deserialize)]
struct SemanticBody {
    project_path: PathBuf,
    #[serde(default)]
    selective: Option<bool>,
    #[serde(default)]
    code_structure_kb: Option<String>,
}

async fn index_semantic(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
    Json(body): Json<SemanticBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = blocking(move || {
        ctx.store.resolve_kb(&name)?;
        if let Some(structure) = &body.code_structure_kb {
            ctx.store.resolve_kb(structure)?;
        }
        Ok(ctx.jobs.submit(JobKind::Semantic {
            kb_slug: name,
            project_path: body.project_path,
            selective: body.selective.unwrap_or(true),
            structure_kb_slug: body.code_structure_kb,
        }))
    })
    .await?;
    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

// ---------------------------------------------------------------------------
// Repo map
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RepoMapQuery {
    token_budget: Option<usize>,
}

async fn repo_map(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
    Query(params): Query<RepoMapQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let map = blocking(move || {
        let kb = ctx.store.resolve_kb(&name)?;
        match params.token_budget {
            // Re-fit the stored ranked tags to the requested budget.
            Some(budget) => {
                let tags = ctx.store.load_tags(kb.id)?;
                Ok(crate::repomap::emit(&tags, budget, ctx.tokenizer.as_ref()))
            }
            None => ctx.store.load_repo_map(kb.id)?.ok_or_else(|| {
                CoreError::not_found(format!("no repo map stored for '{}'", kb.slug))
            }),
        }
    })
    .await?;
    Ok(Json(serde_json::json!({
        "text": map.text,
        "token_count": map.token_count,
        "budget": map.budget,
        "overflow": map.overflow,
        "generated_at": map.generated_at,
    })))
}

// ---------------------------------------------------------------------------
// Query & chat
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct QueryBody {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    use_vector: Option<bool>,
    #[serde(default)]
    use_bm25: Option<bool>,
    #[serde(default)]
    use_rerank: Option<bool>,
    #[serde(default)]
    filter: Option<HashMap<String, String>>,
}

pub(crate) fn run_query(
    ctx: &ServerContext,
    kb_name: &str,
    text: &str,
    opts: QueryOptions,
) -> Result<Vec<retrieval::ScoredChunk>, CoreError> {
    let snapshot = ctx.store.snapshot()?;
    let kb = snapshot.resolve_kb(kb_name)?;
    let deadline =
        Instant::now() + Duration::from_secs(ctx.config.server.query_deadline_secs);
    retrieval::query(&snapshot, &kb, text, &opts, ctx.embedder.as_ref(), deadline)
}

async fn query_kb(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
    Json(body): Json<QueryBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let hits = blocking(move || {
        let opts = QueryOptions {
            k: body.k.unwrap_or(retrieval::DEFAULT_K),
            use_vector: body.use_vector.unwrap_or(true),
            use_bm25: body.use_bm25.unwrap_or(false),
            use_rerank: body.use_rerank.unwrap_or(false),
            filter: body.filter,
        };
        run_query(&ctx, &name, &body.query, opts)
    })
    .await?;
    Ok(Json(serde_json::json!({ "results": hits })))
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    context_size: Option<usize>,
}

/// Retrieval-only chat support: returns the context block and sources; the
/// answer itself is delegated to the caller's model.
async fn chat(
    State(ctx): State<ServerContext>,
    UrlPath(name): UrlPath<String>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (context, sources) = blocking(move || {
        let opts = QueryOptions {
            k: body.context_size.unwrap_or(5),
            use_vector: true,
            use_bm25: true,
            use_rerank: false,
            filter: None,
        };
        let hits = run_query(&ctx, &name, &body.message, opts)?;
        let context = hits
            .iter()
            .map(|h| format!("### {} (chunk {})\n{}", h.filename, h.ordinal, h.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let sources: Vec<serde_json::Value> = hits
            .iter()
            .map(|h| {
                serde_json::json!({
                    "filename": h.filename,
                    "ordinal": h.ordinal,
                    "score": h.score,
                })
            })
            .collect();
        Ok((context, sources))
    })
    .await?;
    Ok(Json(serde_json::json!({
        "context": context,
        "sources": sources,
    })))
}

// ---------------------------------------------------------------------------
// Projects & hooks
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateProjectBody {
    name: String,
    path: PathBuf,
    #[serde(default)]
    description: String,
}

async fn create_project(
    State(ctx): State<ServerContext>,
    Json(body): Json<CreateProjectBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (project, kbs) = blocking(move || {
        let dimension = ctx.config.embedder.dimension;
        ctx.store
            .create_project(&body.name, &body.path, &body.description, dimension)
    })
    .await?;
    let kb_list: Vec<serde_json::Value> = kbs
        .iter()
        .map(|(role, kb)| {
            serde_json::json!({ "role": role.label(), "slug": kb.slug, "id": kb.id })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "project": project,
        "knowledge_bases": kb_list,
    })))
}

async fn list_projects(State(ctx): State<ServerContext>) -> ApiResult<Json<serde_json::Value>> {
    let projects = blocking(move || ctx.store.list_projects()).await?;
    Ok(Json(serde_json::json!({ "projects": projects })))
}

#[derive(Deserialize)]
struct EnableHookBody {
    folder_path: PathBuf,
    #[serde(default)]
    patterns: Vec<String>,
}

async fn enable_hook(
    State(ctx): State<ServerContext>,
    UrlPath((id, role)): UrlPath<(i64, String)>,
    Json(body): Json<EnableHookBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let hook = blocking(move || {
        let role = KbRole::parse(&role)
            .ok_or_else(|| CoreError::validation(format!("unknown hook role '{role}'")))?;
        ctx.store.get_project(id)?;
        let hook = ctx
            .watcher
            .enable_hook(id, role, body.folder_path, body.patterns)?;
        // Initial sync of anything already in the folder.
        ctx.watcher.reconcile_project(id)?;
        Ok(hook)
    })
    .await?;
    Ok(Json(serde_json::json!({
        "enabled": hook.enabled,
        "role": hook.role.label(),
        "folder": hook.folder,
        "patterns": hook.patterns,
    })))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

async fn list_jobs(State(ctx): State<ServerContext>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(serde_json::json!({ "jobs": ctx.jobs.list(None) })))
}

async fn job_status(
    State(ctx): State<ServerContext>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<Json<crate::types::JobSnapshot>> {
    match ctx.jobs.status(&id) {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError(CoreError::not_found(format!("job '{id}' not found")))),
    }
}

async fn cancel_job(
    State(ctx): State<ServerContext>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if ctx.jobs.status(&id).is_none() {
        return Err(ApiError(CoreError::not_found(format!("job '{id}' not found"))));
    }
    ctx.jobs.cancel(&id);
    Ok(Json(serde_json::json!({ "cancelled": true })))
}
