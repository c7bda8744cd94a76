//! JSON-RPC 2.0 tool surface for agent hosts.
//!
//! One endpoint serves the global tool catalog; a path-scoped endpoint
//! (`/rpc/{slug}`) narrows the catalog to one KB and binds `kb` implicitly
//! in every call. Dispatch is pure over the core services, so the whole
//! surface is testable without HTTP.

use axum::{
    extract::{Path as UrlPath, State},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::api::{ingest_bytes, run_query};
use crate::error::{CoreError, CoreResult};
use crate::retrieval::{self, QueryOptions};
use crate::types::{KbType, ServerContext};

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(ctx: ServerContext) -> Router {
    Router::new()
        .route("/rpc", post(handle_global))
        .route("/rpc/{slug}", post(handle_scoped))
        .with_state(ctx)
}

async fn handle_global(State(ctx): State<ServerContext>, body: String) -> Json<Value> {
    Json(dispatch_blocking(ctx, None, body).await)
}

async fn handle_scoped(
    State(ctx): State<ServerContext>,
    UrlPath(slug): UrlPath<String>,
    body: String,
) -> Json<Value> {
    Json(dispatch_blocking(ctx, Some(slug), body).await)
}

async fn dispatch_blocking(ctx: ServerContext, scope: Option<String>, body: String) -> Value {
    tokio::task::spawn_blocking(move || dispatch(&ctx, scope.as_deref(), &body))
        .await
        .unwrap_or_else(|e| {
            error_envelope(Value::Null, PARSE_ERROR, &format!("dispatch panicked: {e}"))
        })
}

// ---------------------------------------------------------------------------
// Envelope handling
// ---------------------------------------------------------------------------

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn result_envelope(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Parse one JSON-RPC request and run it. `scope` binds the `kb` argument.
pub fn dispatch(ctx: &ServerContext, scope: Option<&str>, body: &str) -> Value {
    let request: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return error_envelope(Value::Null, PARSE_ERROR, &format!("parse error: {e}")),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
        return error_envelope(id, INVALID_REQUEST, "missing method");
    };
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));
    debug!(method = method, scoped = scope.is_some(), "Tool call");

    match run_method(ctx, scope, method, &params) {
        Ok(result) => result_envelope(id, result),
        Err(RpcError::Code(code, message)) => error_envelope(id, code, &message),
        Err(RpcError::Core(e)) => error_envelope(id, e.rpc_code(), &e.to_string()),
    }
}

enum RpcError {
    Code(i64, String),
    Core(CoreError),
}

impl From<CoreError> for RpcError {
    fn from(e: CoreError) -> Self {
        RpcError::Core(e)
    }
}

fn invalid_params(msg: impl Into<String>) -> RpcError {
    RpcError::Code(INVALID_PARAMS, msg.into())
}

/// Resolve the `kb` argument: the path scope wins, otherwise it must be a
/// string parameter.
fn kb_arg<'a>(scope: Option<&'a str>, params: &'a Value) -> Result<&'a str, RpcError> {
    if let Some(slug) = scope {
        return Ok(slug);
    }
    params
        .get("kb")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid_params("missing 'kb' parameter"))
}

fn run_method(
    ctx: &ServerContext,
    scope: Option<&str>,
    method: &str,
    params: &Value,
) -> Result<Value, RpcError> {
    match method {
        "list_tools" => Ok(tool_catalog(scope.is_some())),

        "list_knowledge_bases" => {
            let kbs = ctx.store.list_kbs()?;
            Ok(json!({ "knowledge_bases": kbs }))
        }

        "create_knowledge_base" => {
            if scope.is_some() {
                return Err(RpcError::Code(
                    METHOD_NOT_FOUND,
                    "create_knowledge_base is not available on a KB-scoped endpoint".to_string(),
                ));
            }
            let name = params
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid_params("missing 'name'"))?;
            let kb_type = match params.get("kb_type").and_then(|v| v.as_str()) {
                None | Some("") => KbType::Generic,
                Some(raw) => KbType::parse(raw)
                    .ok_or_else(|| invalid_params(format!("unknown kb_type '{raw}'")))?,
            };
            let description = params
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let kb = ctx.store.create_kb(name, kb_type, description, 0)?;
            Ok(json!({ "slug": kb.slug, "id": kb.id }))
        }

        "delete_knowledge_base" => {
            let kb = kb_arg(scope, params)?;
            ctx.store.delete_kb(kb)?;
            Ok(json!({ "deleted": true }))
        }

        "get_kb_stats" => {
            let kb = kb_arg(scope, params)?;
            let stats = ctx.store.kb_stats(kb)?;
            Ok(serde_json::to_value(stats).map_err(CoreError::from)?)
        }

        "list_documents" => {
            let kb = kb_arg(scope, params)?;
            let kb = ctx.store.resolve_kb(kb)?;
            let docs = ctx.store.list_documents(kb.id)?;
            Ok(json!({ "documents": docs }))
        }

        "search_knowledge_base" => {
            let kb = kb_arg(scope, params)?;
            let query = params
                .get("query")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid_params("missing 'query'"))?;
            let options = params.get("options").cloned().unwrap_or_else(|| json!({}));
            let opts = QueryOptions {
                k: params
                    .get("k")
                    .and_then(|v| v.as_u64())
                    .map(|k| k as usize)
                    .unwrap_or(retrieval::DEFAULT_K),
                use_vector: options
                    .get("use_vector")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true),
                use_bm25: options
                    .get("use_bm25")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                use_rerank: options
                    .get("use_rerank")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                filter: options.get("filter").and_then(|f| {
                    serde_json::from_value::<HashMap<String, String>>(f.clone()).ok()
                }),
            };
            let hits = run_query(ctx, kb, query, opts)?;
            Ok(json!({ "results": hits }))
        }

        "ingest_document" => {
            let kb = kb_arg(scope, params)?;
            let filename = params
                .get("filename")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid_params("missing 'filename'"))?;
            let bytes: Vec<u8> = if let Some(content) =
                params.get("content").and_then(|v| v.as_str())
            {
                content.as_bytes().to_vec()
            } else if let Some(path) = params.get("path").and_then(|v| v.as_str()) {
                std::fs::read(path).map_err(CoreError::from)?
            } else {
                return Err(invalid_params("one of 'content' or 'path' is required"));
            };
            let chunks = ingest_bytes(ctx, kb, filename, &bytes, None)?;
            Ok(json!({ "filename": filename, "chunks": chunks }))
        }

        "ingest_directory" => {
            let kb_name = kb_arg(scope, params)?;
            let path = params
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid_params("missing 'path'"))?;
            let kb = ctx.store.resolve_kb(kb_name)?;
            let files = crate::orchestrator::enumerate_files(std::path::Path::new(path))?;
            let job_ctx = crate::jobs::JobCtx::detached();
            let outcome = crate::semantic::run_semantic_index(
                &ctx.store,
                ctx.embedder.as_ref(),
                ctx.tokenizer.as_ref(),
                &ctx.config,
                &kb,
                &files,
                false,
                &[],
                &std::collections::HashSet::new(),
                &job_ctx,
            )?;
            Ok(serde_json::to_value(outcome).map_err(CoreError::from)?)
        }

        "get_repo_map" => {
            let kb = kb_arg(scope, params)?;
            let kb = ctx.store.resolve_kb(kb)?;
            let map = match params.get("token_budget").and_then(|v| v.as_u64()) {
                Some(budget) => {
                    let tags = ctx.store.load_tags(kb.id)?;
                    crate::repomap::emit(&tags, budget as usize, ctx.tokenizer.as_ref())
                }
                None => ctx
                    .store
                    .load_repo_map(kb.id)?
                    .ok_or_else(|| CoreError::not_found("no repo map stored"))?,
            };
            Ok(json!({
                "text": map.text,
                "token_count": map.token_count,
                "overflow": map.overflow,
            }))
        }

        other => Err(RpcError::Code(
            METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tool catalog
// ---------------------------------------------------------------------------

/// Tool definitions for agent hosts. The scoped catalog drops KB lifecycle
/// tools and the `kb` argument.
fn tool_catalog(scoped: bool) -> Value {
    let kb_param = json!({ "type": "string", "description": "Knowledge base slug or name" });

    let with_kb = |mut properties: serde_json::Map<String, Value>,
                   mut required: Vec<&str>|
     -> (Value, Value) {
        if !scoped {
            properties.insert("kb".to_string(), kb_param.clone());
            required.insert(0, "kb");
        }
        (Value::Object(properties), json!(required))
    };

    let obj = |pairs: &[(&str, Value)]| -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    };

    let mut tools = Vec::new();

    if !scoped {
        tools.push(json!({
            "name": "list_knowledge_bases",
            "description": "List every knowledge base with its slug and type.",
            "inputSchema": { "type": "object", "properties": {} }
        }));
        tools.push(json!({
            "name": "create_knowledge_base",
            "description": "Create a knowledge base. The slug is derived from the name.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "kb_type": { "type": "string", "enum": ["generic", "code", "documentation", "agent-os", "structure"] },
                    "description": { "type": "string" }
                },
                "required": ["name"]
            }
        }));
    }

    let (props, required) = with_kb(obj(&[]), vec![]);
    tools.push(json!({
        "name": "delete_knowledge_base",
        "description": "Delete a knowledge base and every document, chunk, embedding, symbol, and edge it owns.",
        "inputSchema": { "type": "object", "properties": props, "required": required }
    }));

    let (props, required) = with_kb(
        obj(&[
            ("query", json!({ "type": "string", "description": "Search text" })),
            ("k", json!({ "type": "integer", "description": "Result count (default 5, max 200)" })),
            ("options", json!({
                "type": "object",
                "properties": {
                    "use_vector": { "type": "boolean" },
                    "use_bm25": { "type": "boolean" },
                    "use_rerank": { "type": "boolean" },
                    "filter": { "type": "object" }
                }
            })),
        ]),
        vec!["query"],
    );
    tools.push(json!({
        "name": "search_knowledge_base",
        "description": "Hybrid retrieval over a knowledge base: dense vectors by default, BM25 and reranking on request.",
        "inputSchema": { "type": "object", "properties": props, "required": required }
    }));

    let (props, required) = with_kb(obj(&[]), vec![]);
    tools.push(json!({
        "name": "get_kb_stats",
        "description": "Document, chunk, symbol, and edge counts plus language breakdown.",
        "inputSchema": { "type": "object", "properties": props, "required": required }
    }));

    let (props, required) = with_kb(obj(&[]), vec![]);
    tools.push(json!({
        "name": "list_documents",
        "description": "List the documents of a knowledge base.",
        "inputSchema": { "type": "object", "properties": props, "required": required }
    }));

    let (props, required) = with_kb(
        obj(&[
            ("filename", json!({ "type": "string" })),
            ("content", json!({ "type": "string", "description": "Inline document body" })),
            ("path", json!({ "type": "string", "description": "Read the body from this file instead" })),
        ]),
        vec!["filename"],
    );
    tools.push(json!({
        "name": "ingest_document",
        "description": "Chunk and embed one document into a knowledge base.",
        "inputSchema": { "type": "object", "properties": props, "required": required }
    }));

    let (props, required) = with_kb(
        obj(&[("path", json!({ "type": "string", "description": "Directory to ingest" }))]),
        vec!["path"],
    );
    tools.push(json!({
        "name": "ingest_directory",
        "description": "Recursively ingest a directory (honors .gitignore and the built-in deny list).",
        "inputSchema": { "type": "object", "properties": props, "required": required }
    }));

    let (props, required) = with_kb(
        obj(&[("token_budget", json!({ "type": "integer" }))]),
        vec![],
    );
    tools.push(json!({
        "name": "get_repo_map",
        "description": "Token-budgeted map of the most important symbols in a structural knowledge base.",
        "inputSchema": { "type": "object", "properties": props, "required": required }
    }));

    json!({ "tools": tools })
}

// ---------------------------------------------------------------------------
// Helpers used by dispatch
// ---------------------------------------------------------------------------

impl ServerContext {
    /// Convenience used by tests and the CLI: a dispatch that returns the
    /// bare result or the mapped error.
    pub fn call_tool(&self, scope: Option<&str>, method: &str, params: Value) -> CoreResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        })
        .to_string();
        let response = dispatch(self, scope, &body);
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("tool call failed");
            return Err(CoreError::validation(message.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}
