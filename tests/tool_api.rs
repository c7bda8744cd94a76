//! JSON-RPC tool surface: catalog scoping, envelope shapes, and the minimum
//! tool set an agent host drives.

mod helpers;

use serde_json::{json, Value};

use corpora_server::rpc::dispatch;

use helpers::test_env;

fn call(ctx: &corpora_server::types::ServerContext, scope: Option<&str>, method: &str, params: Value) -> Value {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 42,
        "method": method,
        "params": params,
    })
    .to_string();
    dispatch(ctx, scope, &body)
}

#[test]
fn test_kb_lifecycle_over_rpc() {
    let env = test_env();

    let created = call(
        &env.ctx,
        None,
        "create_knowledge_base",
        json!({ "name": "Agent Notes", "kb_type": "documentation" }),
    );
    assert_eq!(created["jsonrpc"], "2.0");
    assert_eq!(created["id"], 42);
    assert_eq!(created["result"]["slug"], "agent-notes");

    let listed = call(&env.ctx, None, "list_knowledge_bases", json!({}));
    let names: Vec<&str> = listed["result"]["knowledge_bases"]
        .as_array()
        .unwrap()
        .iter()
        .map(|kb| kb["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"Agent Notes"));

    let deleted = call(
        &env.ctx,
        None,
        "delete_knowledge_base",
        json!({ "kb": "agent-notes" }),
    );
    assert_eq!(deleted["result"]["deleted"], true);

    let missing = call(&env.ctx, None, "get_kb_stats", json!({ "kb": "agent-notes" }));
    assert!(missing["error"]["message"]
        .as_str()
        .unwrap()
        .contains("not found"));

    env.shutdown();
}

#[test]
fn test_ingest_and_search() {
    let env = test_env();
    call(
        &env.ctx,
        None,
        "create_knowledge_base",
        json!({ "name": "notes" }),
    );

    let ingested = call(
        &env.ctx,
        None,
        "ingest_document",
        json!({
            "kb": "notes",
            "filename": "auth.md",
            "content": "The authenticate endpoint validates session tokens.",
        }),
    );
    assert_eq!(ingested["result"]["chunks"], 1);

    call(
        &env.ctx,
        None,
        "ingest_document",
        json!({
            "kb": "notes",
            "filename": "deploy.md",
            "content": "Deployment uses a rolling restart of the fleet.",
        }),
    );

    let found = call(
        &env.ctx,
        None,
        "search_knowledge_base",
        json!({
            "kb": "notes",
            "query": "authenticate session",
            "k": 1,
            "options": { "use_bm25": true },
        }),
    );
    let results = found["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["filename"], "auth.md");

    env.shutdown();
}

#[test]
fn test_scoped_endpoint_binds_kb() {
    let env = test_env();
    call(
        &env.ctx,
        None,
        "create_knowledge_base",
        json!({ "name": "scoped" }),
    );
    call(
        &env.ctx,
        None,
        "ingest_document",
        json!({ "kb": "scoped", "filename": "a.md", "content": "walrus content here" }),
    );

    // No `kb` parameter anywhere: the path scope supplies it.
    let stats = call(&env.ctx, Some("scoped"), "get_kb_stats", json!({}));
    assert_eq!(stats["result"]["documents"], 1);

    let hits = call(
        &env.ctx,
        Some("scoped"),
        "search_knowledge_base",
        json!({ "query": "walrus" }),
    );
    assert!(hits["result"]["results"].as_array().unwrap().len() >= 1);

    // KB lifecycle tools are absent from the scoped surface.
    let refused = call(
        &env.ctx,
        Some("scoped"),
        "create_knowledge_base",
        json!({ "name": "other" }),
    );
    assert_eq!(refused["error"]["code"], -32601);

    // Scoped catalog omits the global tools.
    let catalog = call(&env.ctx, Some("scoped"), "list_tools", json!({}));
    let tool_names: Vec<&str> = catalog["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(!tool_names.contains(&"create_knowledge_base"));
    assert!(tool_names.contains(&"search_knowledge_base"));

    env.shutdown();
}

#[test]
fn test_error_envelopes() {
    let env = test_env();

    // Unparseable body.
    let garbage = dispatch(&env.ctx, None, "{not json");
    assert_eq!(garbage["error"]["code"], -32700);

    // Missing method.
    let no_method = dispatch(&env.ctx, None, r#"{"jsonrpc":"2.0","id":1}"#);
    assert_eq!(no_method["error"]["code"], -32600);

    // Unknown method.
    let unknown = call(&env.ctx, None, "walk_the_dog", json!({}));
    assert_eq!(unknown["error"]["code"], -32601);

    // Missing params.
    let bad_params = call(&env.ctx, None, "search_knowledge_base", json!({}));
    assert_eq!(bad_params["error"]["code"], -32602);

    // Core NotFound maps to its application code.
    let missing = call(&env.ctx, None, "get_kb_stats", json!({ "kb": "ghost" }));
    assert_eq!(missing["error"]["code"], -32002);

    env.shutdown();
}

#[test]
fn test_get_repo_map_over_rpc() {
    let env = test_env();
    let fixture = helpers::write_ruby_fixture(env.root());
    call(
        &env.ctx,
        None,
        "create_knowledge_base",
        json!({ "name": "rm", "kb_type": "structure" }),
    );
    let job_ctx = corpora_server::jobs::JobCtx::detached();
    env.ctx
        .orchestrator
        .run_structural("rm", &fixture, 1024, &job_ctx)
        .unwrap();

    let stored = call(&env.ctx, Some("rm"), "get_repo_map", json!({}));
    assert!(stored["result"]["text"]
        .as_str()
        .unwrap()
        .contains("user.rb"));

    // Budget re-fit path: a budget below even the first header overflows.
    let refit = call(
        &env.ctx,
        Some("rm"),
        "get_repo_map",
        json!({ "token_budget": 2 }),
    );
    assert_eq!(refit["result"]["overflow"], true);

    env.shutdown();
}
