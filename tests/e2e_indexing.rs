//! End-to-end indexing scenarios: structural round trip, selective semantic
//! idempotence, hybrid query, repo-map overflow, and cascade delete.

mod helpers;

use std::time::{Duration, Instant};

use corpora_server::jobs::JobCtx;
use corpora_server::retrieval::{self, QueryOptions};
use corpora_server::types::KbType;

use helpers::{test_env, write_ruby_fixture};

#[test]
fn test_structural_round_trip() {
    let env = test_env();
    let fixture = write_ruby_fixture(env.root());
    env.ctx
        .store
        .create_kb("ruby-demo", KbType::Structure, "demo", 0)
        .unwrap();

    let job_ctx = JobCtx::detached();
    let outcome = env
        .ctx
        .orchestrator
        .run_structural("ruby-demo", &fixture, 1024, &job_ctx)
        .unwrap();

    assert_eq!(outcome.files_enumerated, 2);
    assert_eq!(outcome.edge_count, 1);

    let kb = env.ctx.store.resolve_kb("ruby-demo").unwrap();

    // One collapsed edge: user.rb (definer) → session.rb (referrer).
    let edges = env.ctx.store.load_edges(kb.id).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].from_file, "user.rb");
    assert_eq!(edges[0].to_file, "session.rb");

    // Definer outranks referrer, so user.rb symbols lead the tag order.
    let tags = env.ctx.store.load_tags(kb.id).unwrap();
    assert_eq!(tags.len(), 4);
    let user_importance = tags
        .iter()
        .find(|t| t.name == "User")
        .map(|t| t.importance)
        .unwrap();
    let session_importance = tags
        .iter()
        .find(|t| t.name == "Session")
        .map(|t| t.importance)
        .unwrap();
    assert!(user_importance > session_importance);

    // Repo map at budget 1024 holds both files, user.rb first.
    let map = env.ctx.store.load_repo_map(kb.id).unwrap().unwrap();
    assert!(!map.overflow);
    assert!(map.token_count <= 1024);
    let user_pos = map.text.find("user.rb").expect("user.rb in map");
    let session_pos = map.text.find("session.rb").expect("session.rb in map");
    assert!(user_pos < session_pos);

    env.shutdown();
}

#[test]
fn test_reindex_unchanged_is_identical() {
    let env = test_env();
    let fixture = write_ruby_fixture(env.root());
    env.ctx
        .store
        .create_kb("ruby-demo", KbType::Structure, "", 0)
        .unwrap();
    let kb = env.ctx.store.resolve_kb("ruby-demo").unwrap();
    let job_ctx = JobCtx::detached();

    env.ctx
        .orchestrator
        .run_structural("ruby-demo", &fixture, 1024, &job_ctx)
        .unwrap();
    let first_tags = env.ctx.store.load_tags(kb.id).unwrap();
    let first_map = env.ctx.store.load_repo_map(kb.id).unwrap().unwrap();

    env.ctx
        .orchestrator
        .run_structural("ruby-demo", &fixture, 1024, &job_ctx)
        .unwrap();
    let second_tags = env.ctx.store.load_tags(kb.id).unwrap();
    let second_map = env.ctx.store.load_repo_map(kb.id).unwrap().unwrap();

    // Identical symbol sets in identical order, identical rendered map.
    let key = |tags: &[corpora_server::types::Tag]| -> Vec<(String, String, usize)> {
        tags.iter()
            .map(|t| (t.file.clone(), t.name.clone(), t.line))
            .collect()
    };
    assert_eq!(key(&first_tags), key(&second_tags));
    assert_eq!(first_map.text, second_map.text);
    assert_eq!(first_map.token_count, second_map.token_count);

    env.shutdown();
}

#[test]
fn test_selective_semantic_and_idempotence() {
    let env = test_env();
    let fixture = write_ruby_fixture(env.root());
    env.ctx
        .store
        .create_kb("ruby-demo", KbType::Structure, "", 0)
        .unwrap();
    env.ctx
        .store
        .create_kb("ruby-demo-index", KbType::Code, "", 0)
        .unwrap();

    let job_ctx = JobCtx::detached();
    env.ctx
        .orchestrator
        .run_structural("ruby-demo", &fixture, 1024, &job_ctx)
        .unwrap();

    // Freshly written fixture files sit inside the personalization window,
    // so the small corpus selects everything.
    let outcome = env
        .ctx
        .orchestrator
        .run_semantic("ruby-demo-index", &fixture, true, Some("ruby-demo"), &job_ctx)
        .unwrap();
    assert_eq!(outcome.files_selected, 2);
    assert_eq!(outcome.files_embedded, 2);
    assert!(outcome.chunks_written >= 2);
    assert!(outcome.failures.is_empty());

    // Chunks all carry the hash embedder's dimension.
    let kb = env.ctx.store.resolve_kb("ruby-demo-index").unwrap();
    assert_eq!(kb.dimension, helpers::TEST_DIM);
    let snapshot = env.ctx.store.snapshot().unwrap();
    for row in snapshot.chunk_rows(kb.id).unwrap() {
        assert_eq!(row.embedding.unwrap().len(), helpers::TEST_DIM);
    }

    // Second run over an unchanged corpus embeds nothing.
    let second = env
        .ctx
        .orchestrator
        .run_semantic("ruby-demo-index", &fixture, true, Some("ruby-demo"), &job_ctx)
        .unwrap();
    assert_eq!(second.files_embedded, 0);
    assert_eq!(second.chunks_written, 0);
    assert_eq!(second.files_skipped, 2);

    env.shutdown();
}

#[test]
fn test_hybrid_query_finds_authenticate() {
    let env = test_env();
    let fixture = write_ruby_fixture(env.root());
    env.ctx
        .store
        .create_kb("ruby-demo", KbType::Structure, "", 0)
        .unwrap();
    env.ctx
        .store
        .create_kb("ruby-demo-index", KbType::Code, "", 0)
        .unwrap();
    let job_ctx = JobCtx::detached();
    env.ctx
        .orchestrator
        .run_structural("ruby-demo", &fixture, 1024, &job_ctx)
        .unwrap();
    env.ctx
        .orchestrator
        .run_semantic("ruby-demo-index", &fixture, true, Some("ruby-demo"), &job_ctx)
        .unwrap();

    let snapshot = env.ctx.store.snapshot().unwrap();
    let kb = snapshot.resolve_kb("ruby-demo-index").unwrap();
    let opts = QueryOptions {
        k: 3,
        use_vector: true,
        use_bm25: true,
        use_rerank: false,
        filter: None,
    };
    let hits = retrieval::query(
        &snapshot,
        &kb,
        "authenticate",
        &opts,
        env.ctx.embedder.as_ref(),
        Instant::now() + Duration::from_secs(20),
    )
    .unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].filename, "user.rb", "hits: {:?}",
        hits.iter().map(|h| (&h.filename, h.score)).collect::<Vec<_>>());
    assert!(hits[0].text.contains("authenticate"));

    env.shutdown();
}

#[test]
fn test_repo_map_overflow_flag() {
    let env = test_env();
    let src = env.root().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        src.join("extremely_long_module_file_name_for_overflow.rb"),
        "class ExtremelyLongClassNameForOverflowBehaviour\n  def run\n  end\nend\n",
    )
    .unwrap();
    env.ctx
        .store
        .create_kb("tiny", KbType::Structure, "", 0)
        .unwrap();

    let job_ctx = JobCtx::detached();
    env.ctx
        .orchestrator
        .run_structural("tiny", &src, 10, &job_ctx)
        .unwrap();

    let kb = env.ctx.store.resolve_kb("tiny").unwrap();
    let map = env.ctx.store.load_repo_map(kb.id).unwrap().unwrap();
    assert!(map.overflow);
    assert_eq!(
        map.text,
        "extremely_long_module_file_name_for_overflow.rb\n"
    );
    assert!(map.token_count > 10);

    env.shutdown();
}

#[test]
fn test_empty_kb_boundaries() {
    let env = test_env();
    env.ctx
        .store
        .create_kb("empty", KbType::Generic, "", 0)
        .unwrap();

    let stats = env.ctx.store.kb_stats("empty").unwrap();
    assert_eq!(stats.documents, 0);
    assert_eq!(stats.chunks, 0);

    // Structural index over an empty directory: empty map, zero tokens.
    let src = env.root().join("empty-src");
    std::fs::create_dir_all(&src).unwrap();
    let job_ctx = JobCtx::detached();
    env.ctx
        .orchestrator
        .run_structural("empty", &src, 1024, &job_ctx)
        .unwrap();
    let kb = env.ctx.store.resolve_kb("empty").unwrap();
    let map = env.ctx.store.load_repo_map(kb.id).unwrap().unwrap();
    assert_eq!(map.text, "");
    assert_eq!(map.token_count, 0);

    env.shutdown();
}

#[test]
fn test_cascade_delete_through_full_pipeline() {
    let env = test_env();
    let fixture = write_ruby_fixture(env.root());
    env.ctx
        .store
        .create_kb("doomed", KbType::Structure, "", 0)
        .unwrap();
    let job_ctx = JobCtx::detached();
    env.ctx
        .orchestrator
        .run_structural("doomed", &fixture, 1024, &job_ctx)
        .unwrap();
    env.ctx
        .orchestrator
        .run_semantic("doomed", &fixture, false, None, &job_ctx)
        .unwrap();

    let kb = env.ctx.store.resolve_kb("doomed").unwrap();
    let before = env.ctx.store.kb_stats("doomed").unwrap();
    assert!(before.documents > 0);
    assert!(before.symbols > 0);

    env.ctx.store.delete_kb("doomed").unwrap();

    assert!(env.ctx.store.resolve_kb("doomed").is_err());
    let snapshot = env.ctx.store.snapshot().unwrap();
    assert!(snapshot.chunk_rows(kb.id).unwrap().is_empty());
    assert!(env.ctx.store.load_tags(kb.id).unwrap().is_empty());
    assert!(env.ctx.store.load_edges(kb.id).unwrap().is_empty());
    assert!(env.ctx.store.load_repo_map(kb.id).unwrap().is_none());

    env.shutdown();
}
