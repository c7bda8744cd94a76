//! Shared fixtures for the integration suites: a fully wired server context
//! over a temp data root with a deterministic local embedder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use corpora_server::config::{Config, DataLayout};
use corpora_server::embedder::{EmbeddingClient, HashEmbedder};
use corpora_server::jobs::JobQueue;
use corpora_server::orchestrator::Orchestrator;
use corpora_server::store::Store;
use corpora_server::tokenizer;
use corpora_server::types::ServerContext;
use corpora_server::watch::WatchManager;

pub const TEST_DIM: usize = 64;

pub struct TestEnv {
    pub ctx: ServerContext,
    pub dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn shutdown(self) {
        self.ctx.watcher.stop_all();
        self.ctx.jobs.shutdown();
    }
}

/// Wire up every service over a temp data root, mirroring the binary's
/// composition root but with the hash embedder instead of HTTP.
pub fn test_env() -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = DataLayout::new(dir.path().join("data"));
    layout.ensure().expect("layout");
    let config = Config::default();

    let store = Arc::new(Store::open(&layout.store_db()).expect("store"));
    let tok = tokenizer::create_tokenizer();
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbedder::new(TEST_DIM));

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&embedder),
        Arc::clone(&tok),
        config.clone(),
        layout.clone(),
    );
    let jobs = JobQueue::start(2, orchestrator.clone(), Arc::clone(&store));
    let watcher = WatchManager::new(
        Arc::clone(&store),
        Arc::clone(&jobs),
        layout.clone(),
        config.watcher.clone(),
    );

    TestEnv {
        ctx: ServerContext {
            store,
            jobs,
            watcher,
            orchestrator,
            embedder,
            tokenizer: tok,
            config: Arc::new(config),
            layout,
        },
        dir,
    }
}

/// The two-file Ruby corpus used across the indexing scenarios.
pub fn write_ruby_fixture(root: &Path) -> PathBuf {
    let src = root.join("src");
    std::fs::create_dir_all(&src).expect("fixture dir");
    std::fs::write(
        src.join("user.rb"),
        "class User\n  def authenticate\n  end\nend\n",
    )
    .expect("user.rb");
    std::fs::write(
        src.join("session.rb"),
        "class Session\n  def user\n    User.authenticate\n  end\nend\n",
    )
    .expect("session.rb");
    src
}
