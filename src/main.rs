//! Corpora binary — thin CLI shell over the [`corpora_server`] library crate.

use axum::Router;
use clap::{CommandFactory, Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use corpora_server::config::{Config, DataLayout};
use corpora_server::embedder::{EmbeddingClient, HttpEmbedder};
use corpora_server::error::{CoreError, CoreResult, ErrorKind};
use corpora_server::jobs::{JobCtx, JobQueue};
use corpora_server::orchestrator::Orchestrator;
use corpora_server::store::Store;
use corpora_server::types::{KbRole, ServerContext, DEFAULT_MAP_BUDGET};
use corpora_server::watch::WatchManager;
use corpora_server::{export, semantic, tokenizer};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Local knowledge-base server: structural + semantic code indexes over
/// HTTP and JSON-RPC.
#[derive(Parser)]
#[command(name = "corpora", version, about, long_about = None)]
struct Cli {
    /// Data root directory (default: $CORPORA_DATA_ROOT or ~/.local/share/corpora)
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP + JSON-RPC server
    Serve {
        /// Bind to 0.0.0.0 instead of 127.0.0.1
        #[arg(long)]
        bind_all: bool,
    },
    /// Import a directory into a knowledge base
    Import {
        /// Knowledge base slug or name
        kb: String,
        /// Directory to import
        path: PathBuf,
        /// Only these extensions (repeatable, e.g. -t md -t rs)
        #[arg(short = 't', long = "type")]
        file_types: Vec<String>,
    },
    /// Show statistics for a knowledge base
    Stats {
        /// Knowledge base slug or name
        kb: String,
    },
    /// Re-run structural + semantic indexing for a project
    Reindex {
        /// Project name
        project: String,
    },
    /// Export a project's knowledge bases
    Export {
        /// Project name
        project: String,
        /// Output directory (default: <data-root>/exports)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Restore knowledge bases from an export
    Restore {
        /// Backup id (export file stem) or path to the export db
        backup_id: String,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Exit codes: 0 success, 1 user error, 2 transient failure, 3 fatal
// ---------------------------------------------------------------------------

fn exit_code(e: &CoreError) -> i32 {
    match e.kind() {
        ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Conflict => 1,
        ErrorKind::Dependency => 2,
        ErrorKind::Integrity | ErrorKind::Fatal => 3,
    }
}

fn bail(e: CoreError) -> ! {
    error!(error = %e, kind = e.kind().label(), "Command failed");
    std::process::exit(exit_code(&e));
}

// ---------------------------------------------------------------------------
// Composition root
// ---------------------------------------------------------------------------

struct Services {
    ctx: ServerContext,
}

fn build_services(data_root: Option<PathBuf>, workers: Option<usize>) -> CoreResult<Services> {
    let layout = DataLayout::resolve(data_root);
    layout.ensure()?;
    let config = Config::load(&layout.root)?;

    let store = Arc::new(Store::open(&layout.store_db())?);
    let tokenizer = tokenizer::create_tokenizer();
    let embedder: Arc<dyn EmbeddingClient> =
        Arc::new(HttpEmbedder::new(config.embedder.clone()));

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&embedder),
        Arc::clone(&tokenizer),
        config.clone(),
        layout.clone(),
    );

    // Jobs left non-terminal by a previous process: resumable indexing kinds
    // restart from the persisted hash maps, everything else fails as
    // interrupted.
    let resumable = store.mark_interrupted()?;

    let worker_count = workers.unwrap_or_else(|| config.worker_count());
    let jobs = JobQueue::start(worker_count, orchestrator.clone(), Arc::clone(&store));
    for kind in resumable {
        info!(kind = kind.label(), "Resuming interrupted indexing job");
        jobs.submit(kind);
    }

    let watcher = WatchManager::new(
        Arc::clone(&store),
        Arc::clone(&jobs),
        layout.clone(),
        config.watcher.clone(),
    );

    Ok(Services {
        ctx: ServerContext {
            store,
            jobs,
            watcher,
            orchestrator,
            embedder,
            tokenizer,
            config: Arc::new(config),
            layout,
        },
    })
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("corpora=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "corpora", &mut std::io::stdout());
        }
        Commands::Serve { bind_all } => serve(cli.data_root, bind_all).await,
        Commands::Import {
            kb,
            path,
            file_types,
        } => run_import(cli.data_root, &kb, &path, &file_types),
        Commands::Stats { kb } => run_stats(cli.data_root, &kb),
        Commands::Reindex { project } => run_reindex(cli.data_root, &project),
        Commands::Export { project, output } => {
            run_export(cli.data_root, &project, output.as_deref())
        }
        Commands::Restore { backup_id } => run_restore(cli.data_root, &backup_id),
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn serve(data_root: Option<PathBuf>, bind_all: bool) {
    let services = match build_services(data_root, None) {
        Ok(s) => s,
        Err(e) => bail(e),
    };
    let ctx = services.ctx;

    // Startup reconciliation: full rescan of every project's hook folders
    // against the persisted hash maps, then live watching.
    match ctx.store.list_projects() {
        Ok(projects) => {
            for project in projects {
                if let Err(e) = ctx.watcher.restart_project(project.id) {
                    warn!(project = project.name.as_str(), error = %e, "Watcher start failed");
                }
                if let Err(e) = ctx.watcher.reconcile_project(project.id) {
                    warn!(project = project.name.as_str(), error = %e, "Startup reconcile failed");
                }
            }
        }
        Err(e) => bail(e),
    }

    let app = Router::new()
        .merge(corpora_server::api::router(ctx.clone()))
        .merge(corpora_server::rpc::router(ctx.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let bind_all = bind_all || ctx.config.server.bind_all;
    let bind_addr = if bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}"))
            .await
            .unwrap_or_else(|e| {
                error!(port = port, error = %e, "Could not bind to port");
                std::process::exit(2);
            })
    } else {
        // Auto-scan: try 8750..=8759
        const BASE: u16 = 8750;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            if let Ok(l) = tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                found = Some(l);
                break;
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "No free port found");
            eprintln!("  Try: PORT=<port> corpora serve");
            std::process::exit(2);
        })
    };

    let port = listener.local_addr().unwrap().port();
    info!(port = port, data_root = %ctx.layout.root.display(), "http://localhost:{port}");
    info!("JSON-RPC tool endpoint at /rpc (KB-scoped: /rpc/{{slug}})");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("CORPORA_PORT={port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "Server error");
            std::process::exit(3);
        });

    ctx.watcher.stop_all();
    ctx.jobs.shutdown();
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

fn run_import(data_root: Option<PathBuf>, kb_name: &str, path: &std::path::Path, file_types: &[String]) {
    let services = match build_services(data_root, Some(1)) {
        Ok(s) => s,
        Err(e) => bail(e),
    };
    let ctx = &services.ctx;
    let result = (|| -> CoreResult<semantic::SemanticOutcome> {
        let kb = ctx.store.resolve_kb(kb_name)?;
        let mut files = corpora_server::orchestrator::enumerate_files(path)?;
        if !file_types.is_empty() {
            let wanted: HashSet<String> = file_types
                .iter()
                .map(|t| t.trim_start_matches('.').to_ascii_lowercase())
                .collect();
            files.retain(|(rel, _)| {
                rel.rsplit_once('.')
                    .map(|(_, ext)| wanted.contains(&ext.to_ascii_lowercase()))
                    .unwrap_or(false)
            });
        }
        let job_ctx = JobCtx::detached();
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
            &job_ctx,
        )
    })();
    ctx.jobs.shutdown();
    match result {
        Ok(outcome) => {
            println!(
                "imported {} files ({} chunks, {} skipped, {} failed)",
                outcome.files_embedded,
                outcome.chunks_written,
                outcome.files_skipped,
                outcome.failures.len()
            );
        }
        Err(e) => bail(e),
    }
}

fn run_stats(data_root: Option<PathBuf>, kb: &str) {
    let services = match build_services(data_root, Some(1)) {
        Ok(s) => s,
        Err(e) => bail(e),
    };
    let result = services.ctx.store.kb_stats(kb);
    services.ctx.jobs.shutdown();
    match result {
        Ok(stats) => println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default()),
        Err(e) => bail(e),
    }
}

fn run_reindex(data_root: Option<PathBuf>, project_name: &str) {
    let services = match build_services(data_root, Some(1)) {
        Ok(s) => s,
        Err(e) => bail(e),
    };
    let ctx = &services.ctx;
    let result = (|| -> CoreResult<()> {
        let project = ctx
            .store
            .list_projects()?
            .into_iter()
            .find(|p| p.name == project_name)
            .ok_or_else(|| {
                CoreError::not_found(format!("project '{project_name}' not found"))
            })?;
        let structure_kb = ctx.store.kb_for_role(project.id, KbRole::Structure)?;
        let index_kb = ctx.store.kb_for_role(project.id, KbRole::Index)?;

        let job_ctx = JobCtx::detached();
        let outcome = ctx.orchestrator.run_structural(
            &structure_kb.slug,
            &project.path,
            DEFAULT_MAP_BUDGET,
            &job_ctx,
        )?;
        println!(
            "structural: {} files, {} symbols, {} edges, map {} tokens",
            outcome.files_enumerated, outcome.tag_count, outcome.edge_count, outcome.map_tokens
        );

        let outcome = ctx.orchestrator.run_semantic(
            &index_kb.slug,
            &project.path,
            true,
            Some(&structure_kb.slug),
            &job_ctx,
        )?;
        println!(
            "semantic: {} embedded, {} skipped, {} chunks",
            outcome.files_embedded, outcome.files_skipped, outcome.chunks_written
        );
        Ok(())
    })();
    ctx.jobs.shutdown();
    if let Err(e) = result {
        bail(e);
    }
}

fn run_export(data_root: Option<PathBuf>, project: &str, output: Option<&std::path::Path>) {
    let services = match build_services(data_root, Some(1)) {
        Ok(s) => s,
        Err(e) => bail(e),
    };
    let ctx = &services.ctx;
    let result = export::export_project(&ctx.store, &ctx.layout, project, output);
    ctx.jobs.shutdown();
    match result {
        Ok(paths) => {
            println!("export: {}", paths.db.display());
            println!("manifest: {}", paths.manifest.display());
        }
        Err(e) => bail(e),
    }
}

fn run_restore(data_root: Option<PathBuf>, backup_id: &str) {
    let services = match build_services(data_root, Some(1)) {
        Ok(s) => s,
        Err(e) => bail(e),
    };
    let ctx = &services.ctx;
    let result = (|| -> CoreResult<export::RestoreOutcome> {
        let db_path = export::find_export(&ctx.layout, backup_id)?;
        export::restore_export(
            &ctx.store,
            &db_path,
            ctx.tokenizer.as_ref(),
            &ctx.config.chunker,
        )
    })();
    ctx.jobs.shutdown();
    match result {
        Ok(outcome) => {
            println!(
                "restored {} knowledge bases, {} documents",
                outcome.knowledge_bases, outcome.documents
            );
        }
        Err(e) => bail(e),
    }
}
