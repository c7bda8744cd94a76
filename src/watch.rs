//! Per-project file watching: debounced sync tasks for enabled hook roles.
//!
//! Events collapse in a 2 s per-file window, pass the hook's glob allow-list,
//! and land in the job queue under a (role, project, path) coalescing key.
//! When the queue crosses its high-water mark the watcher pauses accrual and
//! reconciles by a selective rescan once drained; startup always does a full
//! reconcile against the persisted hook state.

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{DataLayout, WatcherSettings};
use crate::error::{CoreError, CoreResult};
use crate::jobs::JobQueue;
use crate::store::Store;
use crate::types::{content_hash, now_ts, FsEventKind, Hook, JobKind, KbRole, SyncTask};

// ---------------------------------------------------------------------------
// Hook runtime
// ---------------------------------------------------------------------------

struct HookRuntime {
    hook: Hook,
    globs: GlobSet,
}

fn compile_patterns(patterns: &[String]) -> CoreResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    if patterns.is_empty() {
        builder.add(Glob::new("**/*").map_err(|e| CoreError::validation(e.to_string()))?);
    }
    for pattern in patterns {
        // Bare patterns like `*.md` should match at any depth.
        let widened = if pattern.contains('/') {
            pattern.clone()
        } else {
            format!("**/{pattern}")
        };
        builder.add(Glob::new(&widened).map_err(|e| {
            CoreError::validation(format!("bad hook pattern '{pattern}': {e}"))
        })?);
    }
    builder
        .build()
        .map_err(|e| CoreError::validation(e.to_string()))
}

// ---------------------------------------------------------------------------
// Watch manager
// ---------------------------------------------------------------------------

struct ProjectWatch {
    // Kept alive for the watch duration; dropping it stops event delivery.
    _watcher: RecommendedWatcher,
    stop: Arc<AtomicBool>,
}

pub struct WatchManager {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    layout: DataLayout,
    settings: WatcherSettings,
    projects: Mutex<HashMap<i64, ProjectWatch>>,
}

impl WatchManager {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        layout: DataLayout,
        settings: WatcherSettings,
    ) -> Arc<WatchManager> {
        Arc::new(WatchManager {
            store,
            queue,
            layout,
            settings,
            projects: Mutex::new(HashMap::new()),
        })
    }

    /// Enable (or update) a hook and begin watching its folder.
    pub fn enable_hook(
        &self,
        project_id: i64,
        role: KbRole,
        folder: PathBuf,
        patterns: Vec<String>,
    ) -> CoreResult<Hook> {
        if !folder.is_dir() {
            return Err(CoreError::validation(format!(
                "hook folder '{}' is not a directory",
                folder.display()
            )));
        }
        compile_patterns(&patterns)?;

        // Preserve the synced-file map across re-enables.
        let previous = self
            .store
            .load_hooks(project_id)?
            .into_iter()
            .find(|h| h.role == role);
        let mut hook = Hook::new(project_id, role, folder, patterns);
        if let Some(prev) = previous {
            hook.synced_files = prev.synced_files;
            hook.last_sync_at = prev.last_sync_at;
        }
        self.store.save_hook(&hook)?;
        self.mirror_hooks(project_id)?;
        self.restart_project(project_id)?;
        info!(project = project_id, role = role.label(), "Hook enabled");
        Ok(hook)
    }

    /// Write the layout's JSON mirror of a project's hooks.
    fn mirror_hooks(&self, project_id: i64) -> CoreResult<()> {
        let hooks = self.store.load_hooks(project_id)?;
        let path = self.layout.hook_file(project_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&hooks)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// (Re)start the watcher for one project based on its enabled hooks.
    pub fn restart_project(&self, project_id: i64) -> CoreResult<()> {
        self.stop_project(project_id);

        let hooks: Vec<HookRuntime> = self
            .store
            .load_hooks(project_id)?
            .into_iter()
            .filter(|h| h.enabled)
            .map(|hook| {
                let globs = compile_patterns(&hook.patterns)?;
                Ok(HookRuntime { hook, globs })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        if hooks.is_empty() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| CoreError::dependency(format!("watcher init failed: {e}")))?;

        for runtime in &hooks {
            watcher
                .watch(&runtime.hook.folder, RecursiveMode::Recursive)
                .map_err(|e| {
                    CoreError::dependency(format!(
                        "cannot watch {}: {e}",
                        runtime.hook.folder.display()
                    ))
                })?;
            debug!(
                project = project_id,
                role = runtime.hook.role.label(),
                folder = %runtime.hook.folder.display(),
                "Watching hook folder"
            );
        }

        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&stop);
            let queue = Arc::clone(&self.queue);
            let store = Arc::clone(&self.store);
            let settings = self.settings.clone();
            std::thread::Builder::new()
                .name(format!("corpora-watch-{project_id}"))
                .spawn(move || {
                    debounce_loop(rx, hooks, project_id, queue, store, settings, stop);
                })
                .map_err(|e| CoreError::dependency(format!("watch thread spawn failed: {e}")))?;
        }

        self.projects.lock().unwrap().insert(
            project_id,
            ProjectWatch {
                _watcher: watcher,
                stop,
            },
        );
        Ok(())
    }

    pub fn stop_project(&self, project_id: i64) {
        if let Some(existing) = self.projects.lock().unwrap().remove(&project_id) {
            existing.stop.store(true, Ordering::Relaxed);
        }
    }

    pub fn stop_all(&self) {
        let mut projects = self.projects.lock().unwrap();
        for (_, watch) in projects.drain() {
            watch.stop.store(true, Ordering::Relaxed);
        }
    }

    /// Compare on-disk state against each hook's synced-file map and enqueue
    /// sync tasks for the differences. Startup runs this for every project
    /// (full rescan); the post-backpressure path is the selective variant in
    /// the debounce loop.
    pub fn reconcile_project(&self, project_id: i64) -> CoreResult<usize> {
        let hooks = self.store.load_hooks(project_id)?;
        let mut submitted = 0;
        for hook in hooks.into_iter().filter(|h| h.enabled) {
            let globs = compile_patterns(&hook.patterns)?;
            submitted += reconcile_hook(&hook, &globs, project_id, &self.queue);
        }
        if submitted > 0 {
            info!(project = project_id, tasks = submitted, "Reconciled missed changes");
        }
        Ok(submitted)
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
}

/// Diff one hook's folder against its synced-file hash map.
fn reconcile_hook(hook: &Hook, globs: &GlobSet, project_id: i64, queue: &JobQueue) -> usize {
    let mut seen: HashMap<String, String> = HashMap::new();
    let walker = ignore::WalkBuilder::new(&hook.folder).hidden(false).build();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(rel) = relative_path(&hook.folder, path) else {
            continue;
        };
        if !globs.is_match(&rel) {
            continue;
        }
        let Ok(bytes) = std::fs::read(path) else {
            continue;
        };
        seen.insert(rel, content_hash(&bytes));
    }

    let mut submitted = 0;
    for (rel, hash) in &seen {
        if hook.synced_files.get(rel) != Some(hash) {
            submit_sync(queue, hook.role, project_id, rel, FsEventKind::Modify);
            submitted += 1;
        }
    }
    for rel in hook.synced_files.keys() {
        if !seen.contains_key(rel) {
            submit_sync(queue, hook.role, project_id, rel, FsEventKind::Delete);
            submitted += 1;
        }
    }
    submitted
}

fn submit_sync(queue: &JobQueue, role: KbRole, project_id: i64, rel: &str, kind: FsEventKind) {
    let task = SyncTask {
        kb_role: role,
        project_id,
        path: rel.to_string(),
        event_kind: kind,
        observed_at: now_ts(),
    };
    let key = task.coalesce_key();
    queue.submit_coalesced(JobKind::ReindexFile { task }, key);
}

// ---------------------------------------------------------------------------
// Debounce loop
// ---------------------------------------------------------------------------

fn classify_event(kind: &EventKind) -> Option<FsEventKind> {
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Create),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => Some(FsEventKind::Rename),
        EventKind::Modify(_) => Some(FsEventKind::Modify),
        EventKind::Remove(_) => Some(FsEventKind::Delete),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn debounce_loop(
    rx: mpsc::Receiver<Event>,
    hooks: Vec<HookRuntime>,
    project_id: i64,
    queue: Arc<JobQueue>,
    store: Arc<Store>,
    settings: WatcherSettings,
    stop: Arc<AtomicBool>,
) {
    let debounce = Duration::from_millis(settings.debounce_ms);
    let mut pending: HashMap<(KbRole, String), (Instant, FsEventKind)> = HashMap::new();
    let mut second_start = Instant::now();
    let mut submitted_this_second = 0usize;

    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => {
                let Some(fs_kind) = classify_event(&event.kind) else {
                    continue;
                };
                let now = Instant::now();
                for path in &event.paths {
                    if path.is_dir() {
                        continue;
                    }
                    for runtime in &hooks {
                        let Some(rel) = relative_path(&runtime.hook.folder, path) else {
                            continue;
                        };
                        // Existence decides delete vs. modify for renames.
                        let kind = if fs_kind == FsEventKind::Rename && !path.exists() {
                            FsEventKind::Delete
                        } else {
                            fs_kind
                        };
                        if !runtime.globs.is_match(&rel) {
                            continue;
                        }
                        // Later events win the window.
                        pending.insert((runtime.hook.role, rel), (now, kind));
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }

        if pending.is_empty() {
            continue;
        }

        // Backpressure: pause accrual in 1 s windows until the queue drains,
        // then reconcile selectively in case events were missed.
        if queue.depth() > settings.high_water {
            warn!(project = project_id, depth = queue.depth(), "Queue high-water, pausing watcher");
            while queue.depth() > settings.low_water && !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_secs(1));
            }
            pending.clear();
            for runtime in &hooks {
                if let Ok(fresh) = store.load_hooks(project_id) {
                    if let Some(hook) = fresh.into_iter().find(|h| h.role == runtime.hook.role) {
                        reconcile_hook(&hook, &runtime.globs, project_id, &queue);
                    }
                }
            }
            continue;
        }

        // Flush entries older than the debounce window, rate-limited.
        let now = Instant::now();
        if now.duration_since(second_start) >= Duration::from_secs(1) {
            second_start = now;
            submitted_this_second = 0;
        }
        let ready: Vec<(KbRole, String, FsEventKind)> = pending
            .iter()
            .filter(|(_, (t, _))| now.duration_since(*t) >= debounce)
            .map(|((role, rel), (_, kind))| (*role, rel.clone(), *kind))
            .collect();
        for (role, rel, kind) in ready {
            if submitted_this_second >= settings.max_tasks_per_sec {
                break;
            }
            pending.remove(&(role, rel.clone()));
            submit_sync(&queue, role, project_id, &rel, kind);
            submitted_this_second += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreResult;
    use crate::jobs::{JobCtx, JobRunner};
    use crate::types::KbType;

    /// Records every ReindexFile task it executes.
    struct RecordingRunner {
        tasks: Arc<Mutex<Vec<SyncTask>>>,
    }

    impl JobRunner for RecordingRunner {
        fn run(&self, kind: &JobKind, _ctx: &JobCtx) -> CoreResult<()> {
            if let JobKind::ReindexFile { task } = kind {
                self.tasks.lock().unwrap().push(task.clone());
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: Arc<WatchManager>,
        queue: Arc<JobQueue>,
        tasks: Arc<Mutex<Vec<SyncTask>>>,
        project_id: i64,
        docs_dir: PathBuf,
    }

    fn fixture(settings: WatcherSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("store.db")).unwrap());
        store.create_kb("seed", KbType::Generic, "", 0).unwrap();
        let (project, _) = store
            .create_project("demo", dir.path(), "", 0)
            .unwrap();
        let docs_dir = dir.path().join("docs");
        std::fs::create_dir_all(&docs_dir).unwrap();

        let tasks = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(RecordingRunner {
            tasks: Arc::clone(&tasks),
        });
        let queue = JobQueue::start(2, runner, Arc::clone(&store));
        let layout = DataLayout::new(dir.path().join("data"));
        layout.ensure().unwrap();
        let manager = WatchManager::new(Arc::clone(&store), Arc::clone(&queue), layout, settings);
        Fixture {
            _dir: dir,
            manager,
            queue,
            tasks,
            project_id: project.id,
            docs_dir,
        }
    }

    #[test]
    fn test_compile_patterns_widens_bare_globs() {
        let globs = compile_patterns(&["*.md".to_string()]).unwrap();
        assert!(globs.is_match("a.md"));
        assert!(globs.is_match("nested/deep/b.md"));
        assert!(!globs.is_match("c.rs"));
    }

    #[test]
    fn test_empty_patterns_match_everything() {
        let globs = compile_patterns(&[]).unwrap();
        assert!(globs.is_match("anything/at/all.xyz"));
    }

    #[test]
    fn test_bad_pattern_is_validation() {
        let err = compile_patterns(&["[".to_string()]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_reconcile_enqueues_unsynced_files() {
        let fx = fixture(WatcherSettings::default());
        std::fs::write(fx.docs_dir.join("a.md"), "alpha").unwrap();
        std::fs::write(fx.docs_dir.join("b.md"), "beta").unwrap();
        std::fs::write(fx.docs_dir.join("skip.rs"), "code").unwrap();

        fx.manager
            .enable_hook(
                fx.project_id,
                KbRole::Docs,
                fx.docs_dir.clone(),
                vec!["*.md".to_string()],
            )
            .unwrap();
        let submitted = fx.manager.reconcile_project(fx.project_id).unwrap();
        assert_eq!(submitted, 2, "both markdown files differ from empty sync map");

        // Let the queue drain and check the recorded tasks.
        std::thread::sleep(Duration::from_millis(300));
        let tasks = fx.tasks.lock().unwrap();
        let mut paths: Vec<&str> = tasks.iter().map(|t| t.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["a.md", "b.md"]);
        fx.manager.stop_all();
        fx.queue.shutdown();
    }

    #[test]
    fn test_reconcile_detects_deletions() {
        let fx = fixture(WatcherSettings::default());
        fx.manager
            .enable_hook(
                fx.project_id,
                KbRole::Docs,
                fx.docs_dir.clone(),
                vec!["*.md".to_string()],
            )
            .unwrap();
        // Pretend gone.md was synced earlier.
        let mut hook = fx.manager.store.load_hooks(fx.project_id).unwrap()[0].clone();
        hook.synced_files
            .insert("gone.md".to_string(), "stale-hash".to_string());
        fx.manager.store.save_hook(&hook).unwrap();

        fx.manager.reconcile_project(fx.project_id).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let tasks = fx.tasks.lock().unwrap();
        assert!(tasks
            .iter()
            .any(|t| t.path == "gone.md" && t.event_kind == FsEventKind::Delete));
        fx.manager.stop_all();
        fx.queue.shutdown();
    }

    #[test]
    fn test_debounce_collapses_burst_into_one_task() {
        let settings = WatcherSettings {
            debounce_ms: 600,
            ..Default::default()
        };
        let fx = fixture(settings);
        fx.manager
            .enable_hook(
                fx.project_id,
                KbRole::Docs,
                fx.docs_dir.clone(),
                vec!["*.md".to_string()],
            )
            .unwrap();

        // Five appends inside the debounce window.
        let target = fx.docs_dir.join("a.md");
        for i in 0..5 {
            let mut body = std::fs::read_to_string(&target).unwrap_or_default();
            body.push_str(&format!("line {i}\n"));
            std::fs::write(&target, body).unwrap();
            std::thread::sleep(Duration::from_millis(80));
        }

        // Wait past debounce + queue execution.
        std::thread::sleep(Duration::from_millis(2500));
        let tasks = fx.tasks.lock().unwrap();
        let for_a: Vec<&SyncTask> = tasks.iter().filter(|t| t.path == "a.md").collect();
        assert_eq!(for_a.len(), 1, "burst should collapse to one task: {for_a:?}");
        fx.manager.stop_all();
        fx.queue.shutdown();
    }

    #[test]
    fn test_pattern_filter_discards_before_debounce() {
        let settings = WatcherSettings {
            debounce_ms: 300,
            ..Default::default()
        };
        let fx = fixture(settings);
        fx.manager
            .enable_hook(
                fx.project_id,
                KbRole::Docs,
                fx.docs_dir.clone(),
                vec!["*.md".to_string()],
            )
            .unwrap();

        std::fs::write(fx.docs_dir.join("code.rs"), "fn main() {}").unwrap();
        std::thread::sleep(Duration::from_millis(1500));
        let tasks = fx.tasks.lock().unwrap();
        assert!(tasks.iter().all(|t| t.path != "code.rs"));
        fx.manager.stop_all();
        fx.queue.shutdown();
    }
}
