//! Source watching: filesystem events are coalesced into batches, each batch
//! reruns the tasks bound to the changed paths and then asks the dev server
//! for one browser reload.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, DebouncedEventKind, Debouncer, new_debouncer};
use tracing::{debug, info, warn};

use crate::config::PathConfig;
use crate::error::Fault;
use crate::matcher::{FileMatcher, expand_braces, glob_base};
use crate::scheduler::{RunContext, RunMode, Scheduler, TaskRegistry};
use crate::server::ReloadNotifier;

/// Backend window used only to merge the burst of raw events a single save
/// produces; the user-facing debounce happens in [`WatchLoop`].
const BACKEND_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    Changed(Vec<PathBuf>),
    Stop,
}

/// Source patterns whose changes rerun one named task.
#[derive(Debug, Clone)]
pub struct WatchBinding {
    matcher: FileMatcher,
    task: String,
}

impl WatchBinding {
    pub fn new(root: &Path, patterns: &[String], task: impl Into<String>) -> Self {
        Self {
            matcher: FileMatcher::new(root, patterns),
            task: task.into(),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn patterns(&self) -> &[String] {
        self.matcher.patterns()
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.matcher.is_match(path)
    }
}

/// Builds the watch bindings declared in `config`, failing on a binding
/// that names a task the registry does not know.
pub fn bindings_from_config(
    config: &PathConfig,
    registry: &TaskRegistry,
) -> Result<Vec<WatchBinding>, Fault> {
    config
        .watch
        .iter()
        .map(|spec| {
            registry.get(&spec.task)?;
            Ok(WatchBinding::new(&config.root, &spec.paths, spec.task.clone()))
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchStats {
    pub batches: usize,
    pub rebuilds: usize,
    pub reloads: usize,
}

/// Single-threaded rebuild loop. Rebuilds never overlap: events that arrive
/// while a batch is running stay queued for the next batch.
pub struct WatchLoop {
    registry: TaskRegistry,
    bindings: Vec<WatchBinding>,
    ctx: RunContext,
    notifier: Arc<dyn ReloadNotifier>,
    window: Duration,
}

impl WatchLoop {
    pub fn new(
        registry: TaskRegistry,
        bindings: Vec<WatchBinding>,
        ctx: RunContext,
        notifier: Arc<dyn ReloadNotifier>,
        window: Duration,
    ) -> Self {
        Self {
            registry,
            bindings,
            ctx: ctx.with_mode(RunMode::Watch),
            notifier,
            window,
        }
    }

    /// Consumes signals until [`WatchSignal::Stop`] or until every sender is
    /// gone. Changes still pending when the stop arrives are rebuilt first.
    pub fn run(&self, signals: &Receiver<WatchSignal>) -> WatchStats {
        let mut stats = WatchStats::default();
        loop {
            let mut pending = Vec::new();
            match signals.recv() {
                Ok(WatchSignal::Changed(paths)) => pending.extend(paths),
                Ok(WatchSignal::Stop) | Err(_) => break,
            }

            let deadline = Instant::now() + self.window;
            let mut stop = false;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match signals.recv_timeout(deadline - now) {
                    Ok(WatchSignal::Changed(paths)) => pending.extend(paths),
                    Ok(WatchSignal::Stop) | Err(RecvTimeoutError::Disconnected) => {
                        stop = true;
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                }
            }

            self.rebuild(&pending, &mut stats);
            if stop {
                break;
            }
        }
        debug!(?stats, "Watch loop finished");
        stats
    }

    fn rebuild(&self, changed: &[PathBuf], stats: &mut WatchStats) {
        stats.batches += 1;
        let scheduler = Scheduler::new(&self.registry, self.ctx.clone());
        let mut ran = BTreeSet::new();
        let mut succeeded = false;

        for binding in &self.bindings {
            if ran.contains(binding.task()) || !changed.iter().any(|path| binding.matches(path)) {
                continue;
            }
            ran.insert(binding.task().to_string());
            stats.rebuilds += 1;

            info!(task = binding.task(), changed = changed.len(), "Rebuilding");
            match scheduler.run(binding.task()) {
                Ok(()) => succeeded = true,
                // Already routed to the error sink by the failing task.
                Err(fault) => warn!(task = binding.task(), error = %fault, "Rebuild failed"),
            }
        }

        if ran.is_empty() {
            debug!(changed = changed.len(), "No watch binding matched");
        } else if succeeded {
            stats.reloads += 1;
            self.notifier.notify_reload();
        }
    }
}

/// Running watcher; stopping it drains the pending batch and joins the
/// rebuild thread.
pub struct WatchHandle {
    signals: Sender<WatchSignal>,
    debouncer: Option<Debouncer<RecommendedWatcher>>,
    thread: Option<JoinHandle<WatchStats>>,
}

impl WatchHandle {
    /// Starts filesystem watching for every binding of `watch_loop` and runs
    /// the loop on its own thread.
    pub fn start(root: &Path, watch_loop: WatchLoop) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let events = tx.clone();
        let mut debouncer = new_debouncer(BACKEND_WINDOW, move |result: DebounceEventResult| {
            match result {
                Ok(batch) => {
                    let paths: Vec<PathBuf> = batch
                        .into_iter()
                        .filter(|event| matches!(event.kind, DebouncedEventKind::Any))
                        .map(|event| event.path)
                        .collect();
                    if !paths.is_empty() {
                        let _ = events.send(WatchSignal::Changed(paths));
                    }
                }
                Err(err) => warn!(error = %err, "File watcher error"),
            }
        })
        .context("Failed to initialise file watcher")?;

        for dir in watch_roots(root, &watch_loop.bindings) {
            debouncer
                .watcher()
                .watch(&dir, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", dir.display()))?;
            info!(path = %dir.display(), "Watching");
        }

        let thread = std::thread::spawn(move || watch_loop.run(&rx));
        Ok(Self {
            signals: tx,
            debouncer: Some(debouncer),
            thread: Some(thread),
        })
    }

    /// Sender that feeds the loop directly, bypassing the filesystem.
    pub fn sender(&self) -> Sender<WatchSignal> {
        self.signals.clone()
    }

    pub fn stop(&mut self) -> WatchStats {
        self.debouncer.take();
        let _ = self.signals.send(WatchSignal::Stop);
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_default(),
            None => WatchStats::default(),
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Glob base of every binding pattern, each listed once.
fn watch_candidates(root: &Path, bindings: &[WatchBinding]) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    for pattern in bindings.iter().flat_map(|binding| binding.patterns()) {
        for alternative in expand_braces(pattern) {
            let dir = root.join(glob_base(&alternative));
            if !candidates.contains(&dir) {
                candidates.push(dir);
            }
        }
    }
    candidates
}

/// Existing directories that cover every binding pattern, without nesting.
fn watch_roots(root: &Path, bindings: &[WatchBinding]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in watch_candidates(root, bindings) {
        if dir.is_dir() {
            dirs.push(dir);
        } else {
            warn!(path = %dir.display(), "Watch directory does not exist, skipping");
        }
    }
    dirs.sort();
    let mut roots: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        if !roots.iter().any(|kept| dir.starts_with(kept)) {
            roots.push(dir);
        }
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Task, TaskNode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Task for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self, _ctx: &RunContext) -> Result<usize, Fault> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Fault::transform("sass", "src/a.scss", "broken"));
            }
            Ok(1)
        }
    }

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    impl ReloadNotifier for CountingNotifier {
        fn notify_reload(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(fail: bool) -> (WatchLoop, Arc<AtomicUsize>, Arc<CountingNotifier>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry
            .register(
                "styles",
                TaskNode::leaf(Counting {
                    name: "styles",
                    runs: runs.clone(),
                    fail,
                }),
            )
            .unwrap();
        let root = Path::new("/project");
        let bindings = vec![
            WatchBinding::new(root, &["src/**/*.scss".to_string()], "styles"),
            WatchBinding::new(root, &["src/**/_*.scss".to_string()], "styles"),
        ];
        let notifier = Arc::new(CountingNotifier::default());
        let watch_loop = WatchLoop::new(
            registry,
            bindings,
            RunContext::default(),
            notifier.clone(),
            Duration::from_millis(50),
        );
        (watch_loop, runs, notifier)
    }

    #[test]
    fn burst_of_changes_rebuilds_once() {
        let (watch_loop, runs, notifier) = setup(false);
        let (tx, rx) = mpsc::channel();
        for name in ["a", "b", "_c"] {
            tx.send(WatchSignal::Changed(vec![PathBuf::from(format!(
                "/project/src/{name}.scss"
            ))]))
            .unwrap();
        }
        tx.send(WatchSignal::Stop).unwrap();

        let stats = watch_loop.run(&rx);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            stats,
            WatchStats {
                batches: 1,
                rebuilds: 1,
                reloads: 1
            }
        );
    }

    #[test]
    fn unrelated_changes_are_ignored() {
        let (watch_loop, runs, notifier) = setup(false);
        let (tx, rx) = mpsc::channel();
        tx.send(WatchSignal::Changed(vec![PathBuf::from("/project/README.md")]))
            .unwrap();
        drop(tx);

        let stats = watch_loop.run(&rx);
        assert_eq!(stats.batches, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_rebuild_keeps_watching_without_reload() {
        let (watch_loop, runs, notifier) = setup(true);
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::spawn(move || watch_loop.run(&rx));

        tx.send(WatchSignal::Changed(vec![PathBuf::from("/project/src/a.scss")]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        tx.send(WatchSignal::Changed(vec![PathBuf::from("/project/src/a.scss")]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        tx.send(WatchSignal::Stop).unwrap();

        let stats = worker.join().unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn watch_roots_skip_nested_and_missing_directories() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src/stylesheets")).unwrap();
        std::fs::create_dir_all(temp.path().join("src/images")).unwrap();
        let bindings = vec![
            WatchBinding::new(temp.path(), &["src/**/*.ejs".to_string()], "html"),
            WatchBinding::new(
                temp.path(),
                &["src/stylesheets/**/*.scss".to_string()],
                "styles",
            ),
            WatchBinding::new(temp.path(), &["assets/{a,b}/*.png".to_string()], "images"),
        ];
        assert_eq!(watch_roots(temp.path(), &bindings), vec![temp.path().join("src")]);
    }

    #[test]
    fn brace_alternatives_share_one_watch_candidate() {
        let root = Path::new("/project");
        let bindings = vec![WatchBinding::new(
            root,
            &["src/images/**/*.{jpg,jpeg,png,svg,ico}".to_string()],
            "images",
        )];
        assert_eq!(
            watch_candidates(root, &bindings),
            vec![PathBuf::from("/project/src/images")]
        );
    }

    #[test]
    fn bindings_reject_unknown_tasks() {
        let mut config = PathConfig::default().with_root("/project");
        config.watch[0].task = "missing".to_string();
        let registry = TaskRegistry::new();
        assert!(matches!(
            bindings_from_config(&config, &registry),
            Err(Fault::UnknownTask { .. })
        ));
    }
}
