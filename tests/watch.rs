use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use sitepipe::config::{PathConfig, PipelineSpec, WatchSpec};
use sitepipe::notify::CollectingSink;
use sitepipe::pipeline::StageSpec;
use sitepipe::scheduler::{RunContext, RunMode};
use sitepipe::server::ReloadNotifier;
use sitepipe::tasks::{build_registry, default_stage_registry};
use sitepipe::watch::{WatchHandle, WatchLoop, WatchSignal, bindings_from_config};
use tempfile::tempdir;

#[derive(Default)]
struct Reloads(AtomicUsize);

impl ReloadNotifier for Reloads {
    fn notify_reload(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn styles_project(root: &Path) -> PathConfig {
    let mut config = PathConfig::default().with_root(root);
    config.pipelines.clear();
    config.tasks.clear();
    config.pipelines.insert(
        "styles".into(),
        PipelineSpec::copy(&["src/stylesheets/**/*.scss"], "dist/stylesheets").with_stages(vec![
            StageSpec::new("skip-partials"),
            StageSpec::new("sass"),
        ]),
    );
    config.watch = vec![WatchSpec {
        paths: vec!["src/stylesheets/**/*.scss".into()],
        task: "styles".into(),
    }];
    config.default_task = "styles".into();
    config
}

fn watch_loop(config: &PathConfig, sink: &CollectingSink, reloads: &Arc<Reloads>) -> WatchLoop {
    let registry = build_registry(config, &default_stage_registry()).unwrap();
    let bindings = bindings_from_config(config, &registry).unwrap();
    WatchLoop::new(
        registry,
        bindings,
        RunContext::new(RunMode::OneShot, Arc::new(sink.clone())),
        reloads.clone(),
        Duration::from_millis(50),
    )
}

#[test]
fn broken_source_is_reported_and_fix_triggers_reload() {
    let temp = tempdir().unwrap();
    let stylesheet = temp.path().join("src/stylesheets/a.scss");
    fs::create_dir_all(stylesheet.parent().unwrap()).unwrap();
    fs::write(&stylesheet, "a { color: red;\n").unwrap();

    let config = styles_project(temp.path());
    let sink = CollectingSink::new();
    let reloads = Arc::new(Reloads::default());
    let watch_loop = watch_loop(&config, &sink, &reloads);

    let (tx, rx) = mpsc::channel();
    let worker = std::thread::spawn(move || watch_loop.run(&rx));

    tx.send(WatchSignal::Changed(vec![stylesheet.clone()])).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(sink.len(), 1);
    assert_eq!(reloads.0.load(Ordering::SeqCst), 1);

    fs::write(&stylesheet, "a { color: red; }\n").unwrap();
    tx.send(WatchSignal::Changed(vec![stylesheet.clone()])).unwrap();
    tx.send(WatchSignal::Stop).unwrap();
    let stats = worker.join().unwrap();

    assert_eq!(stats.batches, 2);
    assert_eq!(sink.len(), 1);
    assert!(temp.path().join("dist/stylesheets/a.css").is_file());
}

#[test]
fn many_saves_in_one_window_rebuild_once() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("src/stylesheets");
    fs::create_dir_all(&dir).unwrap();
    for name in ["a", "b", "c"] {
        fs::write(dir.join(format!("{name}.scss")), "p { margin: 0; }\n").unwrap();
    }

    let config = styles_project(temp.path());
    let sink = CollectingSink::new();
    let reloads = Arc::new(Reloads::default());
    let watch_loop = watch_loop(&config, &sink, &reloads);

    let (tx, rx) = mpsc::channel();
    for name in ["a", "b", "c"] {
        tx.send(WatchSignal::Changed(vec![dir.join(format!("{name}.scss"))]))
            .unwrap();
    }
    tx.send(WatchSignal::Stop).unwrap();

    let stats = watch_loop.run(&rx);
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.rebuilds, 1);
    assert_eq!(reloads.0.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read_dir(temp.path().join("dist/stylesheets")).unwrap().count(), 3);
}

#[test]
fn handle_drains_pending_changes_on_stop() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("src/stylesheets");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("main.scss"), "body { margin: 0; }\n").unwrap();

    let config = styles_project(temp.path());
    let sink = CollectingSink::new();
    let reloads = Arc::new(Reloads::default());
    let mut handle = WatchHandle::start(temp.path(), watch_loop(&config, &sink, &reloads)).unwrap();

    handle
        .sender()
        .send(WatchSignal::Changed(vec![dir.join("main.scss")]))
        .unwrap();
    let stats = handle.stop();

    assert!(stats.rebuilds >= 1);
    assert!(temp.path().join("dist/stylesheets/main.css").is_file());
    assert_eq!(reloads.0.load(Ordering::SeqCst), stats.reloads);
}
