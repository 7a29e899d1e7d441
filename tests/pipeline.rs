use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use sitepipe::error::Fault;
use sitepipe::matcher::FileMatcher;
use sitepipe::notify::CollectingSink;
use sitepipe::pipeline::{Pipeline, StageParameters, write_atomic};
use sitepipe::scheduler::{RunContext, RunMode};
use sitepipe::tasks::default_stage_registry;
use tempfile::tempdir;

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn styles_pipeline(root: &Path) -> Pipeline {
    let registry = default_stage_registry();
    let stages = ["skip-partials", "sass"]
        .iter()
        .map(|name| registry.create(name, StageParameters::new()).unwrap())
        .collect();
    Pipeline::new(
        "styles",
        FileMatcher::new(root, &["src/*.scss".to_string()]),
        stages,
        root.join("dist"),
    )
}

#[test]
fn second_run_without_changes_writes_nothing_new() {
    let temp = tempdir().unwrap();
    write(temp.path(), "src/fonts/a.woff", "font-a");
    write(temp.path(), "src/fonts/sub/b.woff", "font-b");
    let pipeline = Pipeline::new(
        "fonts",
        FileMatcher::new(temp.path(), &["src/fonts/**/*".to_string()]),
        Vec::new(),
        temp.path().join("dist/fonts"),
    );

    let first = pipeline.execute(&RunContext::default()).unwrap();
    assert_eq!(first.written, 2);
    let before = fs::read(temp.path().join("dist/fonts/sub/b.woff")).unwrap();

    let second = pipeline.execute(&RunContext::default()).unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(
        fs::read(temp.path().join("dist/fonts/sub/b.woff")).unwrap(),
        before
    );
}

#[test]
fn incremental_pipeline_only_reprocesses_modified_sources() {
    let temp = tempdir().unwrap();
    write(temp.path(), "src/images/a.svg", "<svg/>");
    write(temp.path(), "src/images/b.svg", "<svg></svg>");
    let pipeline = Pipeline::new(
        "images",
        FileMatcher::new(temp.path(), &["src/images/*.svg".to_string()]),
        Vec::new(),
        temp.path().join("dist/images"),
    )
    .incremental(true);

    assert_eq!(pipeline.execute(&RunContext::default()).unwrap().files(), 2);
    assert_eq!(pipeline.execute(&RunContext::default()).unwrap().files(), 0);

    thread::sleep(Duration::from_millis(50));
    write(temp.path(), "src/images/b.svg", "<svg><g/></svg>");
    let third = pipeline.execute(&RunContext::default()).unwrap();
    assert_eq!(third.written, 1);
    assert_eq!(
        fs::read_to_string(temp.path().join("dist/images/b.svg")).unwrap(),
        "<svg><g/></svg>"
    );
}

#[test]
fn one_shot_build_fails_but_keeps_good_outputs() {
    let temp = tempdir().unwrap();
    write(temp.path(), "src/a.scss", "$c: red;\na { color: $c; }\n");
    write(temp.path(), "src/b.scss", "b { color: red;\n");
    let sink = CollectingSink::new();
    let ctx = RunContext::new(RunMode::OneShot, Arc::new(sink.clone()));

    let result = styles_pipeline(temp.path()).execute(&ctx);
    match result {
        Err(Fault::Transform { stage, path, .. }) => {
            assert_eq!(stage, "sass");
            assert!(path.ends_with("src/b.scss"));
        }
        other => panic!("expected transform fault, got {other:?}"),
    }
    let css = fs::read_to_string(temp.path().join("dist/a.css")).unwrap();
    assert!(css.contains("color: red"));
    assert!(!temp.path().join("dist/b.css").exists());

    let notifications = sink.notifications();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].message.contains("b.scss"));
}

#[test]
fn watch_mode_reports_fault_and_completes() {
    let temp = tempdir().unwrap();
    write(temp.path(), "src/a.scss", "a { color: red; }\n");
    write(temp.path(), "src/b.scss", "b { color: red;\n");
    write(temp.path(), "src/_vars.scss", "$unused: 1;\n");
    let sink = CollectingSink::new();
    let ctx = RunContext::new(RunMode::Watch, Arc::new(sink.clone()));

    let report = styles_pipeline(temp.path()).execute(&ctx).unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(report.faulted, 1);
    assert_eq!(sink.len(), 1);
    assert!(temp.path().join("dist/a.css").is_file());
    assert!(!temp.path().join("dist/_vars.css").exists());
}

#[test]
fn strict_pipeline_without_sources_is_a_no_match_error() {
    let temp = tempdir().unwrap();
    let pipeline = Pipeline::new(
        "scripts",
        FileMatcher::new(temp.path(), &["src/javascripts/app.js".to_string()]).strict(true),
        Vec::new(),
        temp.path().join("dist"),
    );
    let sink = CollectingSink::new();
    let ctx = RunContext::new(RunMode::Watch, Arc::new(sink.clone()));
    assert!(matches!(pipeline.execute(&ctx), Err(Fault::NoMatch { .. })));
    assert_eq!(sink.len(), 1);
}

#[test]
fn readers_never_observe_partial_destination_files() {
    let temp = tempdir().unwrap();
    let target = temp.path().join("dist/app.js");
    let old = vec![b'a'; 200_000];
    let new = vec![b'b'; 50_000];
    write_atomic(&target, &old).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let target = target.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut observed = 0;
            while !done.load(Ordering::SeqCst) {
                if let Ok(bytes) = fs::read(&target) {
                    let whole_old = bytes.len() == 200_000 && bytes.iter().all(|b| *b == b'a');
                    let whole_new = bytes.len() == 50_000 && bytes.iter().all(|b| *b == b'b');
                    assert!(whole_old || whole_new, "partial read of {} bytes", bytes.len());
                    observed += 1;
                }
            }
            observed
        })
    };

    for round in 0..50 {
        let contents = if round % 2 == 0 { &new } else { &old };
        write_atomic(&target, contents).unwrap();
    }
    done.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() > 0);
}
