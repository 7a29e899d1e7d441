use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, debug_span, instrument, warn};

use crate::error::Fault;
use crate::matcher::{FileMatcher, MatchedFile};
use crate::scheduler::{RunContext, RunMode, Task};

/// A file travelling through a pipeline.
///
/// `base` is the glob base the file was matched under; the destination path
/// is `path` relative to `base`, joined onto the pipeline destination.
/// `origin` always points at the source file the record was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub base: PathBuf,
    pub origin: PathBuf,
    pub contents: Vec<u8>,
}

impl FileRecord {
    pub fn new(path: impl Into<PathBuf>, base: impl Into<PathBuf>, contents: Vec<u8>) -> Self {
        let path = path.into();
        Self {
            origin: path.clone(),
            path,
            base: base.into(),
            contents,
        }
    }

    pub fn load(matched: &MatchedFile) -> Result<Self, Fault> {
        let contents = fs::read(&matched.path).map_err(|source| Fault::Source {
            path: matched.path.clone(),
            source,
        })?;
        Ok(Self::new(matched.path.clone(), matched.base.clone(), contents))
    }

    /// Same path and base, new contents.
    pub fn with_contents(&self, contents: Vec<u8>) -> Self {
        Self {
            path: self.path.clone(),
            base: self.base.clone(),
            origin: self.origin.clone(),
            contents,
        }
    }

    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            base: self.base.clone(),
            origin: self.origin.clone(),
            contents: self.contents.clone(),
        }
    }

    pub fn relative_path(&self) -> PathBuf {
        match self.path.strip_prefix(&self.base) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => self
                .path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.path.clone()),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn text(&self, stage: &str) -> Result<&str, Fault> {
        std::str::from_utf8(&self.contents)
            .map_err(|err| Fault::transform(stage, &self.path, format!("not valid UTF-8: {err}")))
    }
}

pub type StageParameters = Map<String, Value>;

/// A transformation from one record to zero or more records.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, record: FileRecord) -> Result<Vec<FileRecord>, Fault>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

impl StageSpec {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            params: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params
            .get_or_insert_with(StageParameters::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub written: usize,
    pub unchanged: usize,
    pub faulted: usize,
}

impl PipelineReport {
    /// Files present in the destination after the run.
    pub fn files(&self) -> usize {
        self.written + self.unchanged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Source matcher, ordered stage chain and destination directory.
pub struct Pipeline {
    name: String,
    matcher: FileMatcher,
    stages: Vec<Box<dyn Stage>>,
    destination: PathBuf,
    incremental: bool,
    last_success: Mutex<Option<SystemTime>>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        matcher: FileMatcher,
        stages: Vec<Box<dyn Stage>>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            matcher,
            stages,
            destination: destination.into(),
            incremental: false,
            last_success: Mutex::new(None),
        }
    }

    /// Only reprocess sources modified since the last fault-free run.
    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    #[instrument(skip(self, ctx), fields(pipeline = %self.name))]
    pub fn execute(&self, ctx: &RunContext) -> Result<PipelineReport, Fault> {
        let started = SystemTime::now();
        let since = if self.incremental {
            self.last_success.lock().map(|guard| *guard).unwrap_or(None)
        } else {
            None
        };

        let mut report = PipelineReport::default();
        let mut first_fault = None;

        let matches = self.matcher.clone().since(since).matches().map_err(|fault| {
            ctx.report(&fault);
            fault
        })?;
        for matched in matches {
            let outputs = matched
                .and_then(|matched| FileRecord::load(&matched))
                .and_then(|record| self.transform(record, ctx));
            let outputs = match outputs {
                Ok(outputs) => outputs,
                Err(fault) if fault.is_recoverable() => {
                    ctx.report(&fault);
                    report.faulted += 1;
                    first_fault.get_or_insert(fault);
                    continue;
                }
                Err(fault) => {
                    ctx.report(&fault);
                    return Err(fault);
                }
            };

            for record in outputs {
                let target = self.destination.join(record.relative_path());
                match write_atomic(&target, &record.contents) {
                    Ok(WriteOutcome::Written) => {
                        debug!(path = %target.display(), "Wrote file");
                        ctx.metrics().record_written();
                        report.written += 1;
                    }
                    Ok(WriteOutcome::Unchanged) => {
                        ctx.metrics().record_unchanged();
                        report.unchanged += 1;
                    }
                    Err(fault) => {
                        ctx.report(&fault);
                        return Err(fault);
                    }
                }
            }
        }

        if let Some(fault) = first_fault {
            if ctx.mode() == RunMode::OneShot {
                return Err(fault);
            }
            warn!(
                faulted = report.faulted,
                "Pipeline finished with recovered faults"
            );
        } else if self.incremental
            && let Ok(mut guard) = self.last_success.lock()
        {
            *guard = Some(started);
        }

        Ok(report)
    }

    fn transform(&self, record: FileRecord, ctx: &RunContext) -> Result<Vec<FileRecord>, Fault> {
        let mut records = vec![record];
        for stage in &self.stages {
            let _span = debug_span!("stage", name = stage.name()).entered();
            let _timer = ctx.metrics().start_stage(stage.name());
            let mut next = Vec::with_capacity(records.len());
            for record in records {
                next.extend(stage.apply(record)?);
            }
            records = next;
            if records.is_empty() {
                break;
            }
        }
        Ok(records)
    }
}

impl Task for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &RunContext) -> Result<usize, Fault> {
        self.execute(ctx).map(|report| report.files())
    }
}

/// Writes `contents` to `path` through a temporary file in the same
/// directory followed by a rename, so readers never see a partial file.
/// Identical existing contents are left untouched.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<WriteOutcome, Fault> {
    if let Ok(existing) = fs::read(path)
        && existing == contents
    {
        return Ok(WriteOutcome::Unchanged);
    }

    let write_fault = |source| Fault::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_fault)?;
    let mut temp = NamedTempFile::new_in(parent).map_err(write_fault)?;
    temp.write_all(contents).map_err(write_fault)?;
    temp.flush().map_err(write_fault)?;
    temp.persist(path).map_err(|err| write_fault(err.error))?;
    Ok(WriteOutcome::Written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_strips_glob_base() {
        let record = FileRecord::new("src/stylesheets/pages/home.scss", "src/stylesheets", vec![]);
        assert_eq!(record.relative_path(), PathBuf::from("pages/home.scss"));

        let outside = FileRecord::new("elsewhere/app.js", "src", vec![]);
        assert_eq!(outside.relative_path(), PathBuf::from("app.js"));
    }

    #[test]
    fn derived_records_keep_origin() {
        let record = FileRecord::new("src/a.scss", "src", b"a".to_vec());
        let renamed = record.with_path("src/a.css").with_contents(b"b".to_vec());
        assert_eq!(renamed.origin, PathBuf::from("src/a.scss"));
        assert_eq!(renamed.path, PathBuf::from("src/a.css"));
        assert_eq!(renamed.contents, b"b");
    }

    #[test]
    fn atomic_write_reports_unchanged_contents() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("nested/out.txt");
        assert_eq!(write_atomic(&target, b"hello").unwrap(), WriteOutcome::Written);
        assert_eq!(write_atomic(&target, b"hello").unwrap(), WriteOutcome::Unchanged);
        assert_eq!(write_atomic(&target, b"world").unwrap(), WriteOutcome::Written);
        assert_eq!(fs::read(&target).unwrap(), b"world");
    }
}
