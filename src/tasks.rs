use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::config::{CompositeSpec, PathConfig};
use crate::error::Fault;
use crate::matcher::FileMatcher;
use crate::pipeline::{Pipeline, StageRegistry};
use crate::scheduler::{RunContext, Task, TaskNode, TaskRegistry};
use crate::stages;

pub const CLEAN_TASK: &str = "clean";

/// Deletes everything inside the destination directory, keeping the
/// directory itself so a running dev server keeps its root.
pub struct CleanTask {
    dist: PathBuf,
}

impl CleanTask {
    pub fn new(dist: impl Into<PathBuf>) -> Self {
        Self { dist: dist.into() }
    }
}

impl Task for CleanTask {
    fn name(&self) -> &str {
        CLEAN_TASK
    }

    fn run(&self, _ctx: &RunContext) -> Result<usize, Fault> {
        let entries = match fs::read_dir(&self.dist) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(Fault::Write {
                    path: self.dist.clone(),
                    source,
                });
            }
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|source| Fault::Write {
                path: self.dist.clone(),
                source,
            })?;
            let path = entry.path();
            let result = if entry.file_type().is_ok_and(|t| t.is_dir()) {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|source| Fault::Write {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), "Removed");
            removed += 1;
        }
        info!(dist = %self.dist.display(), removed, "Cleaned destination");
        Ok(removed)
    }
}

pub fn default_stage_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

/// Builds every task the configuration declares: `clean`, one leaf per
/// pipeline and the series/group composites on top of them.
///
/// Unknown task references and composition cycles are rejected here, before
/// anything touches the filesystem.
pub fn build_registry(config: &PathConfig, stages: &StageRegistry) -> Result<TaskRegistry, Fault> {
    let dist = checked_destination(config)?;
    let mut registry = TaskRegistry::new();
    registry.register(CLEAN_TASK, TaskNode::leaf(CleanTask::new(dist)))?;

    for (name, spec) in &config.pipelines {
        let mut built = Vec::with_capacity(spec.stages.len());
        for stage in &spec.stages {
            let params = stage.params.clone().unwrap_or_default();
            let created = stages.create(&stage.stage, params).map_err(|err| {
                Fault::Config(format!("pipeline '{name}', stage '{}': {err:#}", stage.stage))
            })?;
            built.push(created);
        }
        let matcher = FileMatcher::new(&config.root, &spec.sources).strict(spec.strict);
        let pipeline = Pipeline::new(name.clone(), matcher, built, config.resolve(&spec.dest))
            .incremental(spec.incremental);
        debug!(
            pipeline = name.as_str(),
            stages = ?pipeline.stage_names(),
            dest = %pipeline.destination().display(),
            "Registered pipeline"
        );
        registry.register(name.clone(), TaskNode::leaf(pipeline))?;
    }

    for name in config.tasks.keys() {
        if registry.contains(name) {
            return Err(Fault::Config(format!(
                "composite task '{name}' collides with a pipeline of the same name"
            )));
        }
    }

    let mut visiting = Vec::new();
    for name in config.tasks.keys() {
        resolve(name, &config.tasks, &mut registry, &mut visiting)?;
    }

    if !config.default_task.is_empty() {
        registry.set_default(config.default_task.clone());
    }
    Ok(registry)
}

/// The destination directory, rejected when it is the project root or one
/// of its ancestors since `clean` would then delete the sources.
pub fn checked_destination(config: &PathConfig) -> Result<PathBuf, Fault> {
    let dist = config.dist_dir();
    if normalize(&config.root).starts_with(normalize(&dist)) {
        return Err(Fault::Config(format!(
            "destination {} contains the project root {}; clean would delete the sources",
            dist.display(),
            config.root.display()
        )));
    }
    Ok(dist)
}

/// Lexically resolves `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn resolve(
    name: &str,
    composites: &BTreeMap<String, CompositeSpec>,
    registry: &mut TaskRegistry,
    visiting: &mut Vec<String>,
) -> Result<TaskNode, Fault> {
    if let Ok(node) = registry.get(name) {
        return Ok(node.clone());
    }
    let Some(spec) = composites.get(name) else {
        let mut known = registry.names();
        known.extend(composites.keys().cloned());
        known.sort();
        known.dedup();
        return Err(Fault::UnknownTask {
            name: name.to_string(),
            known,
        });
    };
    if visiting.iter().any(|v| v == name) {
        let mut chain = visiting.clone();
        chain.push(name.to_string());
        return Err(Fault::Config(format!(
            "task composition cycle: {}",
            chain.join(" -> ")
        )));
    }

    visiting.push(name.to_string());
    let mut children = Vec::with_capacity(spec.members().len());
    for member in spec.members() {
        children.push(resolve(member, composites, registry, visiting)?);
    }
    visiting.pop();

    let node = match spec {
        CompositeSpec::Series(_) => TaskNode::Series(children),
        CompositeSpec::Group(_) => TaskNode::Group(children),
    };
    registry.register(name, node.clone())?;
    Ok(node)
}
