use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use clap::ValueEnum;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::Fault;
use crate::notify::{ErrorSink, TracingSink};
use crate::observability::MetricsCollector;

/// A unit of work the scheduler can execute as a leaf.
pub trait Task: Send + Sync {
    fn name(&self) -> &str;
    /// Runs the task and returns the number of files it produced.
    fn run(&self, ctx: &RunContext) -> Result<usize, Fault>;
}

/// One-shot builds fail on the first transform fault; watch sessions report
/// it to the error sink and keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    OneShot,
    Watch,
}

#[derive(Clone)]
pub struct RunContext {
    mode: RunMode,
    sink: Arc<dyn ErrorSink>,
    title: String,
    subtitle: String,
    metrics: MetricsCollector,
}

impl RunContext {
    pub fn new(mode: RunMode, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            mode,
            sink,
            title: "sitepipe".to_string(),
            subtitle: "Error!".to_string(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_labels(mut self, title: impl Into<String>, subtitle: impl Into<String>) -> Self {
        self.title = title.into();
        self.subtitle = subtitle.into();
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Routes a fault to the error sink.
    pub fn report(&self, fault: &Fault) {
        self.metrics.record_fault();
        self.sink
            .notify(&fault.notification(&self.title, &self.subtitle));
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(RunMode::OneShot, Arc::new(TracingSink))
    }
}

/// The composition graph the scheduler walks.
#[derive(Clone)]
pub enum TaskNode {
    Leaf(Arc<dyn Task>),
    /// Children run in order; the first fault stops the series.
    Series(Vec<TaskNode>),
    /// Children have no ordering guarantee and all of them are attempted.
    Group(Vec<TaskNode>),
}

impl TaskNode {
    pub fn leaf(task: impl Task + 'static) -> Self {
        TaskNode::Leaf(Arc::new(task))
    }

    pub fn series(children: impl IntoIterator<Item = TaskNode>) -> Self {
        TaskNode::Series(children.into_iter().collect())
    }

    pub fn group(children: impl IntoIterator<Item = TaskNode>) -> Self {
        TaskNode::Group(children.into_iter().collect())
    }

    /// Leaf task names in declaration order.
    pub fn leaf_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_leaves(&mut names);
        names
    }

    fn collect_leaves(&self, names: &mut Vec<String>) {
        match self {
            TaskNode::Leaf(task) => names.push(task.name().to_string()),
            TaskNode::Series(children) | TaskNode::Group(children) => {
                for child in children {
                    child.collect_leaves(names);
                }
            }
        }
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, children) = match self {
            TaskNode::Leaf(task) => return f.write_str(task.name()),
            TaskNode::Series(children) => ("series", children),
            TaskNode::Group(children) => ("group", children),
        };
        write!(f, "{label}(")?;
        for (idx, child) in children.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{child}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskNode({self})")
    }
}

/// Name to task graph mapping, filled once at startup.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskNode>,
    default_task: Option<String>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, node: TaskNode) -> Result<(), Fault> {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(Fault::Config(format!("task '{name}' is registered twice")));
        }
        self.tasks.insert(name, node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&TaskNode, Fault> {
        self.tasks.get(name).ok_or_else(|| Fault::UnknownTask {
            name: name.to_string(),
            known: self.names(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskNode)> {
        self.tasks.iter()
    }

    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default_task = Some(name.into());
    }

    pub fn default_task(&self) -> Option<&str> {
        self.default_task.as_deref()
    }
}

pub struct Scheduler<'a> {
    registry: &'a TaskRegistry,
    ctx: RunContext,
    parallel: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(registry: &'a TaskRegistry, ctx: RunContext) -> Self {
        Self {
            registry,
            ctx,
            parallel: true,
        }
    }

    /// Runs group members one after another instead of on the thread pool.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn run(&self, name: &str) -> Result<(), Fault> {
        let node = self.registry.get(name)?;
        info!(task = name, graph = %node, "Starting task");
        let started = Instant::now();
        let result = self.execute(node);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        match &result {
            Ok(()) => info!(task = name, elapsed_ms, "Finished task"),
            Err(fault) => error!(task = name, kind = fault.kind(), elapsed_ms, "Task failed"),
        }
        result
    }

    pub fn execute(&self, node: &TaskNode) -> Result<(), Fault> {
        match node {
            TaskNode::Leaf(task) => self.run_leaf(task.as_ref()),
            TaskNode::Series(children) => {
                for child in children {
                    self.execute(child)?;
                }
                Ok(())
            }
            TaskNode::Group(children) => {
                let results: Vec<Result<(), Fault>> = if self.parallel {
                    children.par_iter().map(|child| self.execute(child)).collect()
                } else {
                    children.iter().map(|child| self.execute(child)).collect()
                };
                let mut first = None;
                for result in results {
                    if let Err(fault) = result {
                        if first.is_none() {
                            first = Some(fault);
                        } else {
                            warn!(error = %fault, "Additional group member failed");
                        }
                    }
                }
                first.map_or(Ok(()), Err)
            }
        }
    }

    fn run_leaf(&self, task: &dyn Task) -> Result<(), Fault> {
        let started = Instant::now();
        let result = task.run(&self.ctx);
        let elapsed = started.elapsed();
        self.ctx
            .metrics()
            .record_task(task.name(), elapsed, result.is_ok());
        match result {
            Ok(files) => {
                info!(
                    task = task.name(),
                    files,
                    elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
                    "Finished"
                );
                Ok(())
            }
            Err(fault) => Err(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Task for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn run(&self, _ctx: &RunContext) -> Result<usize, Fault> {
            Ok(0)
        }
    }

    #[test]
    fn graph_renders_declaratively() {
        let node = TaskNode::series([
            TaskNode::leaf(Named("clean")),
            TaskNode::group([TaskNode::leaf(Named("html")), TaskNode::leaf(Named("styles"))]),
        ]);
        assert_eq!(node.to_string(), "series(clean, group(html, styles))");
        assert_eq!(node.leaf_names(), vec!["clean", "html", "styles"]);
    }

    #[test]
    fn unknown_task_lists_known_names() {
        let mut registry = TaskRegistry::new();
        registry.register("build", TaskNode::leaf(Named("build"))).unwrap();
        let scheduler = Scheduler::new(&registry, RunContext::default());
        match scheduler.run("deploy") {
            Err(Fault::UnknownTask { name, known }) => {
                assert_eq!(name, "deploy");
                assert_eq!(known, vec!["build"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register("a", TaskNode::leaf(Named("a"))).unwrap();
        assert!(matches!(
            registry.register("a", TaskNode::leaf(Named("a"))),
            Err(Fault::Config(_))
        ));
    }
}
