use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::StageSpec;

pub const DEFAULT_CONFIG_FILE: &str = "sitepipe.yaml";

/// Project layout: source patterns, destinations, task composition, watch
/// bindings and dev-server settings. Loaded once and never mutated.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PathConfig {
    /// Directory every relative path is resolved against.
    #[serde(skip)]
    pub root: PathBuf,
    #[serde(default = "default_dist")]
    pub dist: PathBuf,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineSpec>,
    #[serde(default)]
    pub tasks: BTreeMap<String, CompositeSpec>,
    #[serde(default = "default_task_name")]
    pub default_task: String,
    #[serde(default)]
    pub watch: Vec<WatchSpec>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    pub sources: Vec<String>,
    pub dest: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageSpec>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub incremental: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub strict: bool,
}

impl PipelineSpec {
    pub fn copy(sources: &[&str], dest: impl Into<PathBuf>) -> Self {
        Self {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            dest: dest.into(),
            stages: Vec::new(),
            incremental: false,
            strict: false,
        }
    }

    pub fn with_stages(mut self, stages: Vec<StageSpec>) -> Self {
        self.stages = stages;
        self
    }

    pub fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }
}

/// A named composition of other tasks.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompositeSpec {
    Series(Vec<String>),
    Group(Vec<String>),
}

impl CompositeSpec {
    pub fn members(&self) -> &[String] {
        match self {
            CompositeSpec::Series(members) | CompositeSpec::Group(members) => members,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WatchSpec {
    pub paths: Vec<String>,
    pub task: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Window used to coalesce bursts of changes into one rebuild and
    /// one browser reload.
    pub debounce_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            debounce_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid server address {}:{}", self.host, self.port))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub title: String,
    pub subtitle: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            title: "sitepipe".to_string(),
            subtitle: "Error!".to_string(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        crate::presets::default_config()
    }
}

impl PathConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: PathConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        config.root = parent
            .canonicalize()
            .with_context(|| format!("Failed to resolve project root: {}", parent.display()))?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise the built-in project layout
    /// rooted at the file's directory.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let root = parent
            .canonicalize()
            .with_context(|| format!("Failed to resolve project root: {}", parent.display()))?;
        Ok(Self::default().with_root(root))
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.resolve(&self.dist)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialise config")
    }
}

fn default_dist() -> PathBuf {
    PathBuf::from("dist")
}

fn default_task_name() -> String {
    "dev".to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}
