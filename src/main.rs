use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueHint};
use sitepipe::config::{DEFAULT_CONFIG_FILE, PathConfig};
use sitepipe::manifest::generate_manifest;
use sitepipe::notify::{CollectingSink, SinkSet, TracingSink};
use sitepipe::observability::{MetricsCollector, log_snapshot};
use sitepipe::presets::write_default;
use sitepipe::scheduler::{RunContext, RunMode, Scheduler, TaskRegistry};
use sitepipe::server::{DevServer, ServerOptions};
use sitepipe::tasks::{build_registry, default_stage_registry};
use sitepipe::validation::validate_config;
use sitepipe::watch::{WatchHandle, WatchLoop, bindings_from_config};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let Cli {
        config,
        root,
        print_metrics,
        otlp_endpoint,
        command,
    } = Cli::parse();

    configure_tracing(otlp_endpoint.as_deref())?;
    let source = ConfigSource {
        path: config,
        root,
    };

    let command = command.unwrap_or(Commands::Serve {
        task: None,
        host: None,
        port: None,
    });
    let command_result = match command {
        Commands::Run {
            task,
            mode,
            sequential,
        } => run_task(&source, &task, mode, sequential, print_metrics),
        Commands::Serve { task, host, port } => {
            serve(&source, task.as_deref(), host, port, print_metrics)
        }
        Commands::List => list_tasks(&source),
        Commands::Stages => {
            list_stages();
            Ok(())
        }
        Commands::Validate => validate_cmd(&source),
        Commands::Init {
            output,
            with_theme,
            force,
        } => init_project(&output, with_theme.as_deref(), force),
        Commands::Manifest { output } => manifest_cmd(&source, &output),
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "sitepipe")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

/// Where the configuration comes from and, optionally, the project root
/// that overrides the config file's directory.
struct ConfigSource {
    path: PathBuf,
    root: Option<PathBuf>,
}

impl ConfigSource {
    fn display(&self) -> std::path::Display<'_> {
        self.path.display()
    }

    fn load(&self) -> Result<PathConfig> {
        let config = PathConfig::load_or_default(&self.path)?;
        match &self.root {
            Some(root) => {
                let root = root
                    .canonicalize()
                    .with_context(|| format!("Failed to resolve project root: {}", root.display()))?;
                Ok(config.with_root(root))
            }
            None => Ok(config),
        }
    }
}

struct Project {
    config: PathConfig,
    tasks: TaskRegistry,
}

fn load_project(source: &ConfigSource) -> Result<Project> {
    let config = source.load()?;
    let tasks = build_registry(&config, &default_stage_registry())
        .with_context(|| format!("Invalid task configuration in {}", source.display()))?;
    Ok(Project { config, tasks })
}

/// Faults replayed in the summary of a dev session; older ones are only counted.
const SESSION_FAULT_LIMIT: usize = 20;

/// Run context that logs every fault and also keeps them for the summary.
fn context_for(
    config: &PathConfig,
    mode: RunMode,
    metrics: MetricsCollector,
) -> (RunContext, CollectingSink) {
    let faults = match mode {
        RunMode::OneShot => CollectingSink::new(),
        RunMode::Watch => CollectingSink::bounded(SESSION_FAULT_LIMIT),
    };
    let sink = SinkSet::new()
        .with(Arc::new(TracingSink))
        .with(Arc::new(faults.clone()));
    let ctx = RunContext::new(mode, Arc::new(sink))
        .with_labels(config.notify.title.clone(), config.notify.subtitle.clone())
        .with_metrics(metrics);
    (ctx, faults)
}

fn summarize_faults(faults: &CollectingSink) {
    if faults.is_empty() {
        return;
    }
    let recent = faults.notifications();
    warn!(
        faults = faults.len(),
        shown = recent.len(),
        "Faults were reported during this session"
    );
    for notification in recent {
        warn!("  {}", notification.message);
    }
}

fn run_task(
    source: &ConfigSource,
    task: &str,
    mode: RunMode,
    sequential: bool,
    print_metrics: bool,
) -> Result<()> {
    let project = load_project(source)?;
    let metrics = MetricsCollector::new();
    let (ctx, faults) = context_for(&project.config, mode, metrics.clone());
    let mut scheduler = Scheduler::new(&project.tasks, ctx);
    if sequential {
        scheduler = scheduler.sequential();
    }

    let result = scheduler.run(task);
    summarize_faults(&faults);
    if print_metrics {
        log_snapshot(&metrics.snapshot());
    }
    result.with_context(|| format!("Task '{task}' failed"))
}

fn serve(
    source: &ConfigSource,
    task: Option<&str>,
    host: Option<String>,
    port: Option<u16>,
    print_metrics: bool,
) -> Result<()> {
    let Project { mut config, tasks } = load_project(source)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let task = match task {
        Some(task) => task.to_string(),
        None => tasks
            .default_task()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No task given and no default_task configured"))?,
    };
    tasks.get(&task)?;

    let metrics = MetricsCollector::new();
    let (ctx, faults) = context_for(&config, RunMode::Watch, metrics.clone());
    match Scheduler::new(&tasks, ctx.clone()).run(&task) {
        Ok(()) => {}
        Err(fault) if fault.is_recoverable() => {
            warn!(task = task.as_str(), error = %fault, "Initial build incomplete; serving anyway");
        }
        Err(fault) => {
            summarize_faults(&faults);
            return Err(fault).with_context(|| format!("Initial build of '{task}' failed"));
        }
    }

    let dist = config.dist_dir();
    std::fs::create_dir_all(&dist)
        .with_context(|| format!("Failed to create destination: {}", dist.display()))?;
    let mut server = DevServer::start(ServerOptions {
        root: dist,
        listen: config.server.address()?,
        debounce: config.server.debounce(),
    })?;

    let bindings = bindings_from_config(&config, &tasks)?;
    let watch_loop = WatchLoop::new(
        tasks.clone(),
        bindings,
        ctx,
        Arc::new(server.reload_handle()),
        config.server.debounce(),
    );
    let mut watcher = WatchHandle::start(&config.root, watch_loop)?;
    info!(url = %format!("http://{}", server.address()), "Serving; press Ctrl-C to stop");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("Failed to listen for Ctrl-C")?;

    let stats = watcher.stop();
    server.stop();
    info!(
        batches = stats.batches,
        rebuilds = stats.rebuilds,
        reloads = stats.reloads,
        "Dev session finished"
    );
    summarize_faults(&faults);
    if print_metrics {
        log_snapshot(&metrics.snapshot());
    }
    Ok(())
}

fn list_tasks(source: &ConfigSource) -> Result<()> {
    let project = load_project(source)?;
    let default = project.tasks.default_task();
    println!("Tasks:");
    for (name, node) in project.tasks.iter() {
        let marker = if Some(name.as_str()) == default {
            " (default)"
        } else {
            ""
        };
        println!("- {name}{marker}: {node}");
    }
    Ok(())
}

fn list_stages() {
    let registry = default_stage_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn validate_cmd(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    let report = validate_config(&config, &default_stage_registry());

    for warning in &report.warnings {
        warn!(file = %source.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %source.display(), "Configuration validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %source.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Configuration validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn init_project(output: &Path, theme: Option<&Path>, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            output.display()
        );
    }
    let written = write_default(output, theme)?;
    info!(config = %written.display(), "Project configuration written");
    Ok(())
}

fn manifest_cmd(source: &ConfigSource, output: &Path) -> Result<()> {
    let config = source.load()?;
    let dist = config.dist_dir();
    if !dist.is_dir() {
        bail!(
            "Destination {} does not exist; run a build first",
            dist.display()
        );
    }
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create manifest directory: {}", parent.display())
        })?;
    }
    let manifest = generate_manifest(&dist, output)?;
    info!(
        manifest = %output.display(),
        files = manifest.files.len(),
        "Manifest generated"
    );
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "sitepipe",
    version,
    about = "Static site asset pipeline with a live-reloading dev server"
)]
struct Cli {
    /// Project configuration; its directory is the project root.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_FILE, value_hint = ValueHint::FilePath)]
    config: PathBuf,
    /// Project root; defaults to the directory holding the configuration.
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    print_metrics: bool,
    #[arg(long = "otlp-endpoint", global = true)]
    otlp_endpoint: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task once.
    Run {
        task: String,
        #[arg(long, value_enum, default_value_t = RunMode::OneShot)]
        mode: RunMode,
        /// Run group members one at a time.
        #[arg(long)]
        sequential: bool,
    },
    /// Build, then serve the destination and rebuild on change.
    Serve {
        task: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print every task and its composition.
    List,
    Stages,
    Validate,
    /// Write the default project configuration.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,
        /// Add tasks importing images, fonts and scripts from a theme package.
        #[arg(long = "with-theme")]
        with_theme: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    /// Record a sha256 digest of every built file.
    Manifest {
        #[arg(long, default_value = "manifest.yaml")]
        output: PathBuf,
    },
}
