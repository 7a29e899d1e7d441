use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{
    CompositeSpec, NotifyConfig, PathConfig, PipelineSpec, ServerConfig, WatchSpec,
};
use crate::pipeline::StageSpec;

const HTML_SOURCES: &str = "src/**/*.ejs";
const STYLE_SOURCES: &str = "src/stylesheets/**/*.scss";
const IMAGE_SOURCES: &str = "src/images/**/*.{jpg,jpeg,png,svg,ico}";

/// The standard static-site layout: templates, stylesheets, images, fonts
/// and scripts under `src/`, compiled into `dist/`.
pub fn default_config() -> PathConfig {
    let mut pipelines = BTreeMap::new();
    pipelines.insert(
        "html".to_string(),
        PipelineSpec::copy(&[HTML_SOURCES], "dist").with_stages(vec![
            StageSpec::new("skip-partials"),
            StageSpec::new("template"),
            StageSpec::new("rename").with_param("extension", "html"),
        ]),
    );
    pipelines.insert("cname".to_string(), PipelineSpec::copy(&["CNAME"], "dist"));
    pipelines.insert(
        "styles".to_string(),
        PipelineSpec::copy(&[STYLE_SOURCES], "dist/stylesheets").with_stages(vec![
            StageSpec::new("skip-partials"),
            StageSpec::new("sass"),
            StageSpec::new("minify-css"),
            StageSpec::new("sourcemap").with_param("directory", "."),
        ]),
    );
    pipelines.insert(
        "purgestyles".to_string(),
        PipelineSpec::copy(&[STYLE_SOURCES], "dist/stylesheets").with_stages(vec![
            StageSpec::new("skip-partials"),
            StageSpec::new("sass"),
            StageSpec::new("minify-css"),
        ]),
    );
    pipelines.insert(
        "scripts".to_string(),
        PipelineSpec::copy(&["src/javascripts/app.js"], "dist/javascripts"),
    );
    pipelines.insert(
        "images".to_string(),
        PipelineSpec::copy(&[IMAGE_SOURCES], "dist/images")
            .with_stages(vec![
                StageSpec::new("compress-image")
                    .with_param("jpeg_quality", 75)
                    .with_param("png_compression", "best"),
            ])
            .incremental(),
    );
    pipelines.insert(
        "fonts".to_string(),
        PipelineSpec::copy(&["src/fonts/**/*"], "dist/fonts"),
    );

    let mut tasks = BTreeMap::new();
    tasks.insert(
        "dev".to_string(),
        CompositeSpec::Series(names(&[
            "clean", "html", "cname", "styles", "scripts", "images", "fonts",
        ])),
    );
    tasks.insert(
        "build".to_string(),
        CompositeSpec::Series(names(&[
            "clean",
            "html",
            "cname",
            "purgestyles",
            "scripts",
            "images",
            "fonts",
        ])),
    );

    PathConfig {
        root: PathBuf::new(),
        dist: PathBuf::from("dist"),
        pipelines,
        tasks,
        default_task: "dev".to_string(),
        watch: vec![
            watch(HTML_SOURCES, "html"),
            watch(STYLE_SOURCES, "styles"),
            watch(IMAGE_SOURCES, "images"),
        ],
        server: ServerConfig::default(),
        notify: NotifyConfig::default(),
    }
}

/// Adds copy pipelines that pull images, fonts and scripts from a theme
/// package into the project sources, plus an `import-theme` group.
pub fn with_theme_imports(mut config: PathConfig, theme: &Path) -> Result<PathConfig> {
    let theme = theme.to_string_lossy().trim_end_matches('/').to_string();
    if theme.is_empty() {
        bail!("Theme directory cannot be empty");
    }
    let imports = [
        (
            "import-theme-images",
            format!("{theme}/src/images/**/*.{{jpg,jpeg,png,svg,ico}}"),
            "src/images",
        ),
        (
            "import-theme-fonts",
            format!("{theme}/src/fonts/**/*"),
            "src/fonts",
        ),
        (
            "import-theme-scripts",
            format!("{theme}/dist/javascripts/**/*"),
            "src/javascripts",
        ),
    ];
    let mut members = Vec::new();
    for (name, source, dest) in imports {
        config
            .pipelines
            .insert(name.to_string(), PipelineSpec::copy(&[source.as_str()], dest));
        members.push(name.to_string());
    }
    config
        .tasks
        .insert("import-theme".to_string(), CompositeSpec::Group(members));
    Ok(config)
}

/// Writes the default configuration (optionally with theme imports) to
/// `destination` and returns its path.
pub fn write_default(destination: &Path, theme: Option<&Path>) -> Result<PathBuf> {
    let mut config = default_config();
    if let Some(theme) = theme {
        config = with_theme_imports(config, theme)?;
    }

    let rendered = config.to_yaml()?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write config: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn watch(pattern: &str, task: &str) -> WatchSpec {
    WatchSpec {
        paths: vec![pattern.to_string()],
        task: task.to_string(),
    }
}
