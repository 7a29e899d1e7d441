use serde::Serialize;

use crate::config::PathConfig;
use crate::matcher::{FileMatcher, expand_braces};
use crate::pipeline::{StageRegistry, StageSpec};
use crate::tasks::{CLEAN_TASK, build_registry, checked_destination};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Checks a project configuration without running anything.
///
/// Errors are problems that would make a task fail; warnings flag setups
/// that run but are probably unintended, like patterns matching no file.
pub fn validate_config(config: &PathConfig, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.dist.as_os_str().is_empty() {
        report
            .errors
            .push("Destination directory cannot be empty".into());
    } else if let Err(fault) = checked_destination(config) {
        report.errors.push(fault.to_string());
    }

    if config.pipelines.is_empty() {
        report
            .warnings
            .push("No pipelines are configured".into());
    }

    for (name, spec) in &config.pipelines {
        if spec.sources.is_empty() {
            report
                .errors
                .push(format!("Pipeline '{name}' needs at least one source pattern"));
        }
        let mut patterns_ok = true;
        for pattern in &spec.sources {
            report.merge(validate_pattern(&format!("Pipeline '{name}'"), pattern));
            patterns_ok &= glob_errors(pattern).is_empty();
        }
        if spec.dest.as_os_str().is_empty() {
            report
                .errors
                .push(format!("Pipeline '{name}' has an empty destination"));
        }
        for (idx, stage) in spec.stages.iter().enumerate() {
            report.merge(validate_stage_order(name, idx, stage, &spec.stages));
            let params = stage.params.clone().unwrap_or_default();
            if let Err(err) = registry.create(&stage.stage, params) {
                report.errors.push(format!(
                    "Pipeline '{name}', stage {} ('{}'): {err:#}",
                    idx + 1,
                    stage.stage
                ));
            }
        }

        if patterns_ok && !config.root.as_os_str().is_empty() {
            let matcher = FileMatcher::new(&config.root, &spec.sources);
            let found = matcher
                .matches()
                .map(|mut matches| matches.next().is_some())
                .unwrap_or(false);
            if !found {
                let message = format!(
                    "Pipeline '{name}' sources match no files: {}",
                    spec.sources.join(", ")
                );
                if spec.strict {
                    report.errors.push(message);
                } else {
                    report.warnings.push(message);
                }
            }
        }
    }

    let known = |task: &str| {
        task == CLEAN_TASK || config.pipelines.contains_key(task) || config.tasks.contains_key(task)
    };

    for (idx, binding) in config.watch.iter().enumerate() {
        if !known(&binding.task) {
            report.errors.push(format!(
                "Watch binding {} refers to unknown task '{}'",
                idx + 1,
                binding.task
            ));
        }
        if binding.paths.is_empty() {
            report
                .errors
                .push(format!("Watch binding {} has no paths", idx + 1));
        }
        for pattern in &binding.paths {
            report.merge(validate_pattern(&format!("Watch binding {}", idx + 1), pattern));
        }
    }

    if !config.default_task.is_empty() && !known(&config.default_task) {
        report.errors.push(format!(
            "Default task '{}' is not defined",
            config.default_task
        ));
    }

    if let Err(err) = config.server.address() {
        report.errors.push(format!("{err:#}"));
    }
    if config.server.debounce_ms == 0 {
        report.warnings.push(
            "server.debounce_ms is 0; every saved file triggers its own rebuild".into(),
        );
    }

    // Composition problems (unknown members, cycles) only make sense once
    // every pipeline can be built.
    if report.is_ok()
        && let Err(fault) = build_registry(config, registry)
    {
        report.errors.push(fault.to_string());
    }

    report
}

fn validate_pattern(owner: &str, pattern: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    if pattern.trim().is_empty() {
        report
            .errors
            .push(format!("{owner}: source patterns cannot be empty"));
    }
    for err in glob_errors(pattern) {
        report
            .errors
            .push(format!("{owner}: '{pattern}' is not a valid glob: {err}"));
    }
    report
}

fn glob_errors(pattern: &str) -> Vec<String> {
    expand_braces(pattern)
        .iter()
        .filter_map(|alternative| glob::Pattern::new(alternative).err())
        .map(|err| err.to_string())
        .collect()
}

fn validate_stage_order(
    pipeline: &str,
    idx: usize,
    stage: &StageSpec,
    stages: &[StageSpec],
) -> ValidationReport {
    let mut report = ValidationReport::default();
    if stage.stage == "sourcemap" && idx + 1 != stages.len() {
        report.warnings.push(format!(
            "Pipeline '{pipeline}': sourcemap is not the last stage; later stages will not be mapped"
        ));
    }
    if stage.stage == "minify-css" && stages[..idx].iter().any(|prev| prev.stage == "sourcemap") {
        report.errors.push(format!(
            "Pipeline '{pipeline}': minify-css after sourcemap would strip the mapping comment"
        ));
    }
    if stage.stage == "skip-partials" && idx != 0 {
        report.warnings.push(format!(
            "Pipeline '{pipeline}': skip-partials should run first so partials are never compiled"
        ));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompositeSpec, PipelineSpec};
    use crate::tasks::default_stage_registry;

    fn project() -> (tempfile::TempDir, PathConfig) {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src/stylesheets")).unwrap();
        std::fs::write(temp.path().join("src/stylesheets/a.scss"), "a{b:c}").unwrap();
        let mut config = PathConfig::default().with_root(temp.path());
        config.pipelines.retain(|name, _| name == "styles");
        config.tasks.clear();
        config.watch.retain(|binding| binding.task == "styles");
        config.default_task = "styles".to_string();
        (temp, config)
    }

    #[test]
    fn default_styles_pipeline_is_valid() {
        let (_temp, config) = project();
        let report = validate_config(&config, &default_stage_registry());
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn unknown_stage_and_bad_glob_are_errors() {
        let (_temp, mut config) = project();
        config.pipelines.insert(
            "broken".into(),
            PipelineSpec::copy(&["src/[a.scss"], "dist").with_stages(vec![StageSpec::new("uglify")]),
        );
        let report = validate_config(&config, &default_stage_registry());
        assert!(report.errors.iter().any(|e| e.contains("not a valid glob")));
        assert!(report.errors.iter().any(|e| e.contains("uglify")));
    }

    #[test]
    fn destination_over_the_project_is_an_error() {
        let (_temp, mut config) = project();
        config.dist = "..".into();
        let report = validate_config(&config, &default_stage_registry());
        assert_eq!(
            report
                .errors
                .iter()
                .filter(|e| e.contains("clean would delete the sources"))
                .count(),
            1,
            "{:?}",
            report.errors
        );
    }

    #[test]
    fn unknown_watch_task_and_cycles_are_errors() {
        let (_temp, mut config) = project();
        config.watch[0].task = "missing".into();
        let report = validate_config(&config, &default_stage_registry());
        assert!(report.errors.iter().any(|e| e.contains("unknown task 'missing'")));

        let (_temp, mut config) = project();
        config
            .tasks
            .insert("x".into(), CompositeSpec::Series(vec!["y".into()]));
        config
            .tasks
            .insert("y".into(), CompositeSpec::Group(vec!["x".into()]));
        let report = validate_config(&config, &default_stage_registry());
        assert!(report.errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn unmatched_sources_warn_unless_strict() {
        let (_temp, mut config) = project();
        config
            .pipelines
            .insert("fonts".into(), PipelineSpec::copy(&["src/fonts/**/*"], "dist/fonts"));
        let report = validate_config(&config, &default_stage_registry());
        assert!(report.is_ok());
        assert!(report.warnings.iter().any(|w| w.contains("match no files")));

        if let Some(spec) = config.pipelines.get_mut("fonts") {
            spec.strict = true;
        }
        assert!(!validate_config(&config, &default_stage_registry()).is_ok());
    }
}
