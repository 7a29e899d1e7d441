use std::error::Error as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use glob::Pattern;
use serde_json::{Map, Value};
use tera::{Context, Tera};

use super::take_string;
use crate::error::Fault;
use crate::pipeline::{FileRecord, Stage, StageParameters};

/// Renders a template file to HTML with tera.
///
/// Partials (files starting with `_` under the record's base directory and
/// sharing its extension) are registered so pages can `{% include %}` them
/// by their base-relative path.
pub struct TemplateStage {
    data: Value,
    partial_prefix: String,
}

impl TemplateStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let mut data = Map::new();
        if let Some(path) = take_string(&mut params, "data_file") {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read template data: {path}"))?;
            let loaded: Value = serde_yaml::from_str(&text)
                .with_context(|| format!("Failed to parse template data: {path}"))?;
            match loaded {
                Value::Object(map) => data.extend(map),
                Value::Null => {}
                _ => bail!("Template data file '{path}' must contain a mapping"),
            }
        }
        match params.remove("data") {
            Some(Value::Object(map)) => data.extend(map),
            Some(Value::Null) | None => {}
            Some(other) => bail!("template 'data' must be a mapping, got {other}"),
        }
        let partial_prefix =
            take_string(&mut params, "partial_prefix").unwrap_or_else(|| "_".to_string());
        Ok(Self {
            data: Value::Object(data),
            partial_prefix,
        })
    }

    fn partials(&self, record: &FileRecord) -> Result<Vec<(String, String)>, Fault> {
        let Some(extension) = record.path.extension() else {
            return Ok(Vec::new());
        };
        let pattern = format!(
            "{}/**/{}*.{}",
            Pattern::escape(&record.base.to_string_lossy()),
            Pattern::escape(&self.partial_prefix),
            extension.to_string_lossy()
        );
        let entries = glob::glob(&pattern).map_err(|err| Fault::InvalidPattern {
            pattern: pattern.clone(),
            message: err.msg.to_string(),
        })?;

        let mut partials = Vec::new();
        for entry in entries.flatten() {
            if entry == record.path || !entry.is_file() {
                continue;
            }
            let text = fs::read_to_string(&entry).map_err(|source| Fault::Source {
                path: entry.clone(),
                source,
            })?;
            partials.push((template_name(&entry, &record.base), text));
        }
        Ok(partials)
    }

    fn fault(&self, record: &FileRecord, err: &tera::Error) -> Fault {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        Fault::transform(self.name(), &record.path, message)
    }
}

impl Stage for TemplateStage {
    fn name(&self) -> &'static str {
        "template"
    }

    fn apply(&self, record: FileRecord) -> Result<Vec<FileRecord>, Fault> {
        let text = record.text(self.name())?;
        let name = template_name(&record.path, &record.base);

        let mut templates = self.partials(&record)?;
        templates.push((name.clone(), text.to_string()));

        let mut tera = Tera::default();
        tera.add_raw_templates(templates)
            .map_err(|err| self.fault(&record, &err))?;
        let context =
            Context::from_value(self.data.clone()).map_err(|err| self.fault(&record, &err))?;
        let html = tera
            .render(&name, &context)
            .map_err(|err| self.fault(&record, &err))?;

        Ok(vec![record.with_contents(html.into_bytes())])
    }
}

fn template_name(path: &Path, base: &Path) -> String {
    let relative: PathBuf = path
        .strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf());
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}
