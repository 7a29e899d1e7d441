use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use serde_json::Value;

use super::{take_string, value_as_bool};
use crate::error::{Fault, SourceLocation};
use crate::pipeline::{FileRecord, Stage, StageParameters};

/// Compiles `.scss`/`.sass` sources to CSS with grass.
pub struct SassStage {
    compressed: bool,
    load_paths: Vec<PathBuf>,
}

impl SassStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let compressed = match take_string(&mut params, "style").as_deref() {
            None | Some("expanded") => false,
            Some("compressed") => true,
            Some(other) => bail!("Unknown sass output style '{other}'"),
        };
        let load_paths = match params.remove("load_paths") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| {
                    item.as_str()
                        .map(PathBuf::from)
                        .ok_or_else(|| anyhow!("sass 'load_paths' entries must be strings"))
                })
                .collect::<Result<_>>()?,
            Some(Value::String(single)) => vec![PathBuf::from(single)],
            Some(other) => bail!("Unsupported sass 'load_paths' value: {other}"),
        };
        Ok(Self {
            compressed,
            load_paths,
        })
    }
}

impl Stage for SassStage {
    fn name(&self) -> &'static str {
        "sass"
    }

    fn apply(&self, record: FileRecord) -> Result<Vec<FileRecord>, Fault> {
        let source = record.text(self.name())?.to_string();
        let indented = record
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sass"));

        let style = if self.compressed {
            grass::OutputStyle::Compressed
        } else {
            grass::OutputStyle::Expanded
        };
        let mut options = grass::Options::default().style(style);
        if indented {
            options = options.input_syntax(grass::InputSyntax::Sass);
        }
        if let Some(parent) = record.path.parent() {
            options = options.load_path(parent);
        }
        for path in &self.load_paths {
            options = options.load_path(path);
        }

        let css = grass::from_string(source, &options).map_err(|err| {
            let message = err.to_string();
            Fault::Transform {
                stage: self.name().to_string(),
                path: record.path.clone(),
                location: location_from_report(&message),
                message: first_line(&message),
            }
        })?;

        let output = record.with_path(record.path.with_extension("css"));
        Ok(vec![output.with_contents(css.into_bytes())])
    }
}

/// Minifies CSS with lightningcss.
pub struct MinifyCssStage {
    merge_rules: bool,
}

impl MinifyCssStage {
    pub fn from_params(params: StageParameters) -> Result<Self> {
        let merge_rules = params
            .get("merge_rules")
            .and_then(value_as_bool)
            .unwrap_or(true);
        Ok(Self { merge_rules })
    }
}

impl Stage for MinifyCssStage {
    fn name(&self) -> &'static str {
        "minify-css"
    }

    fn apply(&self, record: FileRecord) -> Result<Vec<FileRecord>, Fault> {
        let text = record.text(self.name())?;
        let fault = |message: String, location: Option<SourceLocation>| Fault::Transform {
            stage: "minify-css".to_string(),
            path: record.path.clone(),
            message,
            location,
        };

        let options = ParserOptions {
            filename: record.path.to_string_lossy().to_string(),
            ..ParserOptions::default()
        };
        let mut sheet = StyleSheet::parse(text, options).map_err(|err| {
            let location = err.loc.as_ref().map(|loc| SourceLocation {
                line: loc.line as usize + 1,
                column: loc.column as usize,
            });
            fault(err.kind.to_string(), location)
        })?;
        if self.merge_rules {
            sheet
                .minify(MinifyOptions::default())
                .map_err(|err| fault(err.to_string(), None))?;
        }
        let printed = sheet
            .to_css(PrinterOptions {
                minify: true,
                ..PrinterOptions::default()
            })
            .map_err(|err| fault(err.to_string(), None))?;

        Ok(vec![record.with_contents(printed.code.into_bytes())])
    }
}

fn first_line(message: &str) -> String {
    message
        .lines()
        .map(|line| line.trim_start_matches("Error:").trim())
        .find(|line| !line.is_empty())
        .unwrap_or(message)
        .to_string()
}

/// Pulls `line:column` out of a grass error report, whose trailer reads
/// like `  input.scss 3:7  root stylesheet`.
fn location_from_report(message: &str) -> Option<SourceLocation> {
    message.lines().rev().find_map(|line| {
        line.split_whitespace().find_map(|token| {
            let (line, column) = token.split_once(':')?;
            Some(SourceLocation {
                line: line.parse().ok()?,
                column: column.parse().ok()?,
            })
        })
    })
}
