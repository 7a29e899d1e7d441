use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::error::Fault;
use crate::pipeline::{FileRecord, Stage, StageParameters, StageRegistry};

pub mod image;
pub mod style;
pub mod template;

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("skip-partials", |params| {
        Ok(Box::new(SkipPartialsStage::from_params(params)?))
    });
    registry.register("rename", |params| {
        Ok(Box::new(RenameStage::from_params(params)?))
    });
    registry.register("sourcemap", |params| {
        Ok(Box::new(SourcemapStage::from_params(params)?))
    });
    registry.register("template", |params| {
        Ok(Box::new(template::TemplateStage::from_params(params)?))
    });
    registry.register("sass", |params| {
        Ok(Box::new(style::SassStage::from_params(params)?))
    });
    registry.register("minify-css", |params| {
        Ok(Box::new(style::MinifyCssStage::from_params(params)?))
    });
    registry.register("compress-image", |params| {
        Ok(Box::new(image::CompressImageStage::from_params(params)?))
    });
}

/// Drops files whose name starts with the partial prefix (`_` by default).
pub struct SkipPartialsStage {
    prefix: String,
}

impl SkipPartialsStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let prefix = take_string(&mut params, "prefix").unwrap_or_else(|| "_".to_string());
        if prefix.is_empty() {
            return Err(anyhow!("skip-partials 'prefix' cannot be empty"));
        }
        Ok(Self { prefix })
    }
}

impl Stage for SkipPartialsStage {
    fn name(&self) -> &'static str {
        "skip-partials"
    }

    fn apply(&self, record: FileRecord) -> Result<Vec<FileRecord>, Fault> {
        if record.file_name().starts_with(&self.prefix) {
            Ok(Vec::new())
        } else {
            Ok(vec![record])
        }
    }
}

pub struct RenameStage {
    extension: Option<String>,
    prefix: String,
    suffix: String,
}

impl RenameStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let extension =
            take_string(&mut params, "extension").map(|ext| ext.trim_start_matches('.').to_string());
        let prefix = take_string(&mut params, "prefix").unwrap_or_default();
        let suffix = take_string(&mut params, "suffix").unwrap_or_default();
        if extension.is_none() && prefix.is_empty() && suffix.is_empty() {
            return Err(anyhow!(
                "rename stage requires at least one of 'extension', 'prefix' or 'suffix'"
            ));
        }
        Ok(Self {
            extension,
            prefix,
            suffix,
        })
    }
}

impl Stage for RenameStage {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn apply(&self, record: FileRecord) -> Result<Vec<FileRecord>, Fault> {
        let stem = record
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = match &self.extension {
            Some(ext) => ext.clone(),
            None => record
                .path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
        };
        let mut file_name = format!("{}{}{}", self.prefix, stem, self.suffix);
        if !extension.is_empty() {
            file_name.push('.');
            file_name.push_str(&extension);
        }
        let renamed = record.path.with_file_name(file_name);
        Ok(vec![record.with_path(renamed)])
    }
}

/// Emits a `.map` file next to each record and links it from the output.
///
/// The map is file level: it names the original source (and optionally
/// embeds its text) without per-token mappings.
pub struct SourcemapStage {
    directory: PathBuf,
    source_root: String,
    include_content: bool,
}

impl SourcemapStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let directory = take_string(&mut params, "directory")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        if directory.is_absolute() {
            return Err(anyhow!("sourcemap 'directory' must be relative"));
        }
        let source_root =
            take_string(&mut params, "source_root").unwrap_or_else(|| "/source/".to_string());
        let include_content = params
            .get("include_content")
            .and_then(value_as_bool)
            .unwrap_or(true);
        Ok(Self {
            directory,
            source_root,
            include_content,
        })
    }

    fn comment(&self, record: &FileRecord, map_url: &str) -> String {
        let is_css = record
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("css"));
        if is_css {
            format!("\n/*# sourceMappingURL={map_url} */\n")
        } else {
            format!("\n//# sourceMappingURL={map_url}\n")
        }
    }
}

impl Stage for SourcemapStage {
    fn name(&self) -> &'static str {
        "sourcemap"
    }

    fn apply(&self, record: FileRecord) -> Result<Vec<FileRecord>, Fault> {
        let file_name = record.file_name();
        let map_name = format!("{file_name}.map");
        let parent = record.path.parent().unwrap_or(Path::new(""));
        let map_path = normalize(&parent.join(&self.directory).join(&map_name));
        let map_url = to_url(&normalize(&self.directory.join(&map_name)));

        let source = record
            .origin
            .strip_prefix(&record.base)
            .unwrap_or(&record.origin);
        let mut map = json!({
            "version": 3,
            "file": file_name,
            "sources": [to_url(source)],
            "names": [],
            "mappings": "",
            "sourceRoot": self.source_root,
        });
        if self.include_content {
            let content = fs::read_to_string(&record.origin).map_err(|source| Fault::Source {
                path: record.origin.clone(),
                source,
            })?;
            map["sourcesContent"] = json!([content]);
        }
        let map_bytes = serde_json::to_vec(&map)
            .map_err(|err| Fault::transform(self.name(), &record.path, err.to_string()))?;

        let mut contents = record.contents.clone();
        contents.extend_from_slice(self.comment(&record, &map_url).as_bytes());

        let map_record = record.with_path(map_path).with_contents(map_bytes);
        Ok(vec![record.with_contents(contents), map_record])
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

fn to_url(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn param_string(options: &StageParameters, key: &str) -> Option<String> {
    options
        .get(key)
        .and_then(|value| value.as_str().map(|s| s.to_string()))
}

pub(crate) fn param_f64(options: &StageParameters, key: &str) -> Option<f64> {
    options.get(key).and_then(value_as_f64)
}

pub(crate) fn param_u8(options: &StageParameters, key: &str) -> Option<u8> {
    options
        .get(key)
        .and_then(value_as_u64)
        .and_then(|value| u8::try_from(value).ok())
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(num) => num.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(num) => num.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(num) => num.as_u64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}
