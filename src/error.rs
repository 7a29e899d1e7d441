use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Every failure a task, pipeline or stage can raise.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("No source files matched {patterns:?}")]
    NoMatch { patterns: Vec<String> },

    #[error("{stage} failed on {}{}: {message}", .path.display(), location_suffix(.location))]
    Transform {
        stage: String,
        path: PathBuf,
        message: String,
        location: Option<SourceLocation>,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unknown task '{name}'. Available tasks: {}", .known.join(", "))]
    UnknownTask { name: String, known: Vec<String> },

    #[error("Failed to read source {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

fn location_suffix(location: &Option<SourceLocation>) -> String {
    location.map(|loc| format!(":{loc}")).unwrap_or_default()
}

impl Fault {
    pub fn transform(stage: &str, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Fault::Transform {
            stage: stage.to_string(),
            path: path.into(),
            message: message.into(),
            location: None,
        }
    }

    /// Faults that a watch session recovers from locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Fault::Transform { .. } | Fault::Source { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Fault::NoMatch { .. } => "NoMatchError",
            Fault::Transform { .. } => "TransformFault",
            Fault::Write { .. } => "WriteFault",
            Fault::UnknownTask { .. } => "UnknownTaskError",
            Fault::Source { .. } => "SourceFault",
            Fault::InvalidPattern { .. } => "InvalidPattern",
            Fault::Config(_) => "ConfigFault",
        }
    }

    pub fn notification(&self, title: &str, subtitle: &str) -> Notification {
        Notification {
            title: title.to_string(),
            subtitle: subtitle.to_string(),
            message: self.to_string(),
        }
    }
}

/// Payload delivered to an error sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub subtitle: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_message_includes_location() {
        let fault = Fault::Transform {
            stage: "sass".into(),
            path: PathBuf::from("src/b.scss"),
            message: "expected \";\"".into(),
            location: Some(SourceLocation { line: 3, column: 7 }),
        };
        assert_eq!(
            fault.to_string(),
            "sass failed on src/b.scss:3:7: expected \";\""
        );
        assert!(fault.is_recoverable());
    }

    #[test]
    fn notification_carries_title_and_subtitle() {
        let fault = Fault::UnknownTask {
            name: "deploy".into(),
            known: vec!["build".into(), "dev".into()],
        };
        let note = fault.notification("Itou", "Error!");
        assert_eq!(note.title, "Itou");
        assert_eq!(note.subtitle, "Error!");
        assert!(note.message.contains("build, dev"));
        assert!(!fault.is_recoverable());
    }
}
