//! Resolves source globs into a lazy, deterministic sequence of files.
//!
//! Patterns are relative to the project root and may use `{a,b}`
//! alternation on top of the usual `*`, `?`, `**` and `[...]` syntax.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use glob::{MatchOptions, Pattern, Paths};

use crate::error::Fault;

/// A path yielded by the matcher together with its glob base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedFile {
    pub path: PathBuf,
    pub base: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FileMatcher {
    root: PathBuf,
    patterns: Vec<String>,
    since: Option<SystemTime>,
    strict: bool,
}

impl FileMatcher {
    pub fn new(root: impl Into<PathBuf>, patterns: &[String]) -> Self {
        Self {
            root: root.into(),
            patterns: patterns.to_vec(),
            since: None,
            strict: false,
        }
    }

    /// Only yield files modified strictly after `marker`.
    pub fn since(mut self, marker: Option<SystemTime>) -> Self {
        self.since = marker;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Expands every pattern and returns the lazy match sequence.
    ///
    /// In strict mode the first match is probed eagerly so an empty result
    /// surfaces as [`Fault::NoMatch`] before any work starts.
    pub fn matches(&self) -> Result<Matches, Fault> {
        let mut expanded = Vec::new();
        for pattern in &self.patterns {
            for alternative in expand_braces(pattern) {
                let base = self.root.join(glob_base(&alternative));
                let full = if Path::new(&alternative).is_absolute() {
                    alternative.clone()
                } else {
                    format!(
                        "{}/{}",
                        Pattern::escape(&self.root.to_string_lossy()),
                        alternative.trim_start_matches("./")
                    )
                };
                let paths = glob::glob_with(&full, match_options()).map_err(|err| {
                    Fault::InvalidPattern {
                        pattern: pattern.clone(),
                        message: err.msg.to_string(),
                    }
                })?;
                expanded.push((base, paths));
            }
        }

        let mut matches = Matches {
            pending: expanded.into_iter().collect(),
            current: None,
            seen: HashSet::new(),
            since: self.since,
            peeked: None,
        };

        if self.strict {
            match matches.next() {
                Some(first) => matches.peeked = Some(first),
                None => {
                    return Err(Fault::NoMatch {
                        patterns: self.patterns.clone(),
                    });
                }
            }
        }

        Ok(matches)
    }

    /// Returns true when `path` (relative to the root or absolute under it)
    /// matches one of the configured patterns. Absolute patterns are
    /// checked against the absolute path.
    pub fn is_match(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let absolute = self.root.join(relative);
        self.patterns.iter().any(|pattern| {
            expand_braces(pattern).iter().any(|alt| {
                let (pattern, candidate) = if Path::new(alt).is_absolute() {
                    (alt.as_str(), absolute.as_path())
                } else {
                    (alt.trim_start_matches("./"), relative)
                };
                Pattern::new(pattern)
                    .map(|p| p.matches_path_with(candidate, match_options()))
                    .unwrap_or(false)
            })
        })
    }
}

/// Lazy iterator over matched files; each file is yielded at most once.
pub struct Matches {
    pending: std::collections::VecDeque<(PathBuf, Paths)>,
    current: Option<(PathBuf, Paths)>,
    seen: HashSet<PathBuf>,
    since: Option<SystemTime>,
    peeked: Option<Result<MatchedFile, Fault>>,
}

impl Iterator for Matches {
    type Item = Result<MatchedFile, Fault>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(peeked) = self.peeked.take() {
            return Some(peeked);
        }
        loop {
            if self.current.is_none() {
                self.current = Some(self.pending.pop_front()?);
            }
            let (base, paths) = self.current.as_mut()?;
            let Some(entry) = paths.next() else {
                self.current = None;
                continue;
            };
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    let path = err.path().to_path_buf();
                    return Some(Err(Fault::Source {
                        path,
                        source: err.into(),
                    }));
                }
            };
            if !path.is_file() || !self.seen.insert(path.clone()) {
                continue;
            }
            if let Some(marker) = self.since {
                match modified_after(&path, marker) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(source) => return Some(Err(Fault::Source { path, source })),
                }
            }
            return Some(Ok(MatchedFile {
                path,
                base: base.clone(),
            }));
        }
    }
}

fn modified_after(path: &Path, marker: SystemTime) -> std::io::Result<bool> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified > marker)
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Expands `{a,b}` alternations, including nested ones, left to right.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let mut depth = 0usize;
    let mut close = None;
    let mut splits = Vec::new();
    for (idx, ch) in pattern[open..].char_indices() {
        let idx = open + idx;
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(idx);
                    break;
                }
            }
            ',' if depth == 1 => splits.push(idx),
            _ => {}
        }
    }
    let Some(close) = close else {
        return vec![pattern.to_string()];
    };

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    let mut bounds = vec![open];
    bounds.extend(&splits);
    bounds.push(close);

    let mut out = Vec::new();
    for window in bounds.windows(2) {
        let option = &pattern[window[0] + 1..window[1]];
        for expanded in expand_braces(&format!("{prefix}{option}{suffix}")) {
            if !out.contains(&expanded) {
                out.push(expanded);
            }
        }
    }
    out
}

/// The leading directory of a pattern that contains no glob syntax.
///
/// `src/images/**/*.png` has base `src/images`; a literal path such as
/// `src/javascripts/app.js` has its parent directory as base.
pub fn glob_base(pattern: &str) -> PathBuf {
    let path = Path::new(pattern);
    let mut base = PathBuf::new();
    let mut components = path.components().peekable();
    while let Some(component) = components.next() {
        let text = component.as_os_str().to_string_lossy();
        if has_magic(&text) {
            return base;
        }
        if components.peek().is_none() {
            break;
        }
        match component {
            Component::CurDir => {}
            other => base.push(other.as_os_str()),
        }
    }
    base
}

fn has_magic(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn braces_expand_in_order() {
        assert_eq!(
            expand_braces("src/images/**/*.{jpg,png,svg}"),
            vec![
                "src/images/**/*.jpg",
                "src/images/**/*.png",
                "src/images/**/*.svg"
            ]
        );
        assert_eq!(expand_braces("a/{b,{c,d}}.x"), vec!["a/b.x", "a/c.x", "a/d.x"]);
        assert_eq!(expand_braces("plain/*.css"), vec!["plain/*.css"]);
        assert_eq!(expand_braces("broken/{a,b"), vec!["broken/{a,b"]);
    }

    #[test]
    fn base_stops_at_first_magic_segment() {
        assert_eq!(glob_base("src/images/**/*.png"), PathBuf::from("src/images"));
        assert_eq!(glob_base("./src/**/*.ejs"), PathBuf::from("src"));
        assert_eq!(
            glob_base("src/javascripts/app.js"),
            PathBuf::from("src/javascripts")
        );
        assert_eq!(glob_base("CNAME"), PathBuf::new());
        assert_eq!(
            glob_base("/opt/theme/fonts/**/*"),
            PathBuf::from("/opt/theme/fonts")
        );
    }

    #[test]
    fn absolute_patterns_ignore_the_root() {
        let project = tempfile::tempdir().unwrap();
        let theme = tempfile::tempdir().unwrap();
        let fonts = theme.path().join("src/fonts");
        fs::create_dir_all(&fonts).unwrap();
        fs::write(fonts.join("icons.woff"), b"font").unwrap();

        let pattern = format!("{}/src/fonts/**/*", theme.path().display());
        let matcher = FileMatcher::new(project.path(), &[pattern]).strict(true);
        let matched: Vec<_> = matcher
            .matches()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            matched,
            vec![MatchedFile {
                path: fonts.join("icons.woff"),
                base: fonts.clone(),
            }]
        );
        assert!(matcher.is_match(&fonts.join("icons.woff")));
        assert!(!matcher.is_match(Path::new("src/fonts/icons.woff")));
    }
}
