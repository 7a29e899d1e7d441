use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Digest of every file in a build output, for deploy diffing and cache
/// busting.
#[derive(Debug, Serialize, Deserialize)]
pub struct BuildManifest {
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the destination directory, `/`-separated.
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

impl BuildManifest {
    pub fn scan(dist: &Path) -> Result<Self> {
        let mut files = Vec::new();
        collect(dist, dist, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self {
            generated_at: Utc::now(),
            files,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create manifest: {}", path.display()))?;
        serde_yaml::to_writer(file, self)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
        Ok(())
    }
}

/// Scans `dist` and writes the manifest to `output`.
pub fn generate_manifest(dist: &Path, output: &Path) -> Result<BuildManifest> {
    let manifest = BuildManifest::scan(dist)?;
    manifest.write(output)?;
    Ok(manifest)
}

fn collect(root: &Path, dir: &Path, files: &mut Vec<ManifestEntry>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect(root, &path, files)?;
            continue;
        }
        let contents =
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        files.push(ManifestEntry {
            path: relative_key(root, &path),
            sha256: hash_bytes(&contents),
            size: contents.len() as u64,
        });
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_lists_files_sorted_with_digests() {
        let temp = tempfile::tempdir().unwrap();
        let dist = temp.path().join("dist");
        fs::create_dir_all(dist.join("css")).unwrap();
        fs::write(dist.join("index.html"), "hi").unwrap();
        fs::write(dist.join("css/a.css"), "").unwrap();

        let output = temp.path().join("manifest.yaml");
        let manifest = generate_manifest(&dist, &output).unwrap();
        let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["css/a.css", "index.html"]);
        assert_eq!(
            manifest.files[0].sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(manifest.files[1].size, 2);

        let reloaded: BuildManifest =
            serde_yaml::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(reloaded.files, manifest.files);
    }
}
