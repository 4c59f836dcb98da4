use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use crate::chunk::Document;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Lowercase file extensions to read, without the dot
    pub extensions: Vec<String>,
    /// Larger files are skipped
    pub max_file_bytes: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let extensions = [
            "txt", "md", "markdown", "rst", "rs", "py", "js", "ts", "tsx", "go", "java",
            "c", "h", "cpp", "toml", "yaml", "yml", "json",
        ];
        Self {
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            max_file_bytes: 2 * 1024 * 1024,
        }
    }
}

pub struct Scanner {
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Read every supported file under `paths` (files or directories) into
    /// documents, ordered by path. A path listed twice yields one document.
    pub async fn scan(&self, paths: &[PathBuf]) -> Result<Vec<Document>> {
        let roots = paths.to_vec();
        let config = self.config.clone();
        let files = tokio::task::spawn_blocking(move || collect_files(&roots, &config))
            .await
            .context("File walker task failed")??;

        let mut documents = Vec::with_capacity(files.len());
        for path in files {
            if let Some(document) = self.read_document(&path).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    async fn read_document(&self, path: &Path) -> Result<Option<Document>> {
        let bytes = fs::read(path)
            .await
            .context(format!("Failed to read file: {:?}", path))?;

        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                debug!(path = %path.display(), "Skipping non-UTF-8 file");
                return Ok(None);
            }
        };

        let path_str = path.to_string_lossy().to_string();
        let size = content.len();
        let mut document = Document::new(&path_str, content);
        if let Some(ext) = extension_of(path) {
            document.metadata.insert("extension".to_string(), Value::String(ext));
        }
        document.metadata.insert("size_bytes".to_string(), Value::from(size));

        Ok(Some(document))
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

fn collect_files(roots: &[PathBuf], config: &ScannerConfig) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();

    for root in roots {
        if !root.exists() {
            anyhow::bail!("Input path does not exist: {:?}", root);
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !is_hidden(&entry.file_name().to_string_lossy())
            });

        for entry in walker {
            let entry = entry.context(format!("Failed to walk {:?}", root))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let supported = extension_of(entry.path())
                .map(|ext| config.extensions.iter().any(|e| *e == ext))
                .unwrap_or(false);
            if !supported {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > config.max_file_bytes {
                debug!(path = %entry.path().display(), size, "Skipping oversized file");
                continue;
            }

            files.insert(entry.into_path());
        }
    }

    Ok(files.into_iter().collect())
}
