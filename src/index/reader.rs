//! Source document loading and chunking

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::IndexBuildError;

/// A text file from the source folder
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Path relative to the source folder
    pub id: String,
    pub text: String,
}

/// A retrievable chunk of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub document_id: String,
    pub text: String,
}

/// Reads every UTF-8 text file under a folder, recursively
#[derive(Debug, Clone)]
pub struct DocumentReader {
    root: PathBuf,
}

impl DocumentReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Load documents in path order. An empty folder is an error: an index
    /// with nothing in it would answer every query with no context.
    pub fn load(&self) -> Result<Vec<Document>, IndexBuildError> {
        let unreadable = |source: std::io::Error| IndexBuildError::SourceUnreadable {
            path: self.root.clone(),
            source,
        };

        let meta = std::fs::metadata(&self.root).map_err(unreadable)?;
        if !meta.is_dir() {
            return Err(unreadable(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                "not a directory",
            )));
        }

        let mut documents = Vec::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in walker {
            let entry = entry.map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory loop"));
                unreadable(source)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let bytes =
                std::fs::read(entry.path()).map_err(|source| IndexBuildError::SourceUnreadable {
                    path: entry.path().to_path_buf(),
                    source,
                })?;
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Skipping non-text file {}", entry.path().display());
                    continue;
                }
            };
            if text.trim().is_empty() {
                debug!("Skipping empty file {}", entry.path().display());
                continue;
            }

            documents.push(Document {
                id: relative_id(&self.root, entry.path()),
                text,
            });
        }

        if documents.is_empty() {
            return Err(IndexBuildError::NoDocuments(self.root.clone()));
        }

        debug!("Loaded {} documents from {}", documents.len(), self.root.display());
        Ok(documents)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn relative_id(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split documents into overlapping word windows.
///
/// `chunk_size` and `overlap` are counted in whitespace-separated words.
pub fn split_into_nodes(documents: &[Document], chunk_size: usize, overlap: usize) -> Vec<Node> {
    let chunk_size = chunk_size.max(1);
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut nodes = Vec::new();
    for document in documents {
        let words: Vec<&str> = document.text.split_whitespace().collect();
        let mut start = 0;
        let mut ordinal = 0;
        while start < words.len() {
            let end = (start + chunk_size).min(words.len());
            nodes.push(Node {
                id: format!("{}#{}", document.id, ordinal),
                document_id: document.id.clone(),
                text: words[start..end].join(" "),
            });
            ordinal += 1;
            if end == words.len() {
                break;
            }
            start += step;
        }
    }
    nodes
}
