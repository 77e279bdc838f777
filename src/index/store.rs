//! In-memory vector store with on-disk persistence
//!
//! Layout of a persisted index:
//!
//! ```text
//! <persist_dir>/
//!   metadata.json      embedding model, dimension, creation time
//!   vector_store.json  nodes with their embeddings
//! ```
//!
//! Writes go to a sibling staging directory which is renamed into place, so
//! a crash mid-build never leaves a half-written index behind. Replacing an
//! existing index moves the old copy aside first and only deletes it once
//! the new one is in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::embeddings::{cosine_similarity, Embedder};
use super::reader::Node;
use crate::error::{EmbeddingError, IndexBuildError};

pub const FORMAT_VERSION: u32 = 1;
const METADATA_FILE: &str = "metadata.json";
const VECTOR_FILE: &str = "vector_store.json";
const EMBED_BATCH: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub format_version: u32,
    pub embed_model: String,
    pub dimension: usize,
    pub document_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNode {
    node: Node,
    embedding: Vec<f32>,
}

/// A node returned from retrieval
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f32,
}

/// Read-only after construction; shared across sessions
#[derive(Debug, Clone)]
pub struct VectorIndex {
    metadata: IndexMetadata,
    entries: Vec<StoredNode>,
}

impl VectorIndex {
    /// Embed `nodes` and build the index in memory
    pub async fn build(
        nodes: Vec<Node>,
        document_count: usize,
        embedder: &dyn Embedder,
    ) -> Result<Self, IndexBuildError> {
        let mut entries = Vec::with_capacity(nodes.len());
        for batch in nodes.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|n| n.text.clone()).collect();
            let embeddings = embedder.embed_batch(&texts).await?;
            if embeddings.len() != batch.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embeddings.len()
                ))
                .into());
            }
            entries.extend(
                batch
                    .iter()
                    .cloned()
                    .zip(embeddings)
                    .map(|(node, embedding)| StoredNode { node, embedding }),
            );
        }

        let dimension = entries.first().map(|e| e.embedding.len()).unwrap_or(0);
        debug!("Embedded {} nodes ({} dimensions)", entries.len(), dimension);

        Ok(Self {
            metadata: IndexMetadata {
                format_version: FORMAT_VERSION,
                embed_model: embedder.model_name().to_string(),
                dimension,
                document_count,
                created_at: Utc::now(),
            },
            entries,
        })
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if anything exists at `dir`. A directory without a readable
    /// index fails to load as `Corrupt` rather than being rebuilt over.
    pub fn exists(dir: &Path) -> bool {
        dir.exists()
    }

    /// Write the index to `dir`, which must not exist yet
    pub fn persist(&self, dir: &Path) -> Result<(), IndexBuildError> {
        if dir.exists() {
            return Err(IndexBuildError::Persist {
                path: dir.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "persist directory already exists",
                ),
            });
        }
        let staging = self.stage(dir)?;
        if let Err(source) = std::fs::rename(&staging, dir) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(IndexBuildError::Persist {
                path: dir.to_path_buf(),
                source,
            });
        }

        info!("Persisted index ({} nodes) to {}", self.entries.len(), dir.display());
        Ok(())
    }

    /// Write the index to `dir`, swapping out any previous copy. The old
    /// directory is only deleted once the new one is in place, and is put
    /// back if the swap fails.
    pub fn replace(&self, dir: &Path) -> Result<(), IndexBuildError> {
        if !dir.exists() {
            return self.persist(dir);
        }

        let staging = self.stage(dir)?;
        let previous = sibling_dir(dir, "previous");
        if let Err(source) = std::fs::rename(dir, &previous) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(IndexBuildError::Persist {
                path: dir.to_path_buf(),
                source,
            });
        }

        if let Err(source) = std::fs::rename(&staging, dir) {
            if let Err(e) = std::fs::rename(&previous, dir) {
                warn!(
                    "Failed to restore previous index from {}: {}",
                    previous.display(),
                    e
                );
            }
            let _ = std::fs::remove_dir_all(&staging);
            return Err(IndexBuildError::Persist {
                path: dir.to_path_buf(),
                source,
            });
        }

        if let Err(e) = std::fs::remove_dir_all(&previous) {
            warn!("Failed to remove previous index {}: {}", previous.display(), e);
        }
        info!("Replaced index ({} nodes) at {}", self.entries.len(), dir.display());
        Ok(())
    }

    /// Write both files into a fresh sibling staging directory
    fn stage(&self, dir: &Path) -> Result<PathBuf, IndexBuildError> {
        let staging = sibling_dir(dir, "staging");
        std::fs::create_dir_all(&staging).map_err(|source| IndexBuildError::Persist {
            path: staging.clone(),
            source,
        })?;

        let written = write_json(&staging.join(VECTOR_FILE), &self.entries)
            .and_then(|_| write_json(&staging.join(METADATA_FILE), &self.metadata));
        if let Err(e) = written {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        Ok(staging)
    }

    /// Load a persisted index. Any missing or malformed file is `Corrupt`.
    pub fn load(dir: &Path) -> Result<Self, IndexBuildError> {
        let metadata: IndexMetadata = read_json(dir, METADATA_FILE)?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(IndexBuildError::Corrupt {
                path: dir.to_path_buf(),
                message: format!("unsupported format version {}", metadata.format_version),
            });
        }

        let entries: Vec<StoredNode> = read_json(dir, VECTOR_FILE)?;
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != metadata.dimension) {
            return Err(IndexBuildError::Corrupt {
                path: dir.to_path_buf(),
                message: format!(
                    "node {} has {} dimensions, expected {}",
                    bad.node.id,
                    bad.embedding.len(),
                    metadata.dimension
                ),
            });
        }

        info!("Loaded index ({} nodes) from {}", entries.len(), dir.display());
        Ok(Self { metadata, entries })
    }

    /// Top `top_k` nodes by cosine similarity to `query_embedding`
    pub fn retrieve(&self, query_embedding: &[f32], top_k: usize) -> Vec<ScoredNode> {
        let mut scored: Vec<ScoredNode> = self
            .entries
            .iter()
            .map(|e| ScoredNode {
                node: e.node.clone(),
                score: cosine_similarity(query_embedding, &e.embedding),
            })
            .collect();
        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        scored
    }

    /// Embed `query` and retrieve the closest nodes
    pub async fn query(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredNode>, EmbeddingError> {
        let embedding = embedder.embed(query).await?;
        Ok(self.retrieve(&embedding, top_k))
    }
}

fn sibling_dir(dir: &Path, label: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    dir.with_file_name(format!("{}.{}-{}", name, label, uuid::Uuid::new_v4()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IndexBuildError> {
    let json = serde_json::to_vec(value).map_err(|e| IndexBuildError::Persist {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    std::fs::write(path, json).map_err(|source| IndexBuildError::Persist {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(dir: &Path, file: &str) -> Result<T, IndexBuildError> {
    let path = dir.join(file);
    let corrupt = |message: String| IndexBuildError::Corrupt {
        path: dir.to_path_buf(),
        message,
    };
    let bytes = std::fs::read(&path).map_err(|e| corrupt(format!("{}: {}", file, e)))?;
    serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("{}: {}", file, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::embeddings::HashEmbedder;

    fn node(id: &str, text: &str) -> Node {
        Node {
            id: id.to_string(),
            document_id: id.to_string(),
            text: text.to_string(),
        }
    }

    async fn sample_index() -> VectorIndex {
        let nodes = vec![
            node("pets", "cats and dogs are common pets"),
            node("space", "rockets travel to orbit and beyond"),
            node("food", "pasta with tomato sauce for dinner"),
        ];
        VectorIndex::build(nodes, 3, &HashEmbedder::new(256)).await.unwrap()
    }

    #[tokio::test]
    async fn test_query_ranks_relevant_node_first() {
        let index = sample_index().await;
        let hits = index.query(&HashEmbedder::new(256), "rockets in orbit", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node.id, "space");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("storage");
        let index = sample_index().await;
        index.persist(&target).unwrap();

        assert!(VectorIndex::exists(&target));
        let loaded = VectorIndex::load(&target).unwrap();
        assert_eq!(loaded.metadata(), index.metadata());
        assert_eq!(loaded.len(), 3);

        // No staging directories left behind
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_persist_refuses_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("storage");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("docstore.json"), "{}").unwrap();

        let err = sample_index().await.persist(&target).unwrap_err();
        assert!(matches!(err, IndexBuildError::Persist { .. }));
        assert!(target.join("docstore.json").is_file());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_replace_swaps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("storage");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.txt"), "old").unwrap();

        sample_index().await.replace(&target).unwrap();
        assert!(!target.join("stale.txt").exists());
        assert_eq!(VectorIndex::load(&target).unwrap().len(), 3);
        // Neither the staging nor the previous copy is left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_replace_without_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("storage");
        sample_index().await.replace(&target).unwrap();
        assert!(VectorIndex::exists(&target));
    }

    #[test]
    fn test_load_directory_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docstore.json"), "{}").unwrap();
        let err = VectorIndex::load(dir.path()).unwrap_err();
        assert!(matches!(err, IndexBuildError::Corrupt { .. }));
    }

    #[test]
    fn test_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "{ not json").unwrap();
        let err = VectorIndex::load(dir.path()).unwrap_err();
        assert!(matches!(err, IndexBuildError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_load_missing_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("storage");
        sample_index().await.persist(&target).unwrap();
        std::fs::remove_file(target.join(VECTOR_FILE)).unwrap();
        assert!(matches!(
            VectorIndex::load(&target).unwrap_err(),
            IndexBuildError::Corrupt { .. }
        ));
    }
}
