//! Retrieval index
//!
//! Documents under the configured folder are chunked, embedded and persisted
//! once. Later runs load the persisted index instead of rebuilding it.

pub mod embeddings;
pub mod reader;
pub mod store;

use std::path::Path;
use tracing::info;

use crate::config::IndexConfig;
use crate::error::IndexBuildError;

pub use embeddings::{cosine_similarity, CachedEmbedder, Embedder, HashEmbedder, OllamaEmbedder};
pub use reader::{split_into_nodes, Document, DocumentReader, Node};
pub use store::{IndexMetadata, ScoredNode, VectorIndex};

/// Where a resolved index came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    Built,
    Loaded,
}

/// Load the persisted index if its directory exists, otherwise build and
/// persist it. An existing directory that does not hold a readable index is
/// `Corrupt`; it is never overwritten here.
///
/// A persisted index built with a different embedding model is rejected
/// rather than silently mixed with new query embeddings.
pub async fn resolve_index(
    config: &IndexConfig,
    embedder: &dyn Embedder,
) -> Result<(VectorIndex, IndexOrigin), IndexBuildError> {
    if config.persist_dir.exists() {
        let index = VectorIndex::load(&config.persist_dir)?;
        check_model(index.metadata(), embedder)?;
        return Ok((index, IndexOrigin::Loaded));
    }

    let index = build_index(&config.docs_dir, config, embedder).await?;
    index.persist(&config.persist_dir)?;
    Ok((index, IndexOrigin::Built))
}

/// Build from source documents unconditionally and replace the persisted copy
pub async fn rebuild_index(
    config: &IndexConfig,
    embedder: &dyn Embedder,
) -> Result<VectorIndex, IndexBuildError> {
    let index = build_index(&config.docs_dir, config, embedder).await?;
    index.replace(&config.persist_dir)?;
    Ok(index)
}

async fn build_index(
    docs_dir: &Path,
    config: &IndexConfig,
    embedder: &dyn Embedder,
) -> Result<VectorIndex, IndexBuildError> {
    info!("Building index from {}", docs_dir.display());
    let documents = DocumentReader::new(docs_dir).load()?;
    let nodes = split_into_nodes(&documents, config.chunk_size, config.chunk_overlap);
    info!("{} documents split into {} nodes", documents.len(), nodes.len());
    VectorIndex::build(nodes, documents.len(), embedder).await
}

fn check_model(metadata: &IndexMetadata, embedder: &dyn Embedder) -> Result<(), IndexBuildError> {
    if metadata.embed_model != embedder.model_name() {
        return Err(IndexBuildError::EmbeddingMismatch {
            persisted: metadata.embed_model.clone(),
            configured: embedder.model_name().to_string(),
        });
    }
    Ok(())
}
