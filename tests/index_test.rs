//! Index resolution against real directories

use std::path::Path;

use voice_assistant::config::IndexConfig;
use voice_assistant::error::IndexBuildError;
use voice_assistant::index::{resolve_index, HashEmbedder, IndexOrigin};

fn config(root: &Path) -> IndexConfig {
    IndexConfig {
        persist_dir: root.join("chat-engine-storage"),
        docs_dir: root.join("docs"),
        chunk_size: 64,
        chunk_overlap: 8,
        similarity_top_k: 2,
    }
}

fn write_docs(docs: &Path) {
    std::fs::create_dir_all(docs).unwrap();
    std::fs::write(
        docs.join("billing.md"),
        "Invoices are sent monthly. Refunds for billing errors are issued within five days.",
    )
    .unwrap();
    std::fs::write(
        docs.join("shipping.txt"),
        "Parcels ship from the warehouse on weekdays and arrive within a week.",
    )
    .unwrap();
}

#[tokio::test]
async fn test_resolve_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    write_docs(&config.docs_dir);
    let embedder = HashEmbedder::new(256);

    let (built, origin) = resolve_index(&config, &embedder).await.unwrap();
    assert_eq!(origin, IndexOrigin::Built);
    assert!(config.persist_dir.join("metadata.json").is_file());

    let (loaded, origin) = resolve_index(&config, &embedder).await.unwrap();
    assert_eq!(origin, IndexOrigin::Loaded);
    assert_eq!(loaded.metadata(), built.metadata());
    assert_eq!(loaded.len(), built.len());

    let query = "when do parcels ship from the warehouse";
    let a = built.query(&embedder, query, 1).await.unwrap();
    let b = loaded.query(&embedder, query, 1).await.unwrap();
    assert_eq!(a[0].node.document_id, "shipping.txt");
    assert_eq!(a[0].node.id, b[0].node.id);
}

#[tokio::test]
async fn test_empty_docs_folder_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::create_dir_all(&config.docs_dir).unwrap();

    let err = resolve_index(&config, &HashEmbedder::new(32)).await.unwrap_err();
    assert!(matches!(err, IndexBuildError::NoDocuments(_)));
    assert!(!config.persist_dir.exists());
}

#[tokio::test]
async fn test_corrupt_persisted_index_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    write_docs(&config.docs_dir);
    std::fs::create_dir_all(&config.persist_dir).unwrap();
    std::fs::write(config.persist_dir.join("metadata.json"), b"\x00garbage").unwrap();

    let err = resolve_index(&config, &HashEmbedder::new(32)).await.unwrap_err();
    assert!(matches!(err, IndexBuildError::Corrupt { .. }));
}

#[tokio::test]
async fn test_existing_directory_without_metadata_is_left_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    write_docs(&config.docs_dir);
    std::fs::create_dir_all(&config.persist_dir).unwrap();
    std::fs::write(config.persist_dir.join("docstore.json"), "{\"docs\": {}}").unwrap();

    let err = resolve_index(&config, &HashEmbedder::new(32)).await.unwrap_err();
    assert!(matches!(err, IndexBuildError::Corrupt { .. }));

    let contents: Vec<_> = std::fs::read_dir(&config.persist_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(contents, vec![std::ffi::OsString::from("docstore.json")]);
    assert_eq!(
        std::fs::read_to_string(config.persist_dir.join("docstore.json")).unwrap(),
        "{\"docs\": {}}"
    );
}
