//! Conversion pipeline: resolves an image reference to a manifest, downloads and chains its
//! layers into a content-addressed repo, and records an idempotency manifest for the result.
//! Split from the original `original_source/ducc` Go package into the data model
//! (`model`), the Layer Downloader (`download`), the Chain Builder (`chain`), the
//! Idempotency Registry (`idempotency`), the backlink sink (`backlink`), the removal
//! scheduler (`removal`), and the Ingestion Pipeline orchestrator (`ingest`).

pub mod backlink;
pub mod chain;
pub mod download;
pub mod idempotency;
pub mod ingest;
pub mod model;
pub mod removal;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
    Registry(#[from] ducc_registry::Error),
    Cas(#[from] ducc_cas::Error),
    Json(#[from] serde_json::Error),
    BadDigestEncoding(String),
    BadImageRef(String),
    OpaqueWhiteoutNoParent,
    BadChainOverlay,
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
