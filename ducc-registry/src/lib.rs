//! Registry Client and Token Cache: fetches manifests and blobs from an OCI/Docker
//! distribution-v2 registry, handling the bearer-token auth handshake and registry
//! ratelimiting transparently.

pub mod auth;
mod client;
pub mod digest;
pub mod wwwauth;

use bytes::Bytes;
use oci_spec::image::Digest;

pub use auth::{Auth, AuthMap};
pub use client::Client;

/// Raw manifest bytes plus the digest they were served/validated under.
pub struct ManifestResponse {
    pub(crate) digest: Digest,
    pub(crate) data: Bytes,
}

impl ManifestResponse {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Transport(#[from] reqwest::Error),
    OciSpec(#[from] oci_spec::OciSpecError),
    AuthRequired,
    AuthDenied,
    NotFound,
    IntegrityMismatch,
    SizeMismatch,
    MalformedResponse(String),
    NoTagOrDigest,
    BadDigest,
    RatelimitExceeded,
    DigestAlgorithmNotHandled(String),
    StatusNotOk(u16),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
