//! Data model (spec.md §3): the image reference being converted, the manifest it resolves
//! to, per-layer and per-chain artifacts, and the resulting image metadata record.

use std::fmt;

use oci_spec::distribution::Reference;
use oci_spec::image::{Digest, ImageManifest};
use serde::{Deserialize, Serialize};

use ducc_registry::Auth;

use crate::Error;

/// An image to convert, plus any credentials the caller wants used for just this
/// conversion (falling back to the env-var resolution order in `ducc_registry::auth` when
/// `auth` is `None`).
#[derive(Clone)]
pub struct ImageRef {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
    auth: Option<Auth>,
}

impl ImageRef {
    pub fn parse(whole_name: &str) -> Result<Self, Error> {
        let reference: Reference = whole_name
            .parse()
            .map_err(|_| Error::BadImageRef(whole_name.to_string()))?;
        Ok(Self {
            registry: reference.resolve_registry().to_string(),
            repository: reference.repository().to_string(),
            tag: reference.tag().map(str::to_string),
            digest: reference.digest().map(str::to_string),
            auth: None,
        })
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// `<repository>` with any `library/` Docker Hub prefix left intact, used as the
    /// idempotency/backlink key's leading path component (matches `Image.GetSimpleName`
    /// in `original_source/ducc/lib/image.go`).
    pub fn simple_name(&self) -> String {
        self.repository.clone()
    }

    /// `<repository>:<tag>`, `<repository>@<digest>`, or `<repository>:<tag>@<digest>`.
    pub fn whole_name(&self) -> String {
        match (&self.tag, &self.digest) {
            (Some(tag), Some(digest)) => format!("{}:{tag}@{digest}", self.repository),
            (Some(tag), None) => format!("{}:{tag}", self.repository),
            (None, Some(digest)) => format!("{}@{digest}", self.repository),
            (None, None) => self.repository.clone(),
        }
    }

    pub fn to_reference(&self) -> Result<Reference, Error> {
        format!("{}/{}", self.registry, self.whole_name())
            .parse()
            .map_err(|_| Error::BadImageRef(self.whole_name()))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.whole_name())
    }
}

/// A resolved manifest plus the config digest used for idempotency comparisons.
pub struct Manifest {
    manifest: ImageManifest,
    config_digest: Digest,
}

impl Manifest {
    pub fn new(manifest: ImageManifest) -> Self {
        let config_digest = manifest.config().digest().clone();
        Self {
            manifest,
            config_digest,
        }
    }

    pub fn inner(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn config_digest(&self) -> &Digest {
        &self.config_digest
    }

    pub fn layer_count(&self) -> usize {
        self.manifest.layers().len()
    }
}

/// Recursive chain ID per the OCI/Docker layer-chain convention:
/// `chainID(0) = diffID(0)`, `chainID(i) = sha256(chainID(i-1) + " " + diffID(i))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId([u8; 32]);

impl ChainId {
    pub fn first(diff_id: &Digest) -> Result<Self, Error> {
        Ok(Self(decode_sha256(diff_id)?))
    }

    pub fn next(&self, diff_id: &Digest) -> Result<Self, Error> {
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.to_hex());
        hasher.update(b" ");
        hasher.update(diff_id.digest());
        Ok(Self(hasher.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn decode_sha256(digest: &Digest) -> Result<[u8; 32], Error> {
    let bytes =
        hex::decode(digest.digest()).map_err(|_| Error::BadDigestEncoding(digest.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::BadDigestEncoding(digest.to_string()))
}

/// One downloaded, decompressed layer: its compressed-blob digest (the manifest descriptor's
/// digest), its decompressed diffID, size, and position in the manifest's layer list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerArtifact {
    pub index: usize,
    pub layer_digest: Digest,
    pub diff_id: Digest,
    pub uncompressed_size: u64,
}

/// A materialized overlay of layers `0..=index`, content-addressed by its chain ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainArtifact {
    pub index: usize,
    pub chain_id: ChainId,
    pub parent_chain_id: Option<ChainId>,
    pub layer_digest: Digest,
}

/// The idempotency/backlink record persisted at `.metadata/<simple_name>/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub simple_name: String,
    pub whole_name: String,
    pub config_digest: Digest,
    pub layers: Vec<LayerArtifact>,
    pub chains: Vec<ChainArtifact>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_image_ref_whole_name_variants() {
        let r = ImageRef::parse("docker.io/library/debian:bookworm").unwrap();
        assert_eq!(r.whole_name(), "library/debian:bookworm");
        assert_eq!(r.registry(), "registry-1.docker.io");
    }

    #[test]
    fn test_chain_id_first_matches_diff_id() {
        let diff_id = Digest::from_str(
            "sha256:000000000000000000000000000000000000000000000000000000000000000a",
        )
        .unwrap();
        let chain = ChainId::first(&diff_id).unwrap();
        assert_eq!(
            chain.to_hex(),
            "000000000000000000000000000000000000000000000000000000000000000a"
        );
    }

    #[test]
    fn test_chain_id_next_is_deterministic() {
        let d0 = Digest::from_str(
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        let d1 = Digest::from_str(
            "sha256:cb8379ac2098aa165029e3938a51da0bcecfc008fd6795f401178647f96c5b34",
        )
        .unwrap();
        let c0 = ChainId::first(&d0).unwrap();
        let c1a = c0.next(&d1).unwrap();
        let c1b = c0.next(&d1).unwrap();
        assert_eq!(c1a, c1b);
        assert_ne!(c0, c1a);
    }
}
