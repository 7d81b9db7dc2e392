//! Path conventions for the CAS repository tree (spec §6): a layer/chain catalog rooted
//! under `.layers`/`.chains`, two-character digest-prefix fan-out, and a `.metadata` tree
//! holding per-image idempotency and backlink records.

use std::path::{Path, PathBuf};

const LAYERS_SUBDIR: &str = ".layers";
const CHAINS_SUBDIR: &str = ".chains";
const FLAT_SUBDIR: &str = ".flat";
const METADATA_SUBDIR: &str = ".metadata";

/// Root catalog directories that must exist (with catalog markers) before any layer or
/// chain is ingested, regardless of whether this particular conversion needs new layers.
pub fn bootstrap_catalog_dirs() -> [&'static str; 2] {
    [LAYERS_SUBDIR, FLAT_SUBDIR]
}

fn prefixed(subdir: &str, digest_hex: &str) -> PathBuf {
    let prefix = &digest_hex[..digest_hex.len().min(2)];
    Path::new(subdir).join(prefix).join(digest_hex)
}

/// Path (relative to the repo root) a layer's extracted rootfs is ingested into.
pub fn layer_rootfs_path(layer_digest_hex: &str) -> PathBuf {
    prefixed(LAYERS_SUBDIR, layer_digest_hex)
}

/// Path a chain artifact's merged rootfs is ingested into.
pub fn chain_path(chain_id_hex: &str) -> PathBuf {
    prefixed(CHAINS_SUBDIR, chain_id_hex)
}

/// The super-directory (two-char prefix dir) that needs its own catalog marker before a
/// layer/chain path under it is first created.
pub fn super_dir(leaf_path: &Path) -> Option<PathBuf> {
    leaf_path.parent().map(Path::to_path_buf)
}

fn simple_name_dir(simple_name: &str) -> PathBuf {
    Path::new(METADATA_SUBDIR).join(simple_name)
}

pub fn manifest_path(simple_name: &str) -> PathBuf {
    simple_name_dir(simple_name).join("manifest.json")
}

pub fn backlinks_path(simple_name: &str) -> PathBuf {
    simple_name_dir(simple_name).join("backlinks.json")
}

/// Queue consulted by the external removal sweeper: manifests enqueued here named a prior
/// config digest that a `NotMatch` reconversion superseded.
pub fn pending_removal_path(simple_name: &str) -> PathBuf {
    simple_name_dir(simple_name).join("pending_removal.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_rootfs_path_prefix() {
        let digest = "abcdef0123456789";
        assert_eq!(
            layer_rootfs_path(digest),
            Path::new(".layers/ab/abcdef0123456789")
        );
    }

    #[test]
    fn test_chain_path_prefix() {
        let chain_id = "00ff00ff";
        assert_eq!(chain_path(chain_id), Path::new(".chains/00/00ff00ff"));
    }

    #[test]
    fn test_super_dir() {
        let p = layer_rootfs_path("abcdef");
        assert_eq!(super_dir(&p), Some(PathBuf::from(".layers/ab")));
    }

    #[test]
    fn test_metadata_paths() {
        assert_eq!(
            manifest_path("library/debian"),
            Path::new(".metadata/library/debian/manifest.json")
        );
        assert_eq!(
            backlinks_path("library/debian"),
            Path::new(".metadata/library/debian/backlinks.json")
        );
        assert_eq!(
            pending_removal_path("library/debian"),
            Path::new(".metadata/library/debian/pending_removal.json")
        );
    }
}
