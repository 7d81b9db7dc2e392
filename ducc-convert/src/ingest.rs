//! Ingestion Pipeline (spec.md §4.4): the orchestrator that ties the Registry Client, Layer
//! Downloader, Chain Builder and Idempotency Registry together into one conversion run.
//! Ported from `convertInputOutput` in `original_source/ducc/lib/conversion.go`: that
//! function's goroutine-and-channel fan-out (`layersChanell`, `layerRepoLocationChan`,
//! `layerDigestChan`, `stopGettingLayers`) becomes a `tokio::task::JoinSet` fan-out plus a
//! `CancellationToken`, following the indexed-`JoinSet` aggregation pattern used for
//! concurrent registry fetches in `peoci::ocidist_cache`.

use std::path::Path;

use log::{info, warn};
use oci_spec::distribution::Reference;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ducc_cas::{CasRepo, layout};
use ducc_registry::Client as RegistryClient;

use crate::backlink::{BacklinkSink, CasBacklinkSink};
use crate::chain;
use crate::download::{self, DownloadedLayer};
use crate::idempotency::{self, Verdict};
use crate::model::{ChainArtifact, ImageMetadata, ImageRef, LayerArtifact, Manifest};
use crate::removal::{CasRemovalScheduler, RemovalScheduler};
use crate::Error;

/// Result of running one conversion: either it was skipped because the idempotency check
/// found a matching record, or it ran to completion and produced fresh metadata.
pub enum Outcome {
    Skipped,
    Converted(ImageMetadata),
}

/// Runs one image conversion end to end: resolve the manifest, check idempotency, download
/// and chain any layers not already present, and persist the resulting metadata record.
///
/// `force` mirrors `forceDownload` in the original: when true, already-ingested layer paths
/// are re-downloaded and re-ingested rather than skipped.
pub async fn convert(
    registry: &RegistryClient,
    repo_driver: &dyn CasRepo,
    image: &ImageRef,
    force: bool,
    cancel: &CancellationToken,
) -> Result<Outcome, Error> {
    if let Some(auth) = image.auth() {
        registry.set_auth_for(image.registry(), auth.clone());
    }

    for dir in layout::bootstrap_catalog_dirs() {
        let path = Path::new(dir);
        if !repo_driver.path_exists(path) {
            repo_driver.create_catalog_marker(path)?;
        }
    }

    let reference: Reference = image.to_reference()?;
    let manifest_response = registry
        .get_image_manifest(&reference)
        .await?
        .ok_or(Error::Registry(ducc_registry::Error::NotFound))?;
    let manifest = Manifest::new(manifest_response.parse()?);

    let simple_name = image.simple_name();
    let mut prior_for_removal: Option<ImageMetadata> = None;
    match idempotency::check(repo_driver, &simple_name, manifest.config_digest())? {
        Verdict::Match if !force => {
            info!("image {simple_name} already converted, skipping");
            return Ok(Outcome::Skipped);
        }
        Verdict::Match => info!("image {simple_name} already converted, reconverting anyway"),
        Verdict::NotFound => info!("first conversion of {simple_name}"),
        Verdict::NotMatch => {
            info!("{simple_name} moved to a new config digest, reconverting");
            prior_for_removal = Some(idempotency::read_metadata(repo_driver, &simple_name)?);
        }
    }

    let layers = download_layers(registry, &reference, &manifest, cancel).await?;
    if cancel.is_cancelled() {
        warn!("conversion of {simple_name} cancelled after layer download");
        return Err(Error::Registry(ducc_registry::Error::NotFound));
    }

    for layer in &layers {
        ingest_layer(repo_driver, layer, force)?;
    }

    let diff_ids: Vec<_> = layers.iter().map(|l| l.diff_id.clone()).collect();
    let chain_tars: Vec<(oci_spec::image::Digest, Vec<u8>)> = layers
        .iter()
        .map(|l| (l.layer_digest.clone(), l.data.clone()))
        .collect();
    let chains: Vec<ChainArtifact> =
        chain::create_chain_standard(repo_driver, &chain_tars, &diff_ids)?;

    let metadata = ImageMetadata {
        simple_name: simple_name.clone(),
        whole_name: image.whole_name(),
        config_digest: manifest.config_digest().clone(),
        layers: layers
            .iter()
            .enumerate()
            .map(|(index, l)| LayerArtifact {
                index,
                layer_digest: l.layer_digest.clone(),
                diff_id: l.diff_id.clone(),
                uncompressed_size: l.uncompressed_size,
            })
            .collect(),
        chains,
    };

    finalize(repo_driver, &simple_name, &metadata, prior_for_removal.as_ref())?;

    Ok(Outcome::Converted(metadata))
}

/// Steps 7 and 8 of the Ingestion Pipeline protocol: persist the backlink index, commit the
/// new idempotency record, and — if the prior classification was `NotMatch` — enqueue the
/// superseded manifest on the removal scheduler. Order matches `convertInputOutput`: the new
/// manifest is written via `IngestIntoCVMFS` before `AddManifestToRemoveScheduler` runs.
fn finalize(
    repo_driver: &dyn CasRepo,
    simple_name: &str,
    metadata: &ImageMetadata,
    prior_for_removal: Option<&ImageMetadata>,
) -> Result<(), Error> {
    let layer_digests: Vec<_> = metadata.layers.iter().map(|l| l.layer_digest.clone()).collect();
    CasBacklinkSink::new(repo_driver).record(simple_name, &layer_digests)?;
    idempotency::write_metadata(repo_driver, metadata)?;

    if let Some(prior) = prior_for_removal {
        info!("scheduling removal of prior manifest for {simple_name}");
        CasRemovalScheduler::new(repo_driver).schedule(simple_name, prior)?;
    }

    Ok(())
}

struct FetchedLayer {
    layer_digest: oci_spec::image::Digest,
    diff_id: oci_spec::image::Digest,
    uncompressed_size: u64,
    data: Vec<u8>,
}

/// Fans out one download task per layer, collecting results back in manifest order via an
/// indexed `JoinSet` rather than the original's ordered channel pair
/// (`layerRepoLocationChan`/`layerDigestChan`).
async fn download_layers(
    registry: &RegistryClient,
    reference: &Reference,
    manifest: &Manifest,
    cancel: &CancellationToken,
) -> Result<Vec<FetchedLayer>, Error> {
    let mut set: JoinSet<(usize, Result<DownloadedLayer, Error>)> = JoinSet::new();
    for (index, descriptor) in manifest.inner().layers().iter().enumerate() {
        let registry = registry.clone();
        let reference = reference.clone();
        let descriptor = descriptor.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            if cancel.is_cancelled() {
                return (index, Err(Error::Registry(ducc_registry::Error::NotFound)));
            }
            (index, download::download_layer(&registry, &reference, &descriptor).await)
        });
    }

    let mut results: Vec<Option<FetchedLayer>> = (0..manifest.layer_count()).map(|_| None).collect();
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let (index, result) = joined.map_err(|_| Error::Registry(ducc_registry::Error::NotFound))?;
        match result {
            Ok(layer) => {
                results[index] = Some(FetchedLayer {
                    layer_digest: manifest.inner().layers()[index].digest().clone(),
                    diff_id: layer.diff_id,
                    uncompressed_size: layer.uncompressed_size,
                    data: layer.data,
                });
            }
            Err(e) => {
                cancel.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(results.into_iter().map(Option::unwrap).collect())
}

fn ingest_layer(repo_driver: &dyn CasRepo, layer: &FetchedLayer, force: bool) -> Result<(), Error> {
    let dest = layout::layer_rootfs_path(layer.layer_digest.digest());
    if repo_driver.path_exists(&dest) && !force {
        return Ok(());
    }

    ducc_cas::repo::ensure_catalog_markers(repo_driver, &dest)?;
    repo_driver.begin()?;
    match repo_driver.ingest_tar(&dest, &mut std::io::Cursor::new(layer.data.clone())) {
        Ok(()) => {
            repo_driver.commit()?;
            Ok(())
        }
        Err(e) => Err(Error::Cas(ducc_cas::repo::recover(repo_driver, &dest, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ducc_cas::MemCasRepo;
    use std::str::FromStr;

    #[test]
    fn test_chain_ids_helper_is_reexported() {
        let d = oci_spec::image::Digest::from_str(
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        let ids = chain::chain_ids(&[d]).unwrap();
        assert_eq!(ids.len(), 1);
    }

    fn sample_metadata(config_digest_hex: &str) -> ImageMetadata {
        ImageMetadata {
            simple_name: "library/debian".to_string(),
            whole_name: "library/debian:bookworm".to_string(),
            config_digest: oci_spec::image::Digest::from_str(&format!(
                "sha256:{config_digest_hex}"
            ))
            .unwrap(),
            layers: Vec::new(),
            chains: Vec::new(),
        }
    }

    #[test]
    fn test_finalize_without_prior_does_not_schedule_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_driver = MemCasRepo::new(tmp.path());
        let metadata =
            sample_metadata("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");

        finalize(&repo_driver, "library/debian", &metadata, None).unwrap();

        assert!(repo_driver.path_exists(&layout::manifest_path("library/debian")));
        assert!(!repo_driver.path_exists(&layout::pending_removal_path("library/debian")));
    }

    #[test]
    fn test_finalize_with_prior_enqueues_removal_and_commits_new_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_driver = MemCasRepo::new(tmp.path());
        let prior =
            sample_metadata("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        let fresh =
            sample_metadata("cb8379ac2098aa165029e3938a51da0bcecfc008fd6795f401178647f96c5b34");

        finalize(&repo_driver, "library/debian", &fresh, Some(&prior)).unwrap();

        let verdict = idempotency::check(
            &repo_driver,
            "library/debian",
            &fresh.config_digest,
        )
        .unwrap();
        assert_eq!(verdict, Verdict::Match);

        let queued = repo_driver
            .read_file(&layout::pending_removal_path("library/debian"))
            .unwrap();
        let queued = String::from_utf8(queued).unwrap();
        assert!(queued.contains("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"));
    }
}
