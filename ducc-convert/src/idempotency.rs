//! Idempotency Registry (spec.md §4.6): compares a freshly-resolved manifest's config digest
//! against whatever was last persisted for this image's simple name, so a conversion run that
//! has nothing new to do can skip straight to success. Grounded on `AlreadyConverted` in
//! `original_source/ducc/lib/conversion.go`.

use ducc_cas::{CasRepo, layout};

use crate::model::ImageMetadata;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No record exists yet for this image's simple name; this is a first-time conversion.
    NotFound,
    /// A record exists and its config digest matches; nothing to do.
    Match,
    /// A record exists but for a different config digest; the image moved and needs
    /// reconversion.
    NotMatch,
}

/// Reads the persisted record for `simple_name`, if any, and classifies it against
/// `new_config_digest`.
pub fn check(
    repo_driver: &dyn CasRepo,
    simple_name: &str,
    new_config_digest: &oci_spec::image::Digest,
) -> Result<Verdict, Error> {
    let path = layout::manifest_path(simple_name);
    if !repo_driver.path_exists(&path) {
        return Ok(Verdict::NotFound);
    }

    let existing = read_metadata(repo_driver, simple_name)?;
    if &existing.config_digest == new_config_digest {
        Ok(Verdict::Match)
    } else {
        Ok(Verdict::NotMatch)
    }
}

/// Reads back the persisted `ImageMetadata` record for `simple_name`. Callers should only
/// call this after `check` has already confirmed the record exists.
pub fn read_metadata(
    repo_driver: &dyn CasRepo,
    simple_name: &str,
) -> Result<ImageMetadata, Error> {
    let path = layout::manifest_path(simple_name);
    let bytes = repo_driver.read_file(&path)?;
    serde_json::from_slice(&bytes).map_err(Error::Json)
}

/// Persists `metadata` as the new idempotency record for its simple name, overwriting
/// whatever was there before. Runs inside its own transaction, matching the per-layer
/// transaction-scope decision: the record write is the final step of a conversion run, not
/// bundled into any individual layer or chain's transaction.
pub fn write_metadata(repo_driver: &dyn CasRepo, metadata: &ImageMetadata) -> Result<(), Error> {
    let path = layout::manifest_path(&metadata.simple_name);
    let bytes = serde_json::to_vec_pretty(metadata).map_err(Error::Json)?;

    repo_driver.begin()?;
    match repo_driver.write_file(&path, &bytes) {
        Ok(()) => {
            repo_driver.commit()?;
            Ok(())
        }
        Err(e) => Err(Error::Cas(ducc_cas::repo::recover(repo_driver, &path, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ducc_cas::MemCasRepo;
    use std::str::FromStr;

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
    fn test_not_found_when_nothing_persisted_yet() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_driver = MemCasRepo::new(tmp.path());
        let digest = oci_spec::image::Digest::from_str(
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        assert_eq!(
            check(&repo_driver, "library/debian", &digest).unwrap(),
            Verdict::NotFound
        );
    }

    #[test]
    fn test_match_and_not_match() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_driver = MemCasRepo::new(tmp.path());
        let metadata =
            sample_metadata("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        write_metadata(&repo_driver, &metadata).unwrap();

        let same = metadata.config_digest.clone();
        assert_eq!(
            check(&repo_driver, "library/debian", &same).unwrap(),
            Verdict::Match
        );

        let different = oci_spec::image::Digest::from_str(
            "sha256:cb8379ac2098aa165029e3938a51da0bcecfc008fd6795f401178647f96c5b34",
        )
        .unwrap();
        assert_eq!(
            check(&repo_driver, "library/debian", &different).unwrap(),
            Verdict::NotMatch
        );
    }
}
